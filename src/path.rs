// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Payment paths and the coordinator's per-path negotiation progress.

use crate::base::{NodeId, TrustLineAmount};
use crate::error::PaymentError;
use num_traits::Zero;
use std::fmt;

/// Ordered node sequence, sender first and receiver last.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Path(Vec<NodeId>);

impl Path {
    pub fn new(nodes: Vec<NodeId>) -> Self {
        Self(nodes)
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn source(&self) -> Option<&NodeId> {
        self.0.first()
    }

    pub fn destination(&self) -> Option<&NodeId> {
        self.0.last()
    }

    /// Nodes strictly between sender and receiver.
    pub fn intermediates(&self) -> &[NodeId] {
        if self.0.len() < 2 {
            return &[];
        }
        &self.0[1..self.0.len() - 1]
    }

    pub fn position_of(&self, node: &NodeId) -> Option<usize> {
        self.0.iter().position(|n| n == node)
    }

    pub fn node_at(&self, position: usize) -> Option<&NodeId> {
        self.0.get(position)
    }

    /// At least two nodes, none of them repeated.
    pub fn is_valid(&self) -> bool {
        if self.0.len() < 2 {
            return false;
        }
        self.0
            .iter()
            .enumerate()
            .all(|(i, node)| !self.0[i + 1..].contains(node))
    }

    /// Consecutive node pairs, i.e. the trust lines the path crosses.
    pub fn edges(&self) -> impl Iterator<Item = (&NodeId, &NodeId)> {
        self.0.windows(2).map(|pair| (&pair[0], &pair[1]))
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{node}")?;
        }
        Ok(())
    }
}

/// Negotiation state of one intermediate node, as tracked by the coordinator.
///
/// States only move forward. `ReservationRejected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    NotProcessed,
    NeighbourReservationRequestSent,
    NeighbourReservationApproved,
    ReservationRequestSent,
    ReservationApproved,
    ReservationRejected,
}

/// Progress of amount reservation along one path.
#[derive(Debug, Clone)]
pub struct PathStats {
    path: Path,
    /// One entry per intermediate node, index 0 is path position 1.
    states: Vec<NodeState>,
    max_flow: Option<TrustLineAmount>,
    usable: bool,
}

impl PathStats {
    pub fn new(path: Path) -> Self {
        let states = vec![NodeState::NotProcessed; path.intermediates().len()];
        Self {
            path,
            states,
            max_flow: None,
            usable: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_direct(&self) -> bool {
        self.path.len() == 2
    }

    /// Amount the path can carry so far; zero until the first reservation.
    pub fn max_flow(&self) -> TrustLineAmount {
        self.max_flow.clone().unwrap_or_else(TrustLineAmount::zero)
    }

    /// Lowers the path's max flow. Larger values are ignored.
    pub fn shortage_max_flow(&mut self, amount: TrustLineAmount) {
        match &self.max_flow {
            Some(current) if *current <= amount => {}
            _ => self.max_flow = Some(amount),
        }
    }

    pub fn is_usable(&self) -> bool {
        self.usable
    }

    /// Permanently excludes the path from further processing.
    pub fn set_unusable(&mut self) {
        self.usable = false;
    }

    pub fn node_state(&self, position: usize) -> Option<NodeState> {
        position
            .checked_sub(1)
            .and_then(|index| self.states.get(index))
            .copied()
    }

    /// Moves the intermediate node at `position` to `state`.
    ///
    /// # Errors
    ///
    /// Fails when `position` is not an intermediate node or when the
    /// transition would go backwards.
    pub fn set_node_state(&mut self, position: usize, state: NodeState) -> Result<(), PaymentError> {
        let index = position
            .checked_sub(1)
            .filter(|index| *index < self.states.len())
            .ok_or(PaymentError::InvariantViolation("position is not an intermediate node"))?;
        if state < self.states[index] {
            return Err(PaymentError::InvariantViolation("node state can't go backwards"));
        }
        self.states[index] = state;
        Ok(())
    }

    /// Next intermediate node that still needs a request, with its path position.
    ///
    /// The first neighbor is returned twice: once for its own reservation
    /// and once more to ask it to reserve toward the following node.
    pub fn next_intermediate_node_and_position(&self) -> Result<(NodeId, usize), PaymentError> {
        let index = self
            .states
            .iter()
            .position(|state| {
                matches!(
                    state,
                    NodeState::NotProcessed | NodeState::NeighbourReservationApproved
                )
            })
            .ok_or(PaymentError::PathExhausted)?;
        let node = self.path.intermediates()[index];
        Ok((node, index + 1))
    }

    /// Intermediate node most recently asked, with its path position.
    pub fn current_intermediate_node_and_position(&self) -> Result<(NodeId, usize), PaymentError> {
        let index = self
            .states
            .iter()
            .rposition(|state| *state != NodeState::NotProcessed)
            .ok_or(PaymentError::PathExhausted)?;
        let node = self.path.intermediates()[index];
        Ok((node, index + 1))
    }

    pub fn is_last_intermediate_node_processed(&self) -> bool {
        self.states
            .last()
            .is_some_and(|state| *state == NodeState::ReservationApproved)
    }

    pub fn is_waiting_for_neighbor_reservation_response(&self) -> bool {
        self.states.first() == Some(&NodeState::NeighbourReservationRequestSent)
    }

    pub fn is_waiting_for_neighbor_reservation_propagation_response(&self) -> bool {
        self.states.first() == Some(&NodeState::ReservationRequestSent)
    }

    pub fn is_waiting_for_reservation_response(&self) -> bool {
        self.states
            .iter()
            .skip(1)
            .any(|state| *state == NodeState::ReservationRequestSent)
    }
}
