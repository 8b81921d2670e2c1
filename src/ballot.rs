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

//! Participants-votes ballot.
//!
//! The coordinator fills the ballot with every participant holding a final
//! amount configuration, then the ballot travels node to node in insertion
//! order. Each participant sets its own vote and forwards it; the last one
//! returns it to the coordinator, which appends itself as approved and
//! broadcasts the result as proof for the commit.

use crate::base::NodeId;
use crate::error::PaymentError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A participant's decision on the payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vote {
    Approved,
    Rejected,
    Uncertain,
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vote::Approved => f.write_str("approved"),
            Vote::Rejected => f.write_str("rejected"),
            Vote::Uncertain => f.write_str("uncertain"),
        }
    }
}

/// Ordered, append-only set of participants and their votes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParticipantsVotes {
    coordinator: NodeId,
    votes: Vec<(NodeId, Vote)>,
}

impl ParticipantsVotes {
    pub fn new(coordinator: NodeId) -> Self {
        Self {
            coordinator,
            votes: Vec::new(),
        }
    }

    /// Ballot meaning "still processing, ask again later".
    pub fn undecided() -> Self {
        Self::default()
    }

    /// Ballot a node sends about a payment it holds no record of.
    ///
    /// The responder votes `Rejected`, so the requester rolls back.
    pub fn rejection(responder: NodeId, requester: NodeId) -> Self {
        let mut ballot = Self::new(responder);
        ballot.votes.push((responder, Vote::Rejected));
        if requester != responder {
            ballot.votes.push((requester, Vote::Uncertain));
        }
        ballot
    }

    pub fn coordinator(&self) -> &NodeId {
        &self.coordinator
    }

    pub fn is_undecided(&self) -> bool {
        self.coordinator.is_empty()
    }

    pub fn votes(&self) -> &[(NodeId, Vote)] {
        &self.votes
    }

    pub fn participants(&self) -> impl Iterator<Item = &NodeId> {
        self.votes.iter().map(|(node, _)| node)
    }

    pub fn participants_count(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Appends `participant` with an uncertain vote.
    ///
    /// Returns false, leaving the ballot untouched, if it is already listed.
    pub fn add_participant(&mut self, participant: NodeId) -> bool {
        if self.contains_participant(&participant) {
            return false;
        }
        self.votes.push((participant, Vote::Uncertain));
        true
    }

    pub fn contains_participant(&self, node: &NodeId) -> bool {
        self.votes.iter().any(|(n, _)| n == node)
    }

    pub fn vote(&self, participant: &NodeId) -> Option<Vote> {
        self.votes
            .iter()
            .find(|(node, _)| node == participant)
            .map(|(_, vote)| *vote)
    }

    pub fn first_participant(&self) -> Option<&NodeId> {
        self.votes.first().map(|(node, _)| node)
    }

    /// Participant following `current` in forwarding order, `None` after the last one.
    pub fn next_participant(&self, current: &NodeId) -> Result<Option<&NodeId>, PaymentError> {
        let index = self
            .votes
            .iter()
            .position(|(node, _)| node == current)
            .ok_or(PaymentError::ParticipantNotFound(*current))?;
        Ok(self.votes.get(index + 1).map(|(node, _)| node))
    }

    fn slot(&mut self, participant: &NodeId) -> Result<&mut Vote, PaymentError> {
        self.votes
            .iter_mut()
            .find(|(node, _)| node == participant)
            .map(|(_, vote)| vote)
            .ok_or(PaymentError::ParticipantNotFound(*participant))
    }

    /// Records an approval. A rejection can't be turned into an approval.
    pub fn approve(&mut self, participant: &NodeId) -> Result<(), PaymentError> {
        let vote = self.slot(participant)?;
        if *vote == Vote::Rejected {
            return Err(PaymentError::InvariantViolation("rejected vote can't be approved"));
        }
        *vote = Vote::Approved;
        Ok(())
    }

    pub fn reject(&mut self, participant: &NodeId) -> Result<(), PaymentError> {
        *self.slot(participant)? = Vote::Rejected;
        Ok(())
    }

    pub fn contains_reject_vote(&self) -> bool {
        self.votes.iter().any(|(_, vote)| *vote == Vote::Rejected)
    }

    /// Every listed participant approved.
    pub fn achieved_consensus(&self) -> bool {
        !self.votes.is_empty() && self.votes.iter().all(|(_, vote)| *vote == Vote::Approved)
    }

    /// Consensus reached and sealed by the coordinator's own approval.
    ///
    /// Only a ballot in this state may be used as proof for a commit.
    pub fn is_final(&self) -> bool {
        self.achieved_consensus() && self.vote(&self.coordinator) == Some(Vote::Approved)
    }

    /// Same participants in the same order; votes are not compared.
    pub fn has_same_participants(&self, other: &ParticipantsVotes) -> bool {
        self.coordinator == other.coordinator
            && self.votes.len() == other.votes.len()
            && self
                .participants()
                .zip(other.participants())
                .all(|(a, b)| a == b)
    }

    /// True if `self` is `earlier` with extra participants appended at the end.
    pub fn extends(&self, earlier: &ParticipantsVotes) -> bool {
        self.coordinator == earlier.coordinator
            && self.votes.len() >= earlier.votes.len()
            && self
                .participants()
                .zip(earlier.participants())
                .all(|(a, b)| a == b)
    }
}
