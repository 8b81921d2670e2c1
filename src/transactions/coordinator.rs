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

//! Coordinator side of a payment.
//!
//! The coordinator turns a payment command into reservations along one or
//! more paths, distributes the final amounts, collects votes and commits.
//! Paths are processed one at a time from a queue. Switching to the next
//! path returns to the top of [`CoordinatorPaymentTransaction::run`]
//! instead of recursing, so the number of paths tried never grows the
//! stack.

use crate::ballot::ParticipantsVotes;
use crate::base::{NodeId, PathId, TransactionId, TrustLineAmount};
use crate::error::PaymentError;
use crate::messages::{MessageBody, MessageType, PathAmounts, ReservationState, TtlState, Verdict};
use crate::path::{NodeState, Path, PathStats};
use crate::reservations::ReservationDirection;
use crate::result::{PaymentOutcome, Resource, ResourceType, TransactionResult};
use crate::storage::PaymentKind;
use crate::transactions::base::{BasePaymentTransaction, Stage, TransactionContext, TransactionKind};
use num_traits::Zero;
use std::cmp::min;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sub-steps of the amount reservation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReservationsStage {
    InitNextPath,
    Dispatch,
    TryNextPath,
}

/// What the `run` loop does after a stage step.
#[derive(Debug)]
enum Flow {
    /// Hand the result to the scheduler.
    Yield(TransactionResult),
    /// Stage changed without waiting; run the loop again.
    Continue,
}

type StepResult = Result<Flow, PaymentError>;

#[derive(Debug)]
pub struct CoordinatorPaymentTransaction {
    base: BasePaymentTransaction,
    receiver: NodeId,
    amount: TrustLineAmount,
    paths: BTreeMap<PathId, PathStats>,
    /// Front is the path being negotiated.
    paths_queue: VecDeque<PathId>,
    next_path_id: u16,
    reservations_stage: ReservationsStage,
    direct_path_processed: bool,
    direct_request_sent: bool,
    receiver_accepted: bool,
    inaccessible_nodes: BTreeSet<NodeId>,
    rejected_trust_lines: Vec<(NodeId, NodeId)>,
    /// Sizes of the two sets above at the last path rebuild.
    rebuild_marks: (usize, usize),
    receiver_inaccessible_count: u32,
    final_amounts: BTreeMap<NodeId, PathAmounts>,
    final_amounts_confirmations: BTreeMap<NodeId, bool>,
}

impl CoordinatorPaymentTransaction {
    pub fn new(
        ctx: TransactionContext,
        id: TransactionId,
        receiver: NodeId,
        amount: TrustLineAmount,
    ) -> Self {
        let node = ctx.node;
        let mut base = BasePaymentTransaction::new(
            ctx,
            id,
            TransactionKind::Coordinator,
            Stage::Initialisation,
        );
        base.coordinator = Some(node);
        base.history_entry = Some((PaymentKind::Outgoing, receiver));
        Self {
            base,
            receiver,
            amount,
            paths: BTreeMap::new(),
            paths_queue: VecDeque::new(),
            next_path_id: 0,
            reservations_stage: ReservationsStage::InitNextPath,
            direct_path_processed: false,
            direct_request_sent: false,
            receiver_accepted: false,
            inaccessible_nodes: BTreeSet::new(),
            rejected_trust_lines: Vec::new(),
            rebuild_marks: (0, 0),
            receiver_inaccessible_count: 0,
            final_amounts: BTreeMap::new(),
            final_amounts_confirmations: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.base.id
    }

    pub fn receiver(&self) -> NodeId {
        self.receiver
    }

    pub fn amount(&self) -> &TrustLineAmount {
        &self.amount
    }

    pub(crate) fn base(&self) -> &BasePaymentTransaction {
        &self.base
    }

    pub(crate) fn base_mut(&mut self) -> &mut BasePaymentTransaction {
        &mut self.base
    }

    pub fn run(&mut self) -> TransactionResult {
        if let Some(result) = self.answer_ttl_request() {
            return result;
        }
        loop {
            debug!(
                transaction = %self.base.id,
                stage = ?self.base.stage,
                reservations_stage = ?self.reservations_stage,
                "coordinator run"
            );
            let step = match self.base.stage {
                Stage::Initialisation => self.run_initialisation_stage(),
                Stage::PathsResourceProcessing => self.run_paths_resource_processing_stage(),
                Stage::ReceiverResponseProcessing => self.run_receiver_response_processing_stage(),
                Stage::AmountReservation => self.run_amount_reservation_stage(),
                Stage::FinalAmountsConfigurationConfirmation => {
                    self.run_final_amounts_configuration_confirmation_stage()
                }
                Stage::VotesChecking => self.run_votes_checking_stage(),
                _ => Err(PaymentError::InvalidStage),
            };
            match step {
                Ok(Flow::Continue) => continue,
                Ok(Flow::Yield(result)) => return result,
                Err(error) => return self.on_unexpected_error(error),
            }
        }
    }

    // ===================================================================
    // Terminal transitions
    // ===================================================================

    fn on_unexpected_error(&mut self, error: PaymentError) -> TransactionResult {
        warn!(transaction = %self.base.id, %error, "coordinator failed");
        if self.base.ctx.storage.record_conducted(&self.base.id) {
            return TransactionResult::outcome(PaymentOutcome::Ok(self.base.id));
        }
        self.reject_with("unexpected error", PaymentOutcome::UnexpectedError)
    }

    /// Ends the transaction before anything was reserved or announced.
    fn finish(&self, outcome: PaymentOutcome) -> TransactionResult {
        self.base.ctx.path_finder.release(&self.base.id);
        info!(transaction = %self.base.id, %outcome, "payment finished");
        TransactionResult::outcome(outcome)
    }

    fn reject(&mut self, reason: &str) -> TransactionResult {
        self.reject_with(reason, PaymentOutcome::NoConsensus)
    }

    fn reject_with(&mut self, reason: &str, outcome: PaymentOutcome) -> TransactionResult {
        let had_ballot = self.base.ballot.is_some();
        self.base.reject(reason);
        if had_ballot {
            self.propagate_ballot_to_all_participants();
        } else {
            self.inform_all_nodes_about_transaction_finish();
        }
        self.finish(outcome)
    }

    /// Tells every node that may still wait for this payment that it is over.
    fn inform_all_nodes_about_transaction_finish(&self) {
        let mut nodes: BTreeSet<NodeId> = self.final_amounts.keys().copied().collect();
        if self.receiver_accepted {
            nodes.insert(self.receiver);
        }
        if let Some(stats) = self.paths_queue.front().and_then(|id| self.paths.get(id)) {
            nodes.extend(stats.path().intermediates().iter().copied());
        }
        for node in nodes {
            self.base.send(node, MessageBody::TtlProlongationResponse { state: TtlState::Finish });
        }
    }

    fn propagate_ballot_to_all_participants(&self) {
        let Some(ballot) = &self.base.ballot else {
            return;
        };
        let node = self.base.node();
        for participant in ballot.participants().filter(|p| **p != node) {
            self.base
                .send(*participant, MessageBody::ParticipantsVotes(ballot.clone()));
        }
    }

    /// Answers a liveness question without leaving the current wait.
    fn answer_ttl_request(&mut self) -> Option<TransactionResult> {
        if self.base.peek_message_type() != Some(MessageType::TtlProlongationRequest) {
            return None;
        }
        let sender = self.base.take_message()?.sender;
        let alive = match &self.base.ballot {
            Some(ballot) => ballot.contains_participant(&sender),
            None => {
                sender == self.receiver
                    || self.final_amounts.contains_key(&sender)
                    || self
                        .paths_queue
                        .front()
                        .and_then(|id| self.paths.get(id))
                        .is_some_and(|stats| stats.path().position_of(&sender).is_some())
            }
        };
        let state = if alive { TtlState::Continue } else { TtlState::Finish };
        debug!(transaction = %self.base.id, %sender, ?state, "ttl request answered");
        self.base
            .send(sender, MessageBody::TtlProlongationResponse { state });
        Some(TransactionResult::ContinuePreviousState)
    }

    // ===================================================================
    // Initialisation and paths
    // ===================================================================

    fn run_initialisation_stage(&mut self) -> StepResult {
        let node = self.base.node();
        if !self.base.config().payments_enabled {
            return Ok(Flow::Yield(self.finish(PaymentOutcome::ForbiddenRunTransaction)));
        }
        if self.receiver == node || self.amount.is_zero() {
            return Ok(Flow::Yield(self.finish(PaymentOutcome::ProtocolError)));
        }
        let available = self.base.ctx.trust_lines.total_available_outgoing();
        if available < self.amount {
            info!(
                transaction = %self.base.id,
                amount = %self.amount,
                available = %available,
                "not enough outgoing capacity"
            );
            return Ok(Flow::Yield(self.finish(PaymentOutcome::InsufficientFunds)));
        }
        info!(
            transaction = %self.base.id,
            receiver = %self.receiver,
            amount = %self.amount,
            "payment started"
        );
        self.base
            .ctx
            .path_finder
            .request_paths(self.base.id, node, self.receiver);
        self.base.stage = Stage::PathsResourceProcessing;
        Ok(Flow::Yield(TransactionResult::WaitForResources {
            types: vec![ResourceType::Paths],
            timeout: self.base.max_network_delay(4),
        }))
    }

    fn run_paths_resource_processing_stage(&mut self) -> StepResult {
        let Some(Resource::Paths(paths)) = self.base.take_resource() else {
            debug!(transaction = %self.base.id, "no paths resource");
            return Ok(Flow::Yield(self.finish(PaymentOutcome::NoRoutes)));
        };
        for path in paths {
            self.add_path(path);
        }
        let Some(first) = self.paths_queue.front().copied() else {
            return Ok(Flow::Yield(self.finish(PaymentOutcome::NoRoutes)));
        };
        self.base.send(
            self.receiver,
            MessageBody::ReceiverInitPaymentRequest {
                path_id: first,
                amount: self.amount.clone(),
            },
        );
        self.base.stage = Stage::ReceiverResponseProcessing;
        Ok(Flow::Yield(TransactionResult::wait_for_messages(
            &[
                MessageType::ReceiverInitPaymentResponse,
                MessageType::TtlProlongationRequest,
            ],
            self.base.max_network_delay(2),
        )))
    }

    /// Queues `path` unless it is malformed, too long, or already known.
    fn add_path(&mut self, path: Path) -> bool {
        let node = self.base.node();
        let well_formed = path.is_valid()
            && path.len() <= self.base.config().max_path_length
            && path.source() == Some(&node)
            && path.destination() == Some(&self.receiver);
        if !well_formed {
            debug!(transaction = %self.base.id, %path, "path skipped");
            return false;
        }
        if self.paths.values().any(|stats| stats.path() == &path) {
            return false;
        }
        let Some(next) = self.next_path_id.checked_add(1) else {
            return false;
        };
        let path_id = PathId(self.next_path_id);
        self.next_path_id = next;
        debug!(transaction = %self.base.id, path = %path_id, nodes = %path, "path added");
        self.paths.insert(path_id, PathStats::new(path));
        self.paths_queue.push_back(path_id);
        true
    }

    fn run_receiver_response_processing_stage(&mut self) -> StepResult {
        let Some(message) = self.base.take_message() else {
            return Ok(Flow::Yield(self.reject_with(
                "receiver didn't answer",
                PaymentOutcome::RemoteNodeInaccessible,
            )));
        };
        let MessageBody::ReceiverInitPaymentResponse { verdict, .. } = message.body else {
            return Err(PaymentError::UnexpectedMessage(message.message_type()));
        };
        if message.sender != self.receiver {
            return Ok(Flow::Yield(TransactionResult::ContinuePreviousState));
        }
        if verdict == Verdict::Rejected {
            return Ok(Flow::Yield(self.reject_with(
                "receiver refused the payment",
                PaymentOutcome::InsufficientFunds,
            )));
        }
        self.receiver_accepted = true;
        self.base.stage = Stage::AmountReservation;
        self.reservations_stage = ReservationsStage::InitNextPath;
        Ok(Flow::Continue)
    }

    // ===================================================================
    // Amount reservation
    // ===================================================================

    fn run_amount_reservation_stage(&mut self) -> StepResult {
        match self.reservations_stage {
            ReservationsStage::InitNextPath => {
                self.direct_request_sent = false;
                self.reservations_stage = if self.paths_queue.is_empty() {
                    ReservationsStage::TryNextPath
                } else {
                    ReservationsStage::Dispatch
                };
                Ok(Flow::Continue)
            }
            ReservationsStage::Dispatch => self.dispatch_reservation(),
            ReservationsStage::TryNextPath => self.try_process_next_path(),
        }
    }

    fn current_path_id(&self) -> Result<PathId, PaymentError> {
        self.paths_queue
            .front()
            .copied()
            .ok_or(PaymentError::NoPathsAvailable)
    }

    fn stats(&self, path_id: PathId) -> Result<&PathStats, PaymentError> {
        self.paths
            .get(&path_id)
            .ok_or(PaymentError::PathNotFound(path_id))
    }

    fn stats_mut(&mut self, path_id: PathId) -> Result<&mut PathStats, PaymentError> {
        self.paths
            .get_mut(&path_id)
            .ok_or(PaymentError::PathNotFound(path_id))
    }

    /// Amount already secured on completed paths.
    fn total_collected(&self) -> TrustLineAmount {
        self.final_amounts
            .get(&self.receiver)
            .map(|amounts| amounts.iter().map(|(_, amount)| amount.clone()).sum())
            .unwrap_or_else(TrustLineAmount::zero)
    }

    fn remaining(&self) -> TrustLineAmount {
        let collected = self.total_collected();
        if collected >= self.amount {
            TrustLineAmount::zero()
        } else {
            &self.amount - collected
        }
    }

    fn dispatch_reservation(&mut self) -> StepResult {
        let path_id = self.current_path_id()?;
        let stats = self.stats(path_id)?;
        if stats.is_direct() {
            return if self.direct_request_sent {
                self.process_direct_path_response(path_id)
            } else {
                self.reserve_on_direct_path(path_id)
            };
        }
        if stats.is_waiting_for_neighbor_reservation_response() {
            return self.process_neighbor_reservation_response(path_id);
        }
        if stats.is_waiting_for_neighbor_reservation_propagation_response()
            || stats.is_waiting_for_reservation_response()
        {
            return self.process_remote_node_response(path_id);
        }
        self.try_reserve_next_intermediate_node(path_id)
    }

    fn wait_for_reservation_response(&self, response: MessageType, hops: u32) -> Flow {
        Flow::Yield(TransactionResult::wait_for_messages(
            &[response, MessageType::TtlProlongationRequest],
            self.base.max_network_delay(hops),
        ))
    }

    fn final_amounts_for(&self, node: &NodeId) -> PathAmounts {
        self.final_amounts.get(node).cloned().unwrap_or_default()
    }

    fn add_final_amount(&mut self, node: NodeId, path_id: PathId, amount: TrustLineAmount) {
        self.final_amounts
            .entry(node)
            .or_default()
            .push((path_id, amount));
    }

    fn reject_trust_line(&mut self, from: NodeId, to: NodeId) {
        debug!(transaction = %self.base.id, %from, %to, "trust line rejected");
        self.rejected_trust_lines.push((from, to));
    }

    fn send_ttl_continue_to_receiver(&self) {
        self.base.send(
            self.receiver,
            MessageBody::TtlProlongationResponse {
                state: TtlState::Continue,
            },
        );
    }

    /// Marks the path unusable and frees what it holds.
    ///
    /// Intermediate nodes that were already asked get a zero final path
    /// amount. The last asked node is told only when
    /// `send_to_last_processed` is set, because a node that answered with a
    /// rejection has already freed its side.
    fn drop_reservations_on_path(&mut self, path_id: PathId, send_to_last_processed: bool) {
        let Some(stats) = self.paths.get_mut(&path_id) else {
            return;
        };
        stats.set_unusable();
        let path = stats.path().clone();
        let last_processed = stats
            .current_intermediate_node_and_position()
            .ok()
            .map(|(_, position)| position);
        debug!(transaction = %self.base.id, path = %path_id, "dropping path");

        if let Some(first) = path.node_at(1).copied()
            && self
                .base
                .reservation(&first, path_id, ReservationDirection::Outgoing)
                .is_some()
            && let Err(error) =
                self.base
                    .drop_reservation(&first, path_id, ReservationDirection::Outgoing)
        {
            warn!(transaction = %self.base.id, path = %path_id, %error, "can't free reservation");
        }

        let Some(last) = last_processed.filter(|_| path.len() > 2) else {
            return;
        };
        for position in 1..=last {
            if position == last && !send_to_last_processed {
                continue;
            }
            if let Some(node) = path.node_at(position) {
                self.base.send(
                    *node,
                    MessageBody::FinalPathConfiguration {
                        path_id,
                        amount: TrustLineAmount::zero(),
                    },
                );
            }
        }
    }

    /// Leaves the current path and moves to the next queued one.
    fn switch_to_next_path(&mut self) -> StepResult {
        self.direct_request_sent = false;
        let Some(processed_id) = self.paths_queue.pop_front() else {
            self.reservations_stage = ReservationsStage::TryNextPath;
            return Ok(Flow::Continue);
        };
        let processed = self.paths.get(&processed_id).cloned();
        if processed.as_ref().is_some_and(|stats| !stats.is_usable()) {
            self.paths.remove(&processed_id);
        }

        let Some(next_id) = self.paths_queue.front().copied() else {
            self.reservations_stage = ReservationsStage::TryNextPath;
            return Ok(Flow::Continue);
        };
        self.reservations_stage = ReservationsStage::InitNextPath;

        // The first node of the next path may still be busy with the
        // previous path if it was asked there as a remote node.
        let next_first = self
            .paths
            .get(&next_id)
            .filter(|stats| !stats.is_direct())
            .and_then(|stats| stats.path().node_at(1).copied());
        let busy = match (next_first, processed) {
            (Some(node), Some(stats)) => stats.path().position_of(&node).is_some_and(|position| {
                position > 1
                    && stats
                        .node_state(position)
                        .is_some_and(|state| state != NodeState::NotProcessed)
            }),
            _ => false,
        };
        if busy {
            return Ok(Flow::Yield(TransactionResult::AwakeAfter(
                self.base.max_network_delay(1),
            )));
        }
        Ok(Flow::Continue)
    }

    /// Rebuilds paths once the queue is empty, if anything was learned since the last build.
    fn try_process_next_path(&mut self) -> StepResult {
        let marks = (self.inaccessible_nodes.len(), self.rejected_trust_lines.len());
        if marks != self.rebuild_marks {
            let known = self.paths.len();
            self.build_paths_again();
            if self.paths.len() > known {
                debug!(
                    transaction = %self.base.id,
                    added = self.paths.len() - known,
                    "new paths built"
                );
                self.rebuild_marks = marks;
                self.direct_path_processed = false;
                self.reservations_stage = ReservationsStage::InitNextPath;
                return Ok(Flow::Continue);
            }
        }
        Ok(Flow::Yield(self.reject_with(
            "no paths left",
            PaymentOutcome::InsufficientFunds,
        )))
    }

    fn build_paths_again(&mut self) {
        let id = self.base.id;
        let finder = Arc::clone(&self.base.ctx.path_finder);
        finder.release(&id);
        for stats in self.paths.values() {
            for (from, to) in stats.path().edges() {
                finder.add_used_amount(id, *from, *to, stats.max_flow());
            }
        }
        for (from, to) in &self.rejected_trust_lines {
            finder.make_fully_used(id, *from, *to);
        }
        let paths = finder.rebuild_paths(id, self.base.node(), self.receiver, &self.inaccessible_nodes);
        for path in paths {
            self.add_path(path);
        }
    }

    // ===================================================================
    // Direct path
    // ===================================================================

    fn reserve_on_direct_path(&mut self, path_id: PathId) -> StepResult {
        if self.direct_path_processed {
            debug!(transaction = %self.base.id, path = %path_id, "direct path already processed");
            self.stats_mut(path_id)?.set_unusable();
            return self.switch_to_next_path();
        }
        self.direct_path_processed = true;

        let node = self.base.node();
        let receiver = self.receiver;
        let available = self.base.ctx.trust_lines.available_outgoing(&receiver);
        let amount = min(self.remaining(), available);
        if amount.is_zero() {
            self.reject_trust_line(node, receiver);
            self.stats_mut(path_id)?.set_unusable();
            return self.switch_to_next_path();
        }
        if let Err(error) =
            self.base
                .reserve(receiver, path_id, amount.clone(), ReservationDirection::Outgoing)
        {
            debug!(transaction = %self.base.id, %error, "can't reserve toward receiver");
            self.reject_trust_line(node, receiver);
            self.stats_mut(path_id)?.set_unusable();
            return self.switch_to_next_path();
        }
        self.stats_mut(path_id)?.shortage_max_flow(amount.clone());

        let mut reservations = vec![(path_id, amount)];
        reservations.extend(self.final_amounts_for(&receiver));
        self.base.send(
            receiver,
            MessageBody::IntermediateNodeReservationRequest { reservations },
        );
        self.direct_request_sent = true;
        Ok(self.wait_for_reservation_response(MessageType::IntermediateNodeReservationResponse, 2))
    }

    fn process_direct_path_response(&mut self, path_id: PathId) -> StepResult {
        let node = self.base.node();
        let receiver = self.receiver;
        let Some(message) = self.base.take_message() else {
            self.receiver_inaccessible_count += 1;
            warn!(
                transaction = %self.base.id,
                count = self.receiver_inaccessible_count,
                "receiver didn't answer reservation request"
            );
            self.drop_reservations_on_path(path_id, false);
            if self.receiver_inaccessible_count >= self.base.config().max_receiver_inaccessible {
                return Ok(Flow::Yield(self.reject_with(
                    "receiver is inaccessible",
                    PaymentOutcome::RemoteNodeInaccessible,
                )));
            }
            return self.switch_to_next_path();
        };
        let (state, amount) = match message.body {
            MessageBody::IntermediateNodeReservationResponse {
                path_id: response_path,
                state,
                amount,
            } if response_path == path_id && message.sender == receiver => (state, amount),
            _ => return Ok(Flow::Yield(TransactionResult::ContinuePreviousState)),
        };

        match state {
            ReservationState::Closed => Ok(Flow::Yield(
                self.reject("desynchronization in reservation with receiver"),
            )),
            ReservationState::Accepted if !amount.is_zero() => {
                if amount > self.stats(path_id)?.max_flow() {
                    return Ok(Flow::Yield(self.reject("receiver reserved more than requested")));
                }
                self.base.shorten_reservation(
                    &receiver,
                    path_id,
                    ReservationDirection::Outgoing,
                    amount.clone(),
                )?;
                self.stats_mut(path_id)?.shortage_max_flow(amount.clone());
                let total = self.total_collected() + &amount;
                if total > self.amount {
                    return Ok(Flow::Yield(
                        self.reject("total collected amount is greater than requested"),
                    ));
                }
                self.add_final_amount(receiver, path_id, amount);
                debug!(transaction = %self.base.id, path = %path_id, collected = %total, "direct path reserved");
                if total == self.amount {
                    return self.send_final_amounts_configuration();
                }
                self.switch_to_next_path()
            }
            _ => {
                self.drop_reservations_on_path(path_id, false);
                self.reject_trust_line(node, receiver);
                self.switch_to_next_path()
            }
        }
    }

    // ===================================================================
    // Paths with intermediate nodes
    // ===================================================================

    fn try_reserve_next_intermediate_node(&mut self, path_id: PathId) -> StepResult {
        let stats = self.stats(path_id)?;
        let (node, position) = match stats.next_intermediate_node_and_position() {
            Ok(next) => next,
            Err(_) => {
                self.stats_mut(path_id)?.set_unusable();
                return self.switch_to_next_path();
            }
        };
        if position == 1 && stats.node_state(1) == Some(NodeState::NotProcessed) {
            return self.reserve_on_first_intermediate_node(path_id, node);
        }
        self.request_further_reservation(path_id, node, position)
    }

    fn reserve_on_first_intermediate_node(&mut self, path_id: PathId, neighbor: NodeId) -> StepResult {
        let node = self.base.node();
        if !self.base.ctx.trust_lines.is_neighbor(&neighbor) {
            warn!(transaction = %self.base.id, %neighbor, "first path node is not a neighbor");
            self.reject_trust_line(node, neighbor);
            self.stats_mut(path_id)?.set_unusable();
            return self.switch_to_next_path();
        }
        let available = self.base.ctx.trust_lines.available_outgoing(&neighbor);
        let amount = min(self.remaining(), available);
        let reserved = !amount.is_zero()
            && self
                .base
                .reserve(neighbor, path_id, amount.clone(), ReservationDirection::Outgoing)
                .is_ok();
        if !reserved {
            self.reject_trust_line(node, neighbor);
            self.stats_mut(path_id)?.set_unusable();
            return self.switch_to_next_path();
        }

        let stats = self.stats_mut(path_id)?;
        stats.shortage_max_flow(amount.clone());
        stats.set_node_state(1, NodeState::NeighbourReservationRequestSent)?;

        let mut reservations = vec![(path_id, amount)];
        reservations.extend(self.final_amounts_for(&neighbor));
        self.base.send(
            neighbor,
            MessageBody::IntermediateNodeReservationRequest { reservations },
        );
        Ok(self.wait_for_reservation_response(MessageType::IntermediateNodeReservationResponse, 2))
    }

    fn process_neighbor_reservation_response(&mut self, path_id: PathId) -> StepResult {
        let node = self.base.node();
        let neighbor = *self
            .stats(path_id)?
            .path()
            .node_at(1)
            .ok_or(PaymentError::InvalidPath)?;
        let Some(message) = self.base.take_message() else {
            warn!(transaction = %self.base.id, %neighbor, "neighbor didn't answer");
            self.drop_reservations_on_path(path_id, true);
            self.send_ttl_continue_to_receiver();
            self.inaccessible_nodes.insert(neighbor);
            return self.switch_to_next_path();
        };
        let (state, amount) = match message.body {
            MessageBody::IntermediateNodeReservationResponse {
                path_id: response_path,
                state,
                amount,
            } if response_path == path_id && message.sender == neighbor => (state, amount),
            _ => return Ok(Flow::Yield(TransactionResult::ContinuePreviousState)),
        };

        match state {
            ReservationState::Closed => Ok(Flow::Yield(
                self.reject("desynchronization in reservation with neighbor"),
            )),
            ReservationState::Accepted if !amount.is_zero() => {
                let max_flow = self.stats(path_id)?.max_flow();
                if amount > max_flow {
                    return Ok(Flow::Yield(self.reject("neighbor reserved more than requested")));
                }
                self.stats_mut(path_id)?
                    .set_node_state(1, NodeState::NeighbourReservationApproved)?;
                if amount < max_flow {
                    self.base.shorten_reservation(
                        &neighbor,
                        path_id,
                        ReservationDirection::Outgoing,
                        amount.clone(),
                    )?;
                    self.stats_mut(path_id)?.shortage_max_flow(amount);
                }
                Ok(Flow::Continue)
            }
            _ => {
                self.drop_reservations_on_path(path_id, false);
                self.reject_trust_line(node, neighbor);
                self.switch_to_next_path()
            }
        }
    }

    /// Asks the node at `position` to reserve toward the node after it.
    fn request_further_reservation(&mut self, path_id: PathId, node: NodeId, position: usize) -> StepResult {
        let stats = self.stats(path_id)?;
        let next_node = *stats
            .path()
            .node_at(position + 1)
            .ok_or(PaymentError::InvalidPath)?;
        let mut reservations = vec![(path_id, stats.max_flow())];
        reservations.extend(self.final_amounts_for(&next_node));
        self.stats_mut(path_id)?
            .set_node_state(position, NodeState::ReservationRequestSent)?;
        self.base.send(
            node,
            MessageBody::CoordinatorReservationRequest {
                reservations,
                next_node,
            },
        );
        Ok(self.wait_for_reservation_response(MessageType::CoordinatorReservationResponse, 4))
    }

    fn process_remote_node_response(&mut self, path_id: PathId) -> StepResult {
        let stats = self.stats(path_id)?;
        let (node, position) = stats.current_intermediate_node_and_position()?;
        let next_node = *stats
            .path()
            .node_at(position + 1)
            .ok_or(PaymentError::InvalidPath)?;
        let first = *stats.path().node_at(1).ok_or(PaymentError::InvalidPath)?;

        let Some(message) = self.base.take_message() else {
            warn!(transaction = %self.base.id, %node, "intermediate node didn't answer");
            self.drop_reservations_on_path(path_id, true);
            self.send_ttl_continue_to_receiver();
            self.inaccessible_nodes.insert(node);
            return self.switch_to_next_path();
        };
        let (state, amount) = match message.body {
            MessageBody::CoordinatorReservationResponse {
                path_id: response_path,
                state,
                amount,
            } if response_path == path_id && message.sender == node => (state, amount),
            _ => return Ok(Flow::Yield(TransactionResult::ContinuePreviousState)),
        };

        match state {
            ReservationState::Closed => Ok(Flow::Yield(
                self.reject("desynchronization in reservation with intermediate node"),
            )),
            ReservationState::NextNodeInaccessible => {
                self.drop_reservations_on_path(path_id, false);
                if next_node == self.receiver {
                    self.receiver_inaccessible_count += 1;
                    if self.receiver_inaccessible_count >= self.base.config().max_receiver_inaccessible {
                        return Ok(Flow::Yield(self.reject_with(
                            "receiver is inaccessible",
                            PaymentOutcome::RemoteNodeInaccessible,
                        )));
                    }
                } else {
                    self.inaccessible_nodes.insert(next_node);
                }
                self.send_ttl_continue_to_receiver();
                self.switch_to_next_path()
            }
            ReservationState::Accepted if !amount.is_zero() => {
                let max_flow = self.stats(path_id)?.max_flow();
                if amount > max_flow {
                    return Ok(Flow::Yield(self.reject("node reserved more than requested")));
                }
                self.stats_mut(path_id)?
                    .set_node_state(position, NodeState::ReservationApproved)?;
                if amount < max_flow {
                    self.base.shorten_reservation(
                        &first,
                        path_id,
                        ReservationDirection::Outgoing,
                        amount.clone(),
                    )?;
                    self.stats_mut(path_id)?.shortage_max_flow(amount);
                }
                if self.stats(path_id)?.is_last_intermediate_node_processed() {
                    return self.complete_path(path_id);
                }
                Ok(Flow::Continue)
            }
            _ => {
                self.drop_reservations_on_path(path_id, false);
                self.reject_trust_line(node, next_node);
                self.send_ttl_continue_to_receiver();
                let stats = self.stats_mut(path_id)?;
                if stats
                    .set_node_state(position, NodeState::ReservationRejected)
                    .is_err()
                {
                    debug!(path = %path_id, "node state not updated");
                }
                self.switch_to_next_path()
            }
        }
    }

    /// Records a fully reserved path in the final amounts configuration.
    fn complete_path(&mut self, path_id: PathId) -> StepResult {
        let stats = self.stats(path_id)?;
        let max_flow = stats.max_flow();
        let intermediates = stats.path().intermediates().to_vec();
        let total = self.total_collected() + &max_flow;
        if total > self.amount {
            return Ok(Flow::Yield(
                self.reject("total collected amount is greater than requested"),
            ));
        }
        for node in &intermediates {
            self.base.send(
                *node,
                MessageBody::FinalPathConfiguration {
                    path_id,
                    amount: max_flow.clone(),
                },
            );
            self.add_final_amount(*node, path_id, max_flow.clone());
        }
        self.add_final_amount(self.receiver, path_id, max_flow.clone());
        debug!(
            transaction = %self.base.id,
            path = %path_id,
            amount = %max_flow,
            collected = %total,
            "path reserved"
        );
        if total == self.amount {
            return self.send_final_amounts_configuration();
        }
        self.switch_to_next_path()
    }

    // ===================================================================
    // Final amounts and votes
    // ===================================================================

    fn send_final_amounts_configuration(&mut self) -> StepResult {
        if self
            .base
            .reservations_count_with(&self.receiver, ReservationDirection::Outgoing)
            > 1
        {
            return Ok(Flow::Yield(
                self.reject("more than one reservation toward the receiver"),
            ));
        }
        self.final_amounts_confirmations = self
            .final_amounts
            .keys()
            .map(|node| (*node, false))
            .collect();
        for (node, amounts) in &self.final_amounts {
            self.base.send(
                *node,
                MessageBody::FinalAmountsConfiguration {
                    amounts: amounts.clone(),
                },
            );
        }
        self.base.send_reservations_to_neighbors();
        self.base.stage = Stage::FinalAmountsConfigurationConfirmation;
        Ok(Flow::Yield(TransactionResult::wait_for_messages(
            &[
                MessageType::FinalAmountsConfigurationResponse,
                MessageType::ReservationsInRelationToNode,
                MessageType::TtlProlongationRequest,
            ],
            self.base.max_network_delay(4),
        )))
    }

    fn run_final_amounts_configuration_confirmation_stage(&mut self) -> StepResult {
        let Some(message) = self.base.take_message() else {
            return Ok(Flow::Yield(
                self.reject("some nodes didn't confirm final amounts"),
            ));
        };
        let sender = message.sender;
        match message.body {
            MessageBody::FinalAmountsConfigurationResponse { verdict } => {
                let Some(confirmed) = self.final_amounts_confirmations.get_mut(&sender) else {
                    debug!(transaction = %self.base.id, %sender, "confirmation from a non-participant");
                    return Ok(Flow::Yield(TransactionResult::ContinuePreviousState));
                };
                if verdict == Verdict::Rejected {
                    return Ok(Flow::Yield(
                        self.reject("a participant rejected final amounts"),
                    ));
                }
                *confirmed = true;
            }
            MessageBody::ReservationsInRelationToNode { reservations } => {
                self.base.store_remote_reservations(sender, reservations);
            }
            other => return Err(PaymentError::UnexpectedMessage(other.message_type())),
        }

        let neighbors_reported = self.base.all_neighbors_reported();
        if neighbors_reported && !self.base.check_reservations_with_neighbors() {
            return Ok(Flow::Yield(
                self.reject("reservations differ from first-hop neighbors"),
            ));
        }
        let all_confirmed = self.final_amounts_confirmations.values().all(|confirmed| *confirmed);
        if all_confirmed && neighbors_reported {
            return self.propagate_votes();
        }
        Ok(Flow::Yield(TransactionResult::ContinuePreviousState))
    }

    fn propagate_votes(&mut self) -> StepResult {
        if !self.base.check_reservations_directions() {
            return Ok(Flow::Yield(self.reject("coordinator holds incoming reservations")));
        }
        let mut ballot = ParticipantsVotes::new(self.base.node());
        for participant in self.final_amounts.keys() {
            ballot.add_participant(*participant);
        }
        let first = *ballot
            .first_participant()
            .ok_or(PaymentError::InvariantViolation("ballot has no participants"))?;
        let hops = ballot.participants_count() as u32 + 1;
        self.base
            .send(first, MessageBody::ParticipantsVotes(ballot.clone()));
        self.base.ballot = Some(ballot);
        self.base.mark_voted();
        self.base.stage = Stage::VotesChecking;
        debug!(transaction = %self.base.id, participants = hops - 1, "votes propagation started");
        Ok(Flow::Yield(TransactionResult::wait_for_messages(
            &[
                MessageType::ParticipantsVotes,
                MessageType::TtlProlongationRequest,
            ],
            self.base.max_network_delay(hops),
        )))
    }

    fn run_votes_checking_stage(&mut self) -> StepResult {
        let Some(message) = self.base.take_message() else {
            return Ok(Flow::Yield(self.reject("coordinator didn't receive votes")));
        };
        let MessageBody::ParticipantsVotes(ballot) = message.body else {
            return Err(PaymentError::UnexpectedMessage(message.message_type()));
        };
        let sent = self
            .base
            .ballot
            .as_ref()
            .ok_or(PaymentError::InvariantViolation("ballot was not sent"))?;
        if !ballot.has_same_participants(sent) {
            return Ok(Flow::Yield(self.reject("ballot participants changed")));
        }
        if ballot.contains_reject_vote() {
            self.base.ballot = Some(ballot);
            return Ok(Flow::Yield(
                self.reject("a participant rejected the transaction"),
            ));
        }
        if !ballot.achieved_consensus() || !self.base.check_reservations_directions() {
            return Ok(Flow::Yield(self.reject("ballot has uncertain votes")));
        }

        let node = self.base.node();
        let mut ballot = ballot;
        ballot.add_participant(node);
        ballot.approve(&node)?;
        self.approve(ballot)
    }

    fn approve(&mut self, ballot: ParticipantsVotes) -> StepResult {
        self.base.commit(ballot)?;
        self.base.ctx.path_finder.release(&self.base.id);
        self.propagate_ballot_to_all_participants();
        info!(
            transaction = %self.base.id,
            receiver = %self.receiver,
            amount = %self.amount,
            "payment committed"
        );
        Ok(Flow::Yield(TransactionResult::outcome(PaymentOutcome::Ok(
            self.base.id,
        ))))
    }
}
