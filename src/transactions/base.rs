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

//! State and behavior shared by every role of a payment.
//!
//! [`BasePaymentTransaction`] owns the reservations a node holds for one
//! payment and runs the stages that are identical at the receiver and at
//! intermediate nodes: final amounts confirmation, voting, clarification
//! questions and recovery.

use crate::ballot::{ParticipantsVotes, Vote};
use crate::base::{NodeId, PathId, TransactionId, TrustLineAmount};
use crate::codec;
use crate::config::PaymentConfig;
use crate::error::PaymentError;
use crate::messages::{Message, MessageBody, MessageType, PathAmounts, TtlState, Verdict};
use crate::path_finder::PathFinder;
use crate::reservations::{AmountReservation, ReservationClaim, ReservationDirection};
use crate::result::{Resource, SubsidiaryTransactionRequest, TransactionEvent, TransactionResult};
use crate::storage::{PaymentKind, PaymentRecord, PaymentStorage};
use crate::trust_lines::TrustLines;
use crossbeam::channel::Sender;
use num_traits::Zero;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Hops a participant waits for the ballot when it doesn't know the participants yet.
const VOTES_WAIT_HOPS: u32 = 5;

/// Capabilities injected into a transaction at construction.
#[derive(Clone)]
pub struct TransactionContext {
    pub node: NodeId,
    pub trust_lines: Arc<TrustLines>,
    pub storage: Arc<dyn PaymentStorage>,
    pub path_finder: Arc<dyn PathFinder>,
    pub config: PaymentConfig,
    pub events: Sender<TransactionEvent>,
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("node", &self.node)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Role a node plays in one payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    Coordinator,
    Receiver,
    Intermediate,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Coordinator => f.write_str("coordinator"),
            TransactionKind::Receiver => f.write_str("receiver"),
            TransactionKind::Intermediate => f.write_str("intermediate"),
        }
    }
}

/// Stages of all payment roles.
///
/// Each role only enters its own stages plus the shared ones from
/// `FinalAmountsConfigurationConfirmation` on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Initialisation,
    PathsResourceProcessing,
    ReceiverResponseProcessing,
    AmountReservation,
    CoordinatorRequestApproving,
    AmountReservationsProcessing,
    ClarificationBeforeVoting,
    FinalAmountsConfigurationConfirmation,
    ClarificationDuringFinalAmounts,
    VotesChecking,
    ClarificationDuringVoting,
    Recovery,
}

#[derive(Debug, Default)]
struct RecoveryState {
    targets: Vec<NodeId>,
    next: usize,
    attempts: u32,
}

/// Per-payment bookkeeping shared by coordinator, receiver and intermediate nodes.
#[derive(Debug)]
pub(crate) struct BasePaymentTransaction {
    pub(crate) id: TransactionId,
    pub(crate) kind: TransactionKind,
    pub(crate) ctx: TransactionContext,
    pub(crate) stage: Stage,
    pub(crate) coordinator: Option<NodeId>,
    /// Counterparty and direction written to payment history on commit.
    pub(crate) history_entry: Option<(PaymentKind, NodeId)>,
    pub(crate) ballot: Option<ParticipantsVotes>,
    pub(crate) should_reject: bool,
    context: VecDeque<Message>,
    resources: Vec<Resource>,
    reservations: BTreeMap<NodeId, Vec<AmountReservation>>,
    remote_reservations: BTreeMap<NodeId, Vec<ReservationClaim>>,
    awaited_neighbors: BTreeSet<NodeId>,
    final_amounts_received: bool,
    voted: bool,
    committed: bool,
    clarification_attempts: u32,
    recovery: RecoveryState,
}

impl BasePaymentTransaction {
    pub(crate) fn new(
        ctx: TransactionContext,
        id: TransactionId,
        kind: TransactionKind,
        stage: Stage,
    ) -> Self {
        Self {
            id,
            kind,
            ctx,
            stage,
            coordinator: None,
            history_entry: None,
            ballot: None,
            should_reject: false,
            context: VecDeque::new(),
            resources: Vec::new(),
            reservations: BTreeMap::new(),
            remote_reservations: BTreeMap::new(),
            awaited_neighbors: BTreeSet::new(),
            final_amounts_received: false,
            voted: false,
            committed: false,
            clarification_attempts: 0,
            recovery: RecoveryState::default(),
        }
    }

    pub(crate) fn node(&self) -> NodeId {
        self.ctx.node
    }

    pub(crate) fn config(&self) -> &PaymentConfig {
        &self.ctx.config
    }

    pub(crate) fn max_network_delay(&self, hops: u32) -> Duration {
        self.ctx.config.max_network_delay(hops)
    }

    pub(crate) fn coordinator(&self) -> Result<NodeId, PaymentError> {
        self.coordinator
            .ok_or(PaymentError::InvariantViolation("coordinator is unknown"))
    }

    pub(crate) fn is_voted(&self) -> bool {
        self.voted
    }

    pub(crate) fn mark_voted(&mut self) {
        self.voted = true;
    }

    pub(crate) fn push_message(&mut self, message: Message) {
        self.context.push_back(message);
    }

    pub(crate) fn push_resource(&mut self, resource: Resource) {
        self.resources.push(resource);
    }

    pub(crate) fn peek_message_type(&self) -> Option<MessageType> {
        self.context.front().map(Message::message_type)
    }

    pub(crate) fn take_message(&mut self) -> Option<Message> {
        self.context.pop_front()
    }

    pub(crate) fn take_resource(&mut self) -> Option<Resource> {
        self.resources.pop()
    }

    pub(crate) fn send(&self, to: NodeId, body: MessageBody) {
        let message = Message::new(self.ctx.node, self.id, body);
        debug!(
            transaction = %self.id,
            node = %self.ctx.node,
            to = %to,
            message = %message.message_type(),
            "send"
        );
        self.emit(TransactionEvent::OutgoingMessage { to, message });
    }

    pub(crate) fn emit(&self, event: TransactionEvent) {
        if self.ctx.events.send(event).is_err() {
            warn!(transaction = %self.id, "event channel is closed");
        }
    }

    // ===================================================================
    // Reservations
    // ===================================================================

    pub(crate) fn reserve(
        &mut self,
        counterparty: NodeId,
        path_id: PathId,
        amount: TrustLineAmount,
        direction: ReservationDirection,
    ) -> Result<AmountReservation, PaymentError> {
        let reservation =
            self.ctx
                .trust_lines
                .reserve(&counterparty, self.id, path_id, amount, direction)?;
        debug!(
            transaction = %self.id,
            node = %self.ctx.node,
            counterparty = %counterparty,
            path = %path_id,
            amount = %reservation.amount,
            %direction,
            "reserved"
        );
        self.reservations
            .entry(counterparty)
            .or_default()
            .push(reservation.clone());
        Ok(reservation)
    }

    pub(crate) fn reservation(
        &self,
        counterparty: &NodeId,
        path_id: PathId,
        direction: ReservationDirection,
    ) -> Option<&AmountReservation> {
        self.reservations
            .get(counterparty)?
            .iter()
            .find(|r| r.path_id == path_id && r.direction == direction)
    }

    /// Reservation held for `path_id` in `direction`, whatever the counterparty.
    pub(crate) fn path_reservation(
        &self,
        path_id: PathId,
        direction: ReservationDirection,
    ) -> Option<&AmountReservation> {
        self.reservations
            .values()
            .flatten()
            .find(|r| r.path_id == path_id && r.direction == direction)
    }

    pub(crate) fn has_reservations(&self) -> bool {
        self.reservations.values().any(|list| !list.is_empty())
    }

    /// Shrinks a held reservation to `amount`.
    pub(crate) fn shorten_reservation(
        &mut self,
        counterparty: &NodeId,
        path_id: PathId,
        direction: ReservationDirection,
        amount: TrustLineAmount,
    ) -> Result<(), PaymentError> {
        let slot = self
            .reservations
            .get_mut(counterparty)
            .and_then(|list| {
                list.iter_mut()
                    .find(|r| r.path_id == path_id && r.direction == direction)
            })
            .ok_or(PaymentError::ReservationNotFound)?;
        if slot.amount == amount {
            return Ok(());
        }
        let updated = self.ctx.trust_lines.update(slot, amount)?;
        debug!(
            transaction = %self.id,
            counterparty = %counterparty,
            path = %path_id,
            amount = %updated.amount,
            "reservation shortened"
        );
        *slot = updated;
        Ok(())
    }

    pub(crate) fn drop_reservation(
        &mut self,
        counterparty: &NodeId,
        path_id: PathId,
        direction: ReservationDirection,
    ) -> Result<(), PaymentError> {
        let list = self
            .reservations
            .get_mut(counterparty)
            .ok_or(PaymentError::ReservationNotFound)?;
        let index = list
            .iter()
            .position(|r| r.path_id == path_id && r.direction == direction)
            .ok_or(PaymentError::ReservationNotFound)?;
        let reservation = list.remove(index);
        if list.is_empty() {
            self.reservations.remove(counterparty);
        }
        self.ctx.trust_lines.free(&reservation)
    }

    /// Frees every reservation held for `path_id`. Returns how many were freed.
    pub(crate) fn drop_path(&mut self, path_id: PathId) -> usize {
        let held: Vec<(NodeId, ReservationDirection)> = self
            .reservations
            .values()
            .flatten()
            .filter(|r| r.path_id == path_id)
            .map(|r| (r.counterparty, r.direction))
            .collect();
        for (counterparty, direction) in &held {
            if let Err(error) = self.drop_reservation(counterparty, path_id, *direction) {
                warn!(transaction = %self.id, path = %path_id, %error, "can't drop reservation");
            }
        }
        held.len()
    }

    /// Sum of amounts this payment holds in `direction`.
    pub(crate) fn total_reserved(&self, direction: ReservationDirection) -> TrustLineAmount {
        self.reservations
            .values()
            .flatten()
            .filter(|r| r.direction == direction)
            .map(|r| r.amount.clone())
            .sum()
    }

    pub(crate) fn reservations_count_with(
        &self,
        counterparty: &NodeId,
        direction: ReservationDirection,
    ) -> usize {
        self.reservations
            .get(counterparty)
            .map(|list| list.iter().filter(|r| r.direction == direction).count())
            .unwrap_or(0)
    }

    /// Brings local reservations in line with a list of final path amounts.
    ///
    /// Paths missing from `amounts` are dropped and listed ones are shrunk.
    /// `skip` exempts the path currently being reserved. Nothing changes
    /// when the list names an unknown path or asks for an increase.
    pub(crate) fn update_reservations(
        &mut self,
        amounts: &[(PathId, TrustLineAmount)],
        skip: Option<PathId>,
    ) -> Result<(), PaymentError> {
        let configured: BTreeMap<PathId, &TrustLineAmount> = amounts
            .iter()
            .filter(|(path_id, _)| Some(*path_id) != skip)
            .map(|(path_id, amount)| (*path_id, amount))
            .collect();
        let held: Vec<AmountReservation> = self
            .reservations
            .values()
            .flatten()
            .filter(|r| Some(r.path_id) != skip)
            .cloned()
            .collect();

        for path_id in configured.keys() {
            if !held.iter().any(|r| r.path_id == *path_id) {
                return Err(PaymentError::PathNotFound(*path_id));
            }
        }
        for reservation in &held {
            if let Some(amount) = configured.get(&reservation.path_id)
                && **amount > reservation.amount
            {
                return Err(PaymentError::ReservationIncrease);
            }
        }

        for reservation in held {
            match configured.get(&reservation.path_id) {
                Some(amount) if !amount.is_zero() => self.shorten_reservation(
                    &reservation.counterparty,
                    reservation.path_id,
                    reservation.direction,
                    (*amount).clone(),
                )?,
                _ => self.drop_reservation(
                    &reservation.counterparty,
                    reservation.path_id,
                    reservation.direction,
                )?,
            }
        }
        Ok(())
    }

    // ===================================================================
    // Reconciliation
    // ===================================================================

    /// Tells every counterparty what this node holds toward it.
    pub(crate) fn send_reservations_to_neighbors(&mut self) {
        let claims: Vec<(NodeId, Vec<ReservationClaim>)> = self
            .reservations
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(neighbor, list)| (*neighbor, list.iter().map(ReservationClaim::from).collect()))
            .collect();
        self.awaited_neighbors = claims.iter().map(|(neighbor, _)| *neighbor).collect();
        for (neighbor, reservations) in claims {
            self.send(
                neighbor,
                MessageBody::ReservationsInRelationToNode { reservations },
            );
        }
    }

    pub(crate) fn store_remote_reservations(
        &mut self,
        neighbor: NodeId,
        reservations: Vec<ReservationClaim>,
    ) {
        self.remote_reservations.insert(neighbor, reservations);
    }

    pub(crate) fn all_neighbors_reported(&self) -> bool {
        self.awaited_neighbors
            .iter()
            .all(|neighbor| self.remote_reservations.contains_key(neighbor))
    }

    /// Every neighbor reports exactly the mirror image of what this node holds.
    pub(crate) fn check_reservations_with_neighbors(&self) -> bool {
        if self
            .remote_reservations
            .keys()
            .any(|neighbor| !self.reservations.contains_key(neighbor))
        {
            return false;
        }
        self.reservations.iter().all(|(neighbor, mine)| {
            let Some(theirs) = self.remote_reservations.get(neighbor) else {
                return false;
            };
            mine.len() == theirs.len()
                && mine.iter().all(|r| {
                    theirs.contains(&ReservationClaim {
                        path_id: r.path_id,
                        amount: r.amount.clone(),
                        direction: r.direction.opposite(),
                    })
                })
        })
    }

    /// Coordinator only pays, receiver only receives, intermediate nodes pass
    /// through exactly what they get on every path.
    pub(crate) fn check_reservations_directions(&self) -> bool {
        if !self.has_reservations() {
            return false;
        }
        let mut all = self.reservations.values().flatten();
        match self.kind {
            TransactionKind::Coordinator => {
                all.all(|r| r.direction == ReservationDirection::Outgoing)
            }
            TransactionKind::Receiver => all.all(|r| r.direction == ReservationDirection::Incoming),
            TransactionKind::Intermediate => {
                let mut per_path: BTreeMap<PathId, (TrustLineAmount, TrustLineAmount)> =
                    BTreeMap::new();
                for reservation in all {
                    let sums = per_path.entry(reservation.path_id).or_default();
                    match reservation.direction {
                        ReservationDirection::Incoming => sums.0 += &reservation.amount,
                        ReservationDirection::Outgoing => sums.1 += &reservation.amount,
                    }
                }
                per_path.values().all(|(incoming, outgoing)| incoming == outgoing)
            }
        }
    }

    // ===================================================================
    // Terminal transitions
    // ===================================================================

    /// Applies every held reservation to the ledger and persists the ballot.
    ///
    /// # Errors
    ///
    /// Fails if the payment was already committed, or if the ledger or
    /// storage refuses a write.
    pub(crate) fn commit(&mut self, ballot: ParticipantsVotes) -> Result<(), PaymentError> {
        if self.committed {
            return Err(PaymentError::InvariantViolation("transaction is already committed"));
        }
        let ballot_bytes = codec::encode_ballot(&ballot)?;
        let held: Vec<AmountReservation> = self.reservations.values().flatten().cloned().collect();
        let outgoing = self.total_reserved(ReservationDirection::Outgoing);
        let incoming = self.total_reserved(ReservationDirection::Incoming);

        let storage = Arc::clone(&self.ctx.storage);
        let mut storage_tx = storage.begin();
        for reservation in &held {
            if let Err(error) = self.ctx.trust_lines.commit_reservation(reservation) {
                storage_tx.rollback();
                return Err(error);
            }
        }
        if let Some((kind, counterparty)) = self.history_entry {
            let amount = match kind {
                PaymentKind::Outgoing => outgoing,
                PaymentKind::Incoming => incoming,
            };
            storage_tx.save_payment_record(PaymentRecord {
                transaction_id: self.id,
                kind,
                counterparty,
                amount,
                balance_after: self.ctx.trust_lines.total_balance(),
            })?;
        }
        storage_tx.save_ballot_state(self.id, ballot_bytes)?;
        storage_tx.commit()?;

        self.committed = true;
        self.reservations.clear();
        self.ballot = Some(ballot);

        let neighbors: BTreeSet<NodeId> = held.iter().map(|r| r.counterparty).collect();
        info!(
            transaction = %self.id,
            node = %self.ctx.node,
            role = %self.kind,
            reservations = held.len(),
            "transaction committed"
        );
        self.emit(TransactionEvent::SubsidiaryTransaction(
            SubsidiaryTransactionRequest::CycleClosing {
                neighbors: neighbors.into_iter().collect(),
            },
        ));
        Ok(())
    }

    /// Releases every reservation of the payment.
    pub(crate) fn rollback(&mut self) {
        let freed = self.ctx.trust_lines.free_transaction(&self.id);
        self.reservations.clear();
        if freed > 0 {
            debug!(transaction = %self.id, node = %self.ctx.node, freed, "reservations released");
        }
    }

    /// Rolls back and, if a ballot exists, records this node's rejection in it.
    pub(crate) fn reject(&mut self, reason: &str) -> TransactionResult {
        info!(
            transaction = %self.id,
            node = %self.ctx.node,
            role = %self.kind,
            reason,
            "transaction rejected"
        );
        self.rollback();
        if let Some(mut ballot) = self.ballot.take() {
            let node = self.ctx.node;
            if *ballot.coordinator() == node {
                ballot.add_participant(node);
            }
            if !ballot.contains_reject_vote() && ballot.reject(&node).is_err() {
                debug!(transaction = %self.id, "node is not listed in the ballot");
            }
            self.save_ballot(&ballot);
            self.ballot = Some(ballot);
        }
        TransactionResult::done()
    }

    fn save_ballot(&self, ballot: &ParticipantsVotes) {
        let saved = codec::encode_ballot(ballot)
            .map_err(PaymentError::from)
            .and_then(|bytes| {
                let mut storage_tx = self.ctx.storage.begin();
                storage_tx.save_ballot_state(self.id, bytes)?;
                storage_tx.commit()?;
                Ok(())
            });
        if let Err(error) = saved {
            warn!(transaction = %self.id, %error, "can't store ballot");
        }
    }

    // ===================================================================
    // Shared participant stages
    // ===================================================================

    /// Runs the stages common to the receiver and intermediate nodes.
    pub(crate) fn run_participant_stage(&mut self) -> Result<TransactionResult, PaymentError> {
        match self.stage {
            Stage::FinalAmountsConfigurationConfirmation | Stage::ClarificationDuringFinalAmounts => {
                self.run_final_amounts_configuration_stage()
            }
            Stage::VotesChecking | Stage::ClarificationDuringVoting => self.run_votes_checking_stage(),
            Stage::Recovery => self.run_recovery_stage(),
            _ => Err(PaymentError::InvalidStage),
        }
    }

    fn final_amounts_types(&self) -> Vec<MessageType> {
        let mut types = vec![
            MessageType::FinalAmountsConfiguration,
            MessageType::ReservationsInRelationToNode,
            MessageType::TtlProlongationResponse,
        ];
        if self.kind == TransactionKind::Receiver {
            types.push(MessageType::IntermediateNodeReservationRequest);
        }
        types
    }

    pub(crate) fn wait_for_final_amounts(&self) -> TransactionResult {
        TransactionResult::WaitForMessages {
            types: self.final_amounts_types(),
            timeout: self.max_network_delay(4),
        }
    }

    pub(crate) fn wait_for_votes(&self) -> TransactionResult {
        let hops = self
            .ballot
            .as_ref()
            .map(|ballot| ballot.participants_count() as u32 + 2)
            .unwrap_or(0)
            .max(VOTES_WAIT_HOPS);
        TransactionResult::wait_for_messages(
            &[MessageType::ParticipantsVotes, MessageType::TtlProlongationResponse],
            self.max_network_delay(hops),
        )
    }

    /// Asks the coordinator whether to keep waiting, or gives up once the clarification budget is spent.
    pub(crate) fn on_silence(&mut self, clarification: Stage, types: &[MessageType]) -> TransactionResult {
        if self.clarification_attempts >= self.ctx.config.max_clarification_attempts {
            warn!(transaction = %self.id, node = %self.ctx.node, "coordinator is silent");
            return if self.voted {
                self.start_recovery()
            } else {
                self.reject("coordinator is silent")
            };
        }
        let Some(coordinator) = self.coordinator else {
            return self.reject("no traffic from upstream");
        };
        self.clarification_attempts += 1;
        self.stage = clarification;
        self.send(coordinator, MessageBody::TtlProlongationRequest);
        let mut awaited = types.to_vec();
        if !awaited.contains(&MessageType::TtlProlongationResponse) {
            awaited.push(MessageType::TtlProlongationResponse);
        }
        TransactionResult::WaitForMessages {
            types: awaited,
            timeout: self.max_network_delay(2),
        }
    }

    /// Handles the coordinator's answer to a liveness question.
    pub(crate) fn on_ttl_response(
        &mut self,
        state: TtlState,
        stage: Stage,
        wait: TransactionResult,
    ) -> TransactionResult {
        match state {
            TtlState::Continue => {
                self.clarification_attempts = 0;
                self.stage = stage;
                wait
            }
            TtlState::Finish if self.voted => self.start_recovery(),
            TtlState::Finish => self.reject("coordinator finished the transaction"),
        }
    }

    fn run_final_amounts_configuration_stage(&mut self) -> Result<TransactionResult, PaymentError> {
        let Some(message) = self.take_message() else {
            let types = self.final_amounts_types();
            return Ok(self.on_silence(Stage::ClarificationDuringFinalAmounts, &types));
        };
        let sender = message.sender;
        match message.body {
            MessageBody::FinalAmountsConfiguration { amounts } => {
                self.process_final_amounts_configuration(sender, amounts)
            }
            MessageBody::ReservationsInRelationToNode { reservations } => {
                self.store_remote_reservations(sender, reservations);
                self.try_confirm_final_amounts(false)
            }
            MessageBody::TtlProlongationResponse { state } => {
                let wait = self.wait_for_final_amounts();
                Ok(self.on_ttl_response(state, Stage::FinalAmountsConfigurationConfirmation, wait))
            }
            other => {
                debug!(transaction = %self.id, message = %other.message_type(), "ignored");
                Ok(TransactionResult::ContinuePreviousState)
            }
        }
    }

    /// Applies the coordinator's final amounts and starts neighbor reconciliation.
    pub(crate) fn process_final_amounts_configuration(
        &mut self,
        sender: NodeId,
        amounts: PathAmounts,
    ) -> Result<TransactionResult, PaymentError> {
        if self.final_amounts_received {
            return Ok(TransactionResult::ContinuePreviousState);
        }
        let coordinator = *self.coordinator.get_or_insert(sender);
        if sender != coordinator {
            debug!(transaction = %self.id, %sender, "final amounts from a non-coordinator");
            return Ok(TransactionResult::ContinuePreviousState);
        }
        self.stage = Stage::FinalAmountsConfigurationConfirmation;
        self.clarification_attempts = 0;

        let updated = self.update_reservations(&amounts, None);
        if let Err(error) = updated {
            warn!(transaction = %self.id, node = %self.ctx.node, %error, "final amounts don't match reservations");
            self.send(
                coordinator,
                MessageBody::FinalAmountsConfigurationResponse { verdict: Verdict::Rejected },
            );
            return Ok(self.reject("final amounts don't match reservations"));
        }
        if !self.has_reservations() {
            self.send(
                coordinator,
                MessageBody::FinalAmountsConfigurationResponse { verdict: Verdict::Rejected },
            );
            return Ok(self.reject("no reservations left after final amounts"));
        }
        self.final_amounts_received = true;
        self.send_reservations_to_neighbors();
        self.try_confirm_final_amounts(true)
    }

    fn try_confirm_final_amounts(&mut self, fresh_wait: bool) -> Result<TransactionResult, PaymentError> {
        if !self.final_amounts_received || !self.all_neighbors_reported() {
            return Ok(if fresh_wait {
                self.wait_for_final_amounts()
            } else {
                TransactionResult::ContinuePreviousState
            });
        }
        let coordinator = self.coordinator()?;
        if self.should_reject
            || !self.check_reservations_with_neighbors()
            || !self.check_reservations_directions()
        {
            self.send(
                coordinator,
                MessageBody::FinalAmountsConfigurationResponse { verdict: Verdict::Rejected },
            );
            return Ok(self.reject("reservations differ from neighbors"));
        }
        self.send(
            coordinator,
            MessageBody::FinalAmountsConfigurationResponse { verdict: Verdict::Accepted },
        );
        self.stage = Stage::VotesChecking;
        self.clarification_attempts = 0;
        Ok(self.wait_for_votes())
    }

    fn run_votes_checking_stage(&mut self) -> Result<TransactionResult, PaymentError> {
        let Some(message) = self.take_message() else {
            return Ok(self.on_silence(
                Stage::ClarificationDuringVoting,
                &[MessageType::ParticipantsVotes],
            ));
        };
        match message.body {
            MessageBody::ParticipantsVotes(ballot) => self.process_ballot(ballot),
            MessageBody::TtlProlongationResponse { state } => {
                let wait = self.wait_for_votes();
                Ok(self.on_ttl_response(state, Stage::VotesChecking, wait))
            }
            other => {
                debug!(transaction = %self.id, message = %other.message_type(), "ignored");
                Ok(TransactionResult::ContinuePreviousState)
            }
        }
    }

    fn process_ballot(&mut self, ballot: ParticipantsVotes) -> Result<TransactionResult, PaymentError> {
        let node = self.ctx.node;
        let coordinator = self.coordinator()?;
        if *ballot.coordinator() != coordinator || !ballot.contains_participant(&node) {
            debug!(transaction = %self.id, "ballot is not addressed to this node");
            return Ok(TransactionResult::ContinuePreviousState);
        }

        if ballot.contains_reject_vote() {
            self.ballot = Some(ballot);
            return Ok(self.reject("a participant rejected the transaction"));
        }

        if ballot.is_final() {
            let extends_own = self.ballot.as_ref().is_none_or(|own| ballot.extends(own));
            if !self.voted || !extends_own {
                warn!(transaction = %self.id, node = %node, "final ballot doesn't match local vote");
                return Ok(TransactionResult::ContinuePreviousState);
            }
            self.commit(ballot)?;
            return Ok(TransactionResult::done());
        }

        if self.voted || ballot.vote(&node) != Some(Vote::Uncertain) {
            return Ok(TransactionResult::ContinuePreviousState);
        }

        let mut ballot = ballot;
        if self.should_reject || !self.final_amounts_received || !self.check_reservations_directions() {
            ballot.reject(&node)?;
            self.send(coordinator, MessageBody::ParticipantsVotes(ballot.clone()));
            self.ballot = Some(ballot);
            return Ok(self.reject("reservations are not consistent"));
        }

        ballot.approve(&node)?;
        self.voted = true;
        let next = ballot.next_participant(&node)?.copied().unwrap_or(coordinator);
        self.emit(TransactionEvent::SerializationRequest {
            transaction_id: self.id,
            ballot: codec::encode_ballot(&ballot)?,
        });
        self.send(next, MessageBody::ParticipantsVotes(ballot.clone()));
        self.ballot = Some(ballot);
        self.clarification_attempts = 0;
        debug!(transaction = %self.id, node = %node, next = %next, "voted");
        Ok(self.wait_for_votes())
    }

    // ===================================================================
    // Recovery
    // ===================================================================

    /// Asks the coordinator, then the other participants, how the payment ended.
    pub(crate) fn start_recovery(&mut self) -> TransactionResult {
        info!(transaction = %self.id, node = %self.ctx.node, "recovering payment state");
        let node = self.ctx.node;
        let mut targets: Vec<NodeId> = self.coordinator.into_iter().collect();
        if let Some(ballot) = &self.ballot {
            for participant in ballot.participants() {
                if *participant != node && !targets.contains(participant) {
                    targets.push(*participant);
                }
            }
        }
        self.stage = Stage::Recovery;
        self.recovery = RecoveryState {
            targets,
            next: 0,
            attempts: 0,
        };
        self.ask_next_recovery_target()
    }

    fn ask_next_recovery_target(&mut self) -> TransactionResult {
        if self.recovery.targets.is_empty() {
            return self.reject("nobody to recover from");
        }
        if self.recovery.attempts >= self.ctx.config.max_recovery_attempts {
            warn!(
                transaction = %self.id,
                node = %self.ctx.node,
                attempts = self.recovery.attempts,
                "recovery attempts exhausted"
            );
            return self.reject("recovery attempts exhausted");
        }
        let target = self.recovery.targets[self.recovery.next % self.recovery.targets.len()];
        self.recovery.next += 1;
        self.recovery.attempts += 1;
        self.send(target, MessageBody::VotesStatusRequest);
        TransactionResult::wait_for_messages(
            &[MessageType::ParticipantsVotes],
            self.max_network_delay(2),
        )
    }

    fn run_recovery_stage(&mut self) -> Result<TransactionResult, PaymentError> {
        let Some(message) = self.take_message() else {
            return Ok(self.ask_next_recovery_target());
        };
        let MessageBody::ParticipantsVotes(ballot) = message.body else {
            return Ok(TransactionResult::ContinuePreviousState);
        };
        let node = self.ctx.node;

        if ballot.is_final() && ballot.contains_participant(&node) {
            let extends_own = self.ballot.as_ref().is_none_or(|own| ballot.extends(own));
            if self.voted && extends_own {
                self.commit(ballot)?;
                return Ok(TransactionResult::done());
            }
            warn!(transaction = %self.id, node = %node, "recovered ballot doesn't match local vote");
            return Ok(self.reject("recovered ballot doesn't match local vote"));
        }
        if ballot.contains_reject_vote() {
            return Ok(self.reject("payment was rejected"));
        }
        debug!(transaction = %self.id, from = %message.sender, "payment is still undecided");
        Ok(TransactionResult::AwakeAfter(self.ctx.config.recovery_retry_delay))
    }
}
