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

//! Payment command entry point and inbound message routing for one node.
//!
//! [`PaymentsManager`] owns the node's scheduler, creates transactions for
//! commands and for first contacts from other nodes, and collects what the
//! transactions produce: outgoing messages, subsidiary requests, ballot
//! snapshots and command outcomes.

use crate::base::{NodeId, TransactionId, TrustLineAmount};
use crate::codec;
use crate::config::PaymentConfig;
use crate::error::PaymentError;
use crate::messages::{Message, MessageBody, MessageType, TtlState};
use crate::path_finder::PathFinder;
use crate::result::{PaymentOutcome, Resource, SubsidiaryTransactionRequest, TransactionEvent};
use crate::scheduler::{Attachment, TransactionsScheduler};
use crate::storage::PaymentStorage;
use crate::transactions::{
    CoordinatorPaymentTransaction, IntermediateNodePaymentTransaction, PaymentTransaction,
    ReceiverPaymentTransaction, TransactionContext, TransactionKind, votes_status,
};
use crate::trust_lines::TrustLines;
use crossbeam::channel::{Receiver, unbounded};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Payment subsystem of one node.
#[derive(Debug)]
pub struct PaymentsManager {
    ctx: TransactionContext,
    scheduler: TransactionsScheduler,
    events: Receiver<TransactionEvent>,
    outgoing: SegQueue<(NodeId, Message)>,
    subsidiary: SegQueue<SubsidiaryTransactionRequest>,
    outcomes: DashMap<TransactionId, PaymentOutcome>,
    /// Ballot snapshots of voted, still running transactions.
    serialized_ballots: DashMap<TransactionId, Vec<u8>>,
    counter: AtomicU64,
}

impl PaymentsManager {
    pub fn new(
        trust_lines: Arc<TrustLines>,
        storage: Arc<dyn PaymentStorage>,
        path_finder: Arc<dyn PathFinder>,
        config: PaymentConfig,
    ) -> Self {
        let (sender, events) = unbounded();
        let ctx = TransactionContext {
            node: trust_lines.owner(),
            trust_lines,
            storage,
            path_finder,
            config,
            events: sender,
        };
        Self {
            ctx,
            scheduler: TransactionsScheduler::new(),
            events,
            outgoing: SegQueue::new(),
            subsidiary: SegQueue::new(),
            outcomes: DashMap::new(),
            serialized_ballots: DashMap::new(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn node(&self) -> NodeId {
        self.ctx.node
    }

    pub fn trust_lines(&self) -> &Arc<TrustLines> {
        &self.ctx.trust_lines
    }

    pub fn storage(&self) -> &Arc<dyn PaymentStorage> {
        &self.ctx.storage
    }

    pub fn config(&self) -> &PaymentConfig {
        &self.ctx.config
    }

    fn next_transaction_id(&self) -> TransactionId {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        TransactionId::generate(&self.ctx.node, counter)
    }

    /// Starts a payment of `amount` to `receiver`.
    ///
    /// The result is available from [`outcome`](Self::outcome) once the
    /// payment finishes.
    ///
    /// # Errors
    ///
    /// [`PaymentError::DuplicateTransaction`] if the generated id collides
    /// with a running transaction.
    pub fn launch_payment(
        &self,
        receiver: NodeId,
        amount: TrustLineAmount,
    ) -> Result<TransactionId, PaymentError> {
        let id = self.next_transaction_id();
        info!(transaction = %id, node = %self.ctx.node, %receiver, %amount, "payment command");
        let transaction =
            CoordinatorPaymentTransaction::new(self.ctx.clone(), id, receiver, amount);
        self.scheduler.schedule(transaction.into())?;
        self.collect();
        Ok(id)
    }

    /// Like [`launch_payment`](Self::launch_payment), but the payment starts after `delay`.
    ///
    /// # Errors
    ///
    /// [`PaymentError::DuplicateTransaction`] if the generated id collides
    /// with a running transaction.
    pub fn launch_payment_after(
        &self,
        receiver: NodeId,
        amount: TrustLineAmount,
        delay: Duration,
    ) -> Result<TransactionId, PaymentError> {
        let id = self.next_transaction_id();
        let transaction =
            CoordinatorPaymentTransaction::new(self.ctx.clone(), id, receiver, amount);
        self.scheduler.postpone(transaction.into(), delay)?;
        Ok(id)
    }

    /// Routes an inbound message to its transaction, creating one on first contact.
    pub fn process_message(&self, message: Message) {
        let message_type = message.message_type();
        let id = message.transaction_id;
        debug!(transaction = %id, node = %self.ctx.node, sender = %message.sender, %message_type, "message received");

        if message_type == MessageType::VotesStatusRequest {
            let in_process = self.scheduler.is_transaction_in_process(&id);
            let reply = votes_status::respond(
                self.ctx.node,
                self.ctx.storage.as_ref(),
                in_process,
                &message,
            );
            self.outgoing.push((message.sender, reply));
            return;
        }

        match self.scheduler.try_attach_message(message) {
            Ok(_) => {}
            Err(message) => self.process_first_contact(message),
        }
        self.collect();
    }

    /// Handles a message for a payment this node doesn't run.
    fn process_first_contact(&self, message: Message) {
        let id = message.transaction_id;
        let sender = message.sender;
        let message_type = message.message_type();
        let created: Result<Option<PaymentTransaction>, PaymentError> = match message_type {
            MessageType::ReceiverInitPaymentRequest => {
                ReceiverPaymentTransaction::new(self.ctx.clone(), message).map(|tx| Some(tx.into()))
            }
            MessageType::IntermediateNodeReservationRequest => {
                IntermediateNodePaymentTransaction::new(self.ctx.clone(), message)
                    .map(|tx| Some(tx.into()))
            }
            MessageType::TtlProlongationRequest => {
                debug!(transaction = %id, %sender, "ttl request for unknown payment, finishing");
                self.send(
                    sender,
                    Message::new(
                        self.ctx.node,
                        id,
                        MessageBody::TtlProlongationResponse {
                            state: TtlState::Finish,
                        },
                    ),
                );
                Ok(None)
            }
            _ => {
                debug!(transaction = %id, %sender, %message_type, "message for unknown payment dropped");
                Ok(None)
            }
        };
        match created {
            Ok(Some(transaction)) => {
                debug!(transaction = %id, node = %self.ctx.node, role = %transaction.kind(), "transaction created");
                if let Err(error) = self.scheduler.schedule(transaction) {
                    warn!(transaction = %id, %error, "can't schedule transaction");
                }
            }
            Ok(None) => {}
            Err(error) => warn!(transaction = %id, %error, "can't create transaction"),
        }
    }

    /// Decodes a wire message and routes it.
    ///
    /// # Errors
    ///
    /// Returns the decoding error; nothing is routed in that case.
    pub fn process_encoded(&self, bytes: &[u8]) -> Result<(), PaymentError> {
        let message = codec::decode(bytes)?;
        self.process_message(message);
        Ok(())
    }

    /// Hands a resource, such as found paths, to transaction `id`.
    pub fn attach_resource(&self, id: &TransactionId, resource: Resource) {
        if self.scheduler.attach_resource(id, resource).is_err() {
            debug!(transaction = %id, "resource for unknown payment dropped");
        }
        self.collect();
    }

    /// Advances the clock and runs transactions whose deadlines passed.
    pub fn tick(&self, now: Duration) {
        if self.scheduler.tick(now) > 0 {
            self.collect();
        }
    }

    /// Stops payment `id`, releasing everything it reserved.
    pub fn kill(&self, id: &TransactionId) -> bool {
        let killed = self.scheduler.kill(id);
        self.collect();
        killed
    }

    pub fn now(&self) -> Duration {
        self.scheduler.now()
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.scheduler.next_deadline()
    }

    pub fn is_transaction_in_process(&self, id: &TransactionId) -> bool {
        self.scheduler.is_transaction_in_process(id)
    }

    /// Result of a payment launched on this node, once it finished.
    pub fn outcome(&self, id: &TransactionId) -> Option<PaymentOutcome> {
        self.outcomes.get(id).map(|outcome| *outcome.value())
    }

    /// Latest ballot snapshot of a voted transaction still running here.
    pub fn serialized_ballot(&self, id: &TransactionId) -> Option<Vec<u8>> {
        self.serialized_ballots.get(id).map(|ballot| ballot.value().clone())
    }

    /// Takes the messages to deliver, with their destinations.
    pub fn drain_outgoing(&self) -> Vec<(NodeId, Message)> {
        std::iter::from_fn(|| self.outgoing.pop()).collect()
    }

    /// Takes the follow-up requests for other subsystems.
    pub fn drain_subsidiary(&self) -> Vec<SubsidiaryTransactionRequest> {
        std::iter::from_fn(|| self.subsidiary.pop()).collect()
    }

    fn send(&self, to: NodeId, message: Message) {
        self.outgoing.push((to, message));
    }

    /// Moves transaction events and finished transactions into the manager's queues.
    fn collect(&self) {
        for event in self.events.try_iter() {
            match event {
                TransactionEvent::OutgoingMessage { to, message } => self.send(to, message),
                TransactionEvent::SubsidiaryTransaction(request) => self.subsidiary.push(request),
                TransactionEvent::SerializationRequest {
                    transaction_id,
                    ballot,
                } => {
                    self.serialized_ballots.insert(transaction_id, ballot);
                }
            }
        }
        for finished in self.scheduler.drain_finished() {
            self.serialized_ballots.remove(&finished.id);
            if finished.kind != TransactionKind::Coordinator {
                continue;
            }
            if let Some(outcome) = finished.outcome {
                info!(transaction = %finished.id, node = %self.ctx.node, %outcome, code = outcome.code(), "payment outcome");
                self.outcomes.insert(finished.id, outcome);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ballot::ParticipantsVotes;
    use crate::path_finder::GraphPathFinder;
    use crate::storage::MemoryStorage;

    fn node(n: u128) -> NodeId {
        NodeId::from_u128(n)
    }

    fn make_manager(owner: u128, config: PaymentConfig) -> PaymentsManager {
        let trust_lines = TrustLines::new(node(owner));
        trust_lines.open(node(2), TrustLineAmount::from(100u32), TrustLineAmount::from(100u32));
        PaymentsManager::new(
            Arc::new(trust_lines),
            Arc::new(MemoryStorage::new()),
            Arc::new(GraphPathFinder::new(config.max_path_length)),
            config,
        )
    }

    #[test]
    fn disabled_payments_are_refused() {
        let manager = make_manager(1, PaymentConfig::new().with_payments_enabled(false));
        let id = manager.launch_payment(node(2), TrustLineAmount::from(10u32)).unwrap();
        assert_eq!(manager.outcome(&id), Some(PaymentOutcome::ForbiddenRunTransaction));
    }

    #[test]
    fn self_payment_is_a_protocol_error() {
        let manager = make_manager(1, PaymentConfig::new());
        let id = manager.launch_payment(node(1), TrustLineAmount::from(10u32)).unwrap();
        assert_eq!(manager.outcome(&id), Some(PaymentOutcome::ProtocolError));
    }

    #[test]
    fn transaction_ids_are_unique_per_command() {
        let manager = make_manager(1, PaymentConfig::new());
        let first = manager.launch_payment(node(2), TrustLineAmount::from(1u32)).unwrap();
        let second = manager.launch_payment(node(2), TrustLineAmount::from(1u32)).unwrap();
        assert_ne!(first, second);
        assert!(manager.is_transaction_in_process(&first));
        assert!(manager.is_transaction_in_process(&second));
    }

    #[test]
    fn ttl_request_for_unknown_payment_is_answered_with_finish() {
        let manager = make_manager(1, PaymentConfig::new());
        let id = TransactionId::from_u128(5);
        manager.process_message(Message::new(node(2), id, MessageBody::TtlProlongationRequest));

        let outgoing = manager.drain_outgoing();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].0, node(2));
        assert_eq!(
            outgoing[0].1.body,
            MessageBody::TtlProlongationResponse {
                state: TtlState::Finish
            }
        );
    }

    #[test]
    fn votes_status_for_unknown_payment_is_a_rejection() {
        let manager = make_manager(1, PaymentConfig::new());
        let id = TransactionId::from_u128(5);
        manager.process_message(Message::new(node(2), id, MessageBody::VotesStatusRequest));

        let outgoing = manager.drain_outgoing();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(
            outgoing[0].1.body,
            MessageBody::ParticipantsVotes(ParticipantsVotes::rejection(node(1), node(2)))
        );
    }

    #[test]
    fn votes_status_for_running_payment_is_undecided() {
        let manager = make_manager(1, PaymentConfig::new());
        let id = manager.launch_payment(node(2), TrustLineAmount::from(10u32)).unwrap();
        manager.process_message(Message::new(node(2), id, MessageBody::VotesStatusRequest));

        let replies: Vec<_> = manager
            .drain_outgoing()
            .into_iter()
            .filter(|(to, _)| *to == node(2))
            .collect();
        assert_eq!(
            replies[0].1.body,
            MessageBody::ParticipantsVotes(ParticipantsVotes::undecided())
        );
    }

    #[test]
    fn init_request_creates_receiver() {
        let manager = make_manager(1, PaymentConfig::new());
        let id = TransactionId::from_u128(5);
        let request = Message::new(
            node(2),
            id,
            MessageBody::ReceiverInitPaymentRequest {
                path_id: crate::base::PathId(0),
                amount: TrustLineAmount::from(50u32),
            },
        );
        manager.process_encoded(&codec::encode(&request).unwrap()).unwrap();
        assert!(manager.is_transaction_in_process(&id));

        let outgoing = manager.drain_outgoing();
        assert!(matches!(
            outgoing[0].1.body,
            MessageBody::ReceiverInitPaymentResponse {
                verdict: crate::messages::Verdict::Accepted,
                ..
            }
        ));
        assert!(manager.outcome(&id).is_none());
    }

    #[test]
    fn corrupted_bytes_are_refused() {
        let manager = make_manager(1, PaymentConfig::new());
        assert!(manager.process_encoded(&[0xff, 0x01]).is_err());
    }

    #[test]
    fn killed_payment_has_no_outcome() {
        let manager = make_manager(1, PaymentConfig::new());
        let id = manager.launch_payment(node(2), TrustLineAmount::from(10u32)).unwrap();
        assert!(manager.kill(&id));
        assert!(!manager.is_transaction_in_process(&id));
        assert_eq!(manager.outcome(&id), None);
    }
}
