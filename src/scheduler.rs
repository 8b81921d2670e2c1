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

//! Drives payment transactions by the directives their `run` returns.
//!
//! The scheduler never sleeps: time is whatever the owner passes to
//! [`TransactionsScheduler::tick`]. A transaction runs when a message or
//! resource it waits for is attached, or when its deadline passes.

use crate::base::TransactionId;
use crate::error::PaymentError;
use crate::messages::{Message, MessageType};
use crate::result::{PaymentOutcome, Resource, ResourceType, TransactionResult};
use crate::transactions::{PaymentTransaction, TransactionKind};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace};

/// What a suspended transaction is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Awaiting {
    /// Only the deadline.
    Deadline,
    Messages(Vec<MessageType>),
    Resources(Vec<ResourceType>),
}

#[derive(Debug)]
struct Scheduled {
    transaction: PaymentTransaction,
    awaiting: Awaiting,
    deadline: Duration,
}

/// A transaction that left the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedTransaction {
    pub id: TransactionId,
    pub kind: TransactionKind,
    /// Command result; only coordinators produce one.
    pub outcome: Option<PaymentOutcome>,
}

/// Result of handing a message or resource to an existing transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    /// Delivered and the transaction ran.
    Attached,
    /// The transaction doesn't wait for this type; the input was dropped.
    Ignored,
}

#[derive(Debug, Default)]
struct SchedulerData {
    now: Duration,
    transactions: BTreeMap<TransactionId, Scheduled>,
    finished: Vec<FinishedTransaction>,
}

impl SchedulerData {
    /// Runs `scheduled` and files it according to the directive it returns.
    fn run(&mut self, mut scheduled: Scheduled) {
        let id = scheduled.transaction.id();
        let result = scheduled.transaction.run();
        trace!(transaction = %id, ?result, "transaction ran");
        let now = self.now;
        match result {
            TransactionResult::Done(outcome) => {
                debug!(transaction = %id, role = %scheduled.transaction.kind(), "transaction finished");
                self.finished.push(FinishedTransaction {
                    id,
                    kind: scheduled.transaction.kind(),
                    outcome,
                });
                return;
            }
            TransactionResult::FlushAndContinue => {
                scheduled.awaiting = Awaiting::Deadline;
                scheduled.deadline = now;
            }
            TransactionResult::WaitForMessages { types, timeout } => {
                scheduled.awaiting = Awaiting::Messages(types);
                scheduled.deadline = now + timeout;
            }
            TransactionResult::WaitForResources { types, timeout } => {
                scheduled.awaiting = Awaiting::Resources(types);
                scheduled.deadline = now + timeout;
            }
            TransactionResult::AwakeAfter(delay) => {
                scheduled.awaiting = Awaiting::Deadline;
                scheduled.deadline = now + delay;
            }
            TransactionResult::ContinuePreviousState => {}
        }
        self.transactions.insert(id, scheduled);
    }

    fn next_due(&self) -> Option<TransactionId> {
        self.transactions
            .iter()
            .filter(|(_, scheduled)| scheduled.deadline <= self.now)
            .min_by_key(|(_, scheduled)| scheduled.deadline)
            .map(|(id, _)| *id)
    }
}

/// Cooperative scheduler of the payment transactions of one node.
#[derive(Debug, Default)]
pub struct TransactionsScheduler {
    inner: Mutex<SchedulerData>,
}

impl TransactionsScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.inner.lock().now
    }

    /// Adds `transaction` and runs it right away.
    ///
    /// # Errors
    ///
    /// Returns [`PaymentError::DuplicateTransaction`] if a transaction with
    /// the same id is already scheduled.
    pub fn schedule(&self, transaction: PaymentTransaction) -> Result<(), PaymentError> {
        let mut data = self.inner.lock();
        let id = transaction.id();
        if data.transactions.contains_key(&id) {
            return Err(PaymentError::DuplicateTransaction(id));
        }
        let now = data.now;
        data.run(Scheduled {
            transaction,
            awaiting: Awaiting::Deadline,
            deadline: now,
        });
        Ok(())
    }

    /// Adds `transaction` to run once `delay` has passed.
    ///
    /// # Errors
    ///
    /// Returns [`PaymentError::DuplicateTransaction`] if a transaction with
    /// the same id is already scheduled.
    pub fn postpone(&self, transaction: PaymentTransaction, delay: Duration) -> Result<(), PaymentError> {
        let mut data = self.inner.lock();
        let id = transaction.id();
        if data.transactions.contains_key(&id) {
            return Err(PaymentError::DuplicateTransaction(id));
        }
        let deadline = data.now + delay;
        debug!(transaction = %id, ?delay, "transaction postponed");
        data.transactions.insert(
            id,
            Scheduled {
                transaction,
                awaiting: Awaiting::Deadline,
                deadline,
            },
        );
        Ok(())
    }

    /// Delivers `message` to its transaction if that transaction waits for its type.
    ///
    /// # Errors
    ///
    /// Hands `message` back if no transaction with its id is scheduled.
    pub fn try_attach_message(&self, message: Message) -> Result<Attachment, Message> {
        let mut data = self.inner.lock();
        let id = message.transaction_id;
        let message_type = message.message_type();
        let awaited = match data.transactions.get(&id) {
            None => return Err(message),
            Some(scheduled) => {
                matches!(&scheduled.awaiting, Awaiting::Messages(types) if types.contains(&message_type))
            }
        };
        if !awaited {
            debug!(transaction = %id, %message_type, sender = %message.sender, "message isn't awaited, dropped");
            return Ok(Attachment::Ignored);
        }
        let Some(mut scheduled) = data.transactions.remove(&id) else {
            return Err(message);
        };
        scheduled.transaction.push_message(message);
        data.run(scheduled);
        Ok(Attachment::Attached)
    }

    /// Delivers `resource` to transaction `id` if it waits for its type.
    ///
    /// # Errors
    ///
    /// Hands `resource` back if transaction `id` is not scheduled.
    pub fn attach_resource(&self, id: &TransactionId, resource: Resource) -> Result<Attachment, Resource> {
        let mut data = self.inner.lock();
        let resource_type = resource.resource_type();
        let awaited = match data.transactions.get(id) {
            None => return Err(resource),
            Some(scheduled) => {
                matches!(&scheduled.awaiting, Awaiting::Resources(types) if types.contains(&resource_type))
            }
        };
        if !awaited {
            debug!(transaction = %id, ?resource_type, "resource isn't awaited, dropped");
            return Ok(Attachment::Ignored);
        }
        let Some(mut scheduled) = data.transactions.remove(id) else {
            return Err(resource);
        };
        scheduled.transaction.push_resource(resource);
        data.run(scheduled);
        Ok(Attachment::Attached)
    }

    /// Advances the clock to `now` and runs every transaction whose deadline passed.
    ///
    /// Returns the number of runs.
    pub fn tick(&self, now: Duration) -> usize {
        let mut data = self.inner.lock();
        if now > data.now {
            data.now = now;
        }
        let mut runs = 0;
        while let Some(id) = data.next_due() {
            let Some(scheduled) = data.transactions.remove(&id) else {
                break;
            };
            data.run(scheduled);
            runs += 1;
        }
        runs
    }

    /// Removes transaction `id`, releasing its reservations.
    pub fn kill(&self, id: &TransactionId) -> bool {
        let mut data = self.inner.lock();
        let Some(mut scheduled) = data.transactions.remove(id) else {
            return false;
        };
        scheduled.transaction.kill();
        data.finished.push(FinishedTransaction {
            id: *id,
            kind: scheduled.transaction.kind(),
            outcome: None,
        });
        true
    }

    pub fn is_transaction_in_process(&self, id: &TransactionId) -> bool {
        self.inner.lock().transactions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().transactions.is_empty()
    }

    /// Earliest deadline among scheduled transactions.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.inner
            .lock()
            .transactions
            .values()
            .map(|scheduled| scheduled.deadline)
            .min()
    }

    /// Takes the transactions finished since the last call.
    pub fn drain_finished(&self) -> Vec<FinishedTransaction> {
        std::mem::take(&mut self.inner.lock().finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{NodeId, TrustLineAmount};
    use crate::config::PaymentConfig;
    use crate::messages::MessageBody;
    use crate::path_finder::GraphPathFinder;
    use crate::storage::MemoryStorage;
    use crate::transactions::{CoordinatorPaymentTransaction, TransactionContext};
    use crate::trust_lines::TrustLines;
    use crossbeam::channel::{Receiver, unbounded};
    use std::sync::Arc;

    fn node(n: u128) -> NodeId {
        NodeId::from_u128(n)
    }

    fn make_context(config: PaymentConfig) -> (TransactionContext, Receiver<crate::result::TransactionEvent>) {
        let trust_lines = TrustLines::new(node(1));
        trust_lines.open(node(2), TrustLineAmount::from(100u32), TrustLineAmount::from(100u32));
        let (events, receiver) = unbounded();
        let ctx = TransactionContext {
            node: node(1),
            trust_lines: Arc::new(trust_lines),
            storage: Arc::new(MemoryStorage::new()),
            path_finder: Arc::new(GraphPathFinder::new(config.max_path_length)),
            config,
            events,
        };
        (ctx, receiver)
    }

    fn make_payment(ctx: &TransactionContext, id: u128) -> PaymentTransaction {
        CoordinatorPaymentTransaction::new(
            ctx.clone(),
            TransactionId::from_u128(id),
            node(2),
            TrustLineAmount::from(10u32),
        )
        .into()
    }

    #[test]
    fn finished_transaction_leaves_the_scheduler() {
        let (ctx, _events) = make_context(PaymentConfig::new().with_payments_enabled(false));
        let scheduler = TransactionsScheduler::new();
        scheduler.schedule(make_payment(&ctx, 1)).unwrap();

        assert!(scheduler.is_empty());
        let finished = scheduler.drain_finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].kind, TransactionKind::Coordinator);
        assert_eq!(finished[0].outcome, Some(PaymentOutcome::ForbiddenRunTransaction));
        assert!(scheduler.drain_finished().is_empty());
    }

    #[test]
    fn duplicate_ids_are_refused() {
        let (ctx, _events) = make_context(PaymentConfig::new());
        let scheduler = TransactionsScheduler::new();
        scheduler.schedule(make_payment(&ctx, 1)).unwrap();
        assert_eq!(
            scheduler.schedule(make_payment(&ctx, 1)),
            Err(PaymentError::DuplicateTransaction(TransactionId::from_u128(1)))
        );
    }

    #[test]
    fn timeout_resumes_waiting_transaction() {
        let (ctx, _events) = make_context(PaymentConfig::new());
        let scheduler = TransactionsScheduler::new();
        scheduler.schedule(make_payment(&ctx, 1)).unwrap();

        let id = TransactionId::from_u128(1);
        assert!(scheduler.is_transaction_in_process(&id));
        let deadline = scheduler.next_deadline().unwrap();
        assert_eq!(deadline, ctx.config.max_network_delay(4));

        assert_eq!(scheduler.tick(deadline - Duration::from_millis(1)), 0);
        assert!(scheduler.is_transaction_in_process(&id));

        assert_eq!(scheduler.tick(deadline), 1);
        let finished = scheduler.drain_finished();
        assert_eq!(finished[0].outcome, Some(PaymentOutcome::NoRoutes));
    }

    #[test]
    fn messages_not_awaited_are_ignored() {
        let (ctx, _events) = make_context(PaymentConfig::new());
        let scheduler = TransactionsScheduler::new();
        scheduler.schedule(make_payment(&ctx, 1)).unwrap();

        let id = TransactionId::from_u128(1);
        let message = Message::new(node(2), id, MessageBody::TtlProlongationRequest);
        assert_eq!(scheduler.try_attach_message(message), Ok(Attachment::Ignored));

        let unknown = Message::new(node(2), TransactionId::from_u128(9), MessageBody::TtlProlongationRequest);
        assert_eq!(scheduler.try_attach_message(unknown.clone()), Err(unknown));
    }

    #[test]
    fn resources_wake_the_coordinator() {
        let (ctx, _events) = make_context(PaymentConfig::new());
        let scheduler = TransactionsScheduler::new();
        scheduler.schedule(make_payment(&ctx, 1)).unwrap();

        let id = TransactionId::from_u128(1);
        assert_eq!(scheduler.attach_resource(&id, Resource::Paths(Vec::new())), Ok(Attachment::Attached));
        let finished = scheduler.drain_finished();
        assert_eq!(finished[0].outcome, Some(PaymentOutcome::NoRoutes));
        assert!(scheduler.attach_resource(&id, Resource::Paths(Vec::new())).is_err());
    }

    #[test]
    fn postponed_transaction_runs_at_its_deadline() {
        let (ctx, _events) = make_context(PaymentConfig::new().with_payments_enabled(false));
        let scheduler = TransactionsScheduler::new();
        scheduler
            .postpone(make_payment(&ctx, 1), Duration::from_secs(1))
            .unwrap();
        assert_eq!(scheduler.tick(Duration::from_millis(500)), 0);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.tick(Duration::from_secs(1)), 1);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn kill_releases_the_transaction() {
        let (ctx, _events) = make_context(PaymentConfig::new());
        let scheduler = TransactionsScheduler::new();
        scheduler.schedule(make_payment(&ctx, 1)).unwrap();

        let id = TransactionId::from_u128(1);
        assert!(scheduler.kill(&id));
        assert!(!scheduler.kill(&id));
        assert!(!scheduler.is_transaction_in_process(&id));
        assert_eq!(scheduler.drain_finished()[0].outcome, None);
    }
}
