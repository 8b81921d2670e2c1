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

//! Transactional persistence of payment history and ballots.
//!
//! Commit writes the payment record and the final ballot in one storage
//! transaction, so a node never reports a payment as conducted without
//! being able to prove it to other participants.

use crate::base::{NodeId, TransactionId, TrustLineAmount};
use crate::error::StorageError;
use dashmap::DashMap;
use num_bigint::BigInt;
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use std::fmt::Display;

fn as_display_string<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// Direction of a committed payment, from this node's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PaymentKind {
    Outgoing,
    Incoming,
}

/// One line of payment history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentRecord {
    pub transaction_id: TransactionId,
    pub kind: PaymentKind,
    pub counterparty: NodeId,
    #[serde(serialize_with = "as_display_string")]
    pub amount: TrustLineAmount,
    /// Total balance over all trust lines right after the commit.
    #[serde(serialize_with = "as_display_string")]
    pub balance_after: BigInt,
}

/// Write handle. Nothing is visible to readers until [`commit`](StorageTransaction::commit).
pub trait StorageTransaction {
    fn save_payment_record(&mut self, record: PaymentRecord) -> Result<(), StorageError>;

    fn save_ballot_state(
        &mut self,
        transaction_id: TransactionId,
        ballot: Vec<u8>,
    ) -> Result<(), StorageError>;

    fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Discards pending writes.
    fn rollback(self: Box<Self>);
}

/// Storage capability injected into every payment transaction.
pub trait PaymentStorage: Send + Sync {
    fn begin(&self) -> Box<dyn StorageTransaction + '_>;

    /// Serialized ballot stored for `transaction_id`.
    fn load_ballot_state(&self, transaction_id: &TransactionId) -> Result<Vec<u8>, StorageError>;

    /// Whether a payment record exists for `transaction_id`.
    fn record_conducted(&self, transaction_id: &TransactionId) -> bool;

    fn payment_records(&self) -> Vec<PaymentRecord>;
}

/// In-memory [`PaymentStorage`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    ballots: DashMap<TransactionId, Vec<u8>>,
    records: Mutex<Vec<PaymentRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PaymentStorage for MemoryStorage {
    fn begin(&self) -> Box<dyn StorageTransaction + '_> {
        Box::new(MemoryTransaction {
            storage: self,
            records: Vec::new(),
            ballots: Vec::new(),
        })
    }

    fn load_ballot_state(&self, transaction_id: &TransactionId) -> Result<Vec<u8>, StorageError> {
        self.ballots
            .get(transaction_id)
            .map(|ballot| ballot.value().clone())
            .ok_or(StorageError::NotFound)
    }

    fn record_conducted(&self, transaction_id: &TransactionId) -> bool {
        self.records
            .lock()
            .iter()
            .any(|record| &record.transaction_id == transaction_id)
    }

    fn payment_records(&self) -> Vec<PaymentRecord> {
        self.records.lock().clone()
    }
}

struct MemoryTransaction<'a> {
    storage: &'a MemoryStorage,
    records: Vec<PaymentRecord>,
    ballots: Vec<(TransactionId, Vec<u8>)>,
}

impl StorageTransaction for MemoryTransaction<'_> {
    fn save_payment_record(&mut self, record: PaymentRecord) -> Result<(), StorageError> {
        self.records.push(record);
        Ok(())
    }

    fn save_ballot_state(
        &mut self,
        transaction_id: TransactionId,
        ballot: Vec<u8>,
    ) -> Result<(), StorageError> {
        self.ballots.push((transaction_id, ballot));
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        // Records lock is held while ballots are written so readers never see
        // a record without its ballot.
        let mut records = self.storage.records.lock();
        for (transaction_id, ballot) in self.ballots {
            self.storage.ballots.insert(transaction_id, ballot);
        }
        records.extend(self.records);
        Ok(())
    }

    fn rollback(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(id: u128) -> PaymentRecord {
        PaymentRecord {
            transaction_id: TransactionId::from_u128(id),
            kind: PaymentKind::Outgoing,
            counterparty: NodeId::from_u128(2),
            amount: TrustLineAmount::from(100u32),
            balance_after: BigInt::from(-100),
        }
    }

    #[test]
    fn writes_invisible_until_commit() {
        let storage = MemoryStorage::new();
        let id = TransactionId::from_u128(1);

        let mut tx = storage.begin();
        tx.save_payment_record(make_record(1)).unwrap();
        tx.save_ballot_state(id, vec![1, 2, 3]).unwrap();
        assert!(!storage.record_conducted(&id));
        assert_eq!(storage.load_ballot_state(&id), Err(StorageError::NotFound));

        tx.commit().unwrap();
        assert!(storage.record_conducted(&id));
        assert_eq!(storage.load_ballot_state(&id).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn rollback_discards_writes() {
        let storage = MemoryStorage::new();
        let mut tx = storage.begin();
        tx.save_payment_record(make_record(1)).unwrap();
        tx.rollback();
        assert!(storage.payment_records().is_empty());
    }

    #[test]
    fn record_serializes_amounts_as_strings() {
        let json = serde_json::to_string(&make_record(0xa)).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["transaction_id"], "a");
        assert_eq!(parsed["kind"], "Outgoing");
        assert_eq!(parsed["amount"], "100");
        assert_eq!(parsed["balance_after"], "-100");
    }
}
