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

//! Trust line ledger and the reservation arena it owns.
//!
//! Balance sign convention: a positive balance means the contractor owes
//! us, a negative one means we owe the contractor.
//!
//! ```text
//! available outgoing = outgoing limit + balance - reserved outgoing
//! available incoming = incoming limit - balance - reserved incoming
//! ```
//!
//! Both are clamped at zero.
//!
//! # Example
//!
//! ```
//! use num_bigint::BigUint;
//! use trustnet_payments::{NodeId, TrustLines};
//!
//! let lines = TrustLines::new(NodeId::from_u128(1));
//! lines.open(NodeId::from_u128(2), BigUint::from(50u32), BigUint::from(100u32));
//! assert_eq!(lines.available_outgoing(&NodeId::from_u128(2)), BigUint::from(100u32));
//! ```

use crate::base::{NodeId, PathId, TransactionId, TrustLineAmount};
use crate::error::PaymentError;
use crate::reservations::{AmountReservation, ReservationDirection};
use dashmap::DashMap;
use num_bigint::BigInt;
use num_traits::Zero;
use parking_lot::Mutex;
use serde::ser::{Serialize, SerializeStruct, Serializer};

fn non_negative(value: BigInt) -> TrustLineAmount {
    value.to_biguint().unwrap_or_default()
}

#[derive(Debug)]
struct TrustLineData {
    owner: NodeId,
    contractor: NodeId,
    incoming_limit: TrustLineAmount,
    outgoing_limit: TrustLineAmount,
    balance: BigInt,
    active: bool,
    reservations: Vec<AmountReservation>,
}

impl TrustLineData {
    fn new(
        owner: NodeId,
        contractor: NodeId,
        incoming_limit: TrustLineAmount,
        outgoing_limit: TrustLineAmount,
    ) -> Self {
        Self {
            owner,
            contractor,
            incoming_limit,
            outgoing_limit,
            balance: BigInt::zero(),
            active: true,
            reservations: Vec::new(),
        }
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.reservations.iter().all(|r| !r.amount.is_zero()),
            "Invariant violated: zero amount reservation held with {}",
            self.contractor
        );
        debug_assert!(
            self.reservations.iter().enumerate().all(|(i, r)| {
                self.reservations[i + 1..].iter().all(|o| !r.same_slot(o))
            }),
            "Invariant violated: duplicated reservation slot with {}",
            self.contractor
        );
    }

    fn reserved(
        &self,
        direction: ReservationDirection,
        transaction_id: Option<&TransactionId>,
    ) -> TrustLineAmount {
        self.reservations
            .iter()
            .filter(|r| r.direction == direction)
            .filter(|r| transaction_id.is_none_or(|id| &r.transaction_id == id))
            .map(|r| &r.amount)
            .sum()
    }

    fn available_outgoing(&self) -> TrustLineAmount {
        if !self.active {
            return TrustLineAmount::zero();
        }
        let reserved = BigInt::from(self.reserved(ReservationDirection::Outgoing, None));
        non_negative(BigInt::from(self.outgoing_limit.clone()) + &self.balance - reserved)
    }

    fn available_incoming(&self) -> TrustLineAmount {
        if !self.active {
            return TrustLineAmount::zero();
        }
        let reserved = BigInt::from(self.reserved(ReservationDirection::Incoming, None));
        non_negative(BigInt::from(self.incoming_limit.clone()) - &self.balance - reserved)
    }

    fn available(&self, direction: ReservationDirection) -> TrustLineAmount {
        match direction {
            ReservationDirection::Incoming => self.available_incoming(),
            ReservationDirection::Outgoing => self.available_outgoing(),
        }
    }

    fn position(&self, reservation: &AmountReservation) -> Result<usize, PaymentError> {
        self.reservations
            .iter()
            .position(|r| r.same_slot(reservation))
            .ok_or(PaymentError::ReservationNotFound)
    }

    /// Places a new hold if the direction still has room for it.
    fn reserve(
        &mut self,
        transaction_id: TransactionId,
        path_id: PathId,
        amount: TrustLineAmount,
        direction: ReservationDirection,
    ) -> Result<AmountReservation, PaymentError> {
        if amount.is_zero() {
            return Err(PaymentError::InvalidAmount);
        }
        if self.available(direction) < amount {
            return Err(PaymentError::InsufficientAmount);
        }
        let reservation = AmountReservation {
            counterparty: self.contractor,
            transaction_id,
            path_id,
            amount,
            direction,
        };
        if self.reservations.iter().any(|r| r.same_slot(&reservation)) {
            return Err(PaymentError::DuplicateReservation(path_id));
        }
        self.reservations.push(reservation.clone());
        self.assert_invariants();
        Ok(reservation)
    }

    /// Shrinks a hold in place.
    fn update(
        &mut self,
        reservation: &AmountReservation,
        new_amount: TrustLineAmount,
    ) -> Result<AmountReservation, PaymentError> {
        if new_amount.is_zero() {
            return Err(PaymentError::InvalidAmount);
        }
        let index = self.position(reservation)?;
        let held = &mut self.reservations[index];
        if new_amount > held.amount {
            return Err(PaymentError::ReservationIncrease);
        }
        held.amount = new_amount;
        let updated = held.clone();
        self.assert_invariants();
        Ok(updated)
    }

    fn free(&mut self, reservation: &AmountReservation) -> Result<AmountReservation, PaymentError> {
        let index = self.position(reservation)?;
        Ok(self.reservations.swap_remove(index))
    }

    fn apply(&mut self, delta: &BigInt) {
        self.balance += delta;
    }
}

/// One bilateral trust line, as seen by its owner.
///
/// All reads and writes go through the same lock, so an availability check
/// and the reservation that depends on it can't interleave with another
/// transaction touching the same contractor.
#[derive(Debug)]
pub struct TrustLine {
    inner: Mutex<TrustLineData>,
}

impl TrustLine {
    pub fn new(
        owner: NodeId,
        contractor: NodeId,
        incoming_limit: TrustLineAmount,
        outgoing_limit: TrustLineAmount,
    ) -> Self {
        Self {
            inner: Mutex::new(TrustLineData::new(
                owner,
                contractor,
                incoming_limit,
                outgoing_limit,
            )),
        }
    }

    pub fn contractor(&self) -> NodeId {
        self.inner.lock().contractor
    }

    pub fn incoming_limit(&self) -> TrustLineAmount {
        self.inner.lock().incoming_limit.clone()
    }

    pub fn outgoing_limit(&self) -> TrustLineAmount {
        self.inner.lock().outgoing_limit.clone()
    }

    pub fn balance(&self) -> BigInt {
        self.inner.lock().balance.clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    pub fn available_outgoing(&self) -> TrustLineAmount {
        self.inner.lock().available_outgoing()
    }

    pub fn available_incoming(&self) -> TrustLineAmount {
        self.inner.lock().available_incoming()
    }

    /// Number of reservations currently held on this line.
    pub fn reservations_count(&self) -> usize {
        self.inner.lock().reservations.len()
    }
}

impl Serialize for TrustLine {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let data = self.inner.lock();
        let mut state = serializer.serialize_struct("TrustLine", 6)?;
        state.serialize_field("node", &data.owner)?;
        state.serialize_field("contractor", &data.contractor)?;
        state.serialize_field("incoming_limit", &data.incoming_limit.to_string())?;
        state.serialize_field("outgoing_limit", &data.outgoing_limit.to_string())?;
        state.serialize_field("balance", &data.balance.to_string())?;
        state.serialize_field("active", &data.active)?;
        state.end()
    }
}

/// All trust lines of one node, keyed by contractor.
///
/// This is the only place reservations are stored; transactions hold
/// [`AmountReservation`] handles and mutate them through the methods below.
#[derive(Debug)]
pub struct TrustLines {
    owner: NodeId,
    lines: DashMap<NodeId, TrustLine>,
}

impl TrustLines {
    pub fn new(owner: NodeId) -> Self {
        Self {
            owner,
            lines: DashMap::new(),
        }
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// Opens a trust line with `contractor`, or resets the limits of an existing one.
    pub fn open(
        &self,
        contractor: NodeId,
        incoming_limit: TrustLineAmount,
        outgoing_limit: TrustLineAmount,
    ) {
        let line = self.lines.entry(contractor).or_insert_with(|| {
            TrustLine::new(
                self.owner,
                contractor,
                TrustLineAmount::zero(),
                TrustLineAmount::zero(),
            )
        });
        let mut data = line.inner.lock();
        data.incoming_limit = incoming_limit;
        data.outgoing_limit = outgoing_limit;
        data.active = true;
    }

    /// Deactivates the line. Held reservations stay until freed.
    pub fn close(&self, contractor: &NodeId) -> Result<(), PaymentError> {
        let line = self.line(contractor)?;
        line.inner.lock().active = false;
        Ok(())
    }

    fn line(
        &self,
        contractor: &NodeId,
    ) -> Result<dashmap::mapref::one::Ref<'_, NodeId, TrustLine>, PaymentError> {
        self.lines
            .get(contractor)
            .ok_or(PaymentError::TrustLineAbsent(*contractor))
    }

    pub fn get(
        &self,
        contractor: &NodeId,
    ) -> Option<dashmap::mapref::one::Ref<'_, NodeId, TrustLine>> {
        self.lines.get(contractor)
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = dashmap::mapref::multiple::RefMulti<'_, NodeId, TrustLine>> {
        self.lines.iter()
    }

    pub fn contractors(&self) -> Vec<NodeId> {
        let mut contractors: Vec<NodeId> = self.lines.iter().map(|line| *line.key()).collect();
        contractors.sort();
        contractors
    }

    pub fn is_neighbor(&self, contractor: &NodeId) -> bool {
        self.lines
            .get(contractor)
            .is_some_and(|line| line.is_active())
    }

    /// Fails with [`PaymentError::NotNeighbor`] unless an active line links us to `contractor`.
    pub fn ensure_neighbor(&self, contractor: &NodeId) -> Result<(), PaymentError> {
        if self.is_neighbor(contractor) {
            Ok(())
        } else {
            Err(PaymentError::NotNeighbor(*contractor))
        }
    }

    pub fn available_outgoing(&self, contractor: &NodeId) -> TrustLineAmount {
        self.lines
            .get(contractor)
            .map(|line| line.available_outgoing())
            .unwrap_or_default()
    }

    pub fn available_incoming(&self, contractor: &NodeId) -> TrustLineAmount {
        self.lines
            .get(contractor)
            .map(|line| line.available_incoming())
            .unwrap_or_default()
    }

    /// Sum of what this node could still pay over all its lines.
    pub fn total_available_outgoing(&self) -> TrustLineAmount {
        self.lines.iter().map(|line| line.available_outgoing()).sum()
    }

    /// Sum of what this node could still receive over all its lines.
    pub fn total_available_incoming(&self) -> TrustLineAmount {
        self.lines.iter().map(|line| line.available_incoming()).sum()
    }

    pub fn balance(&self, contractor: &NodeId) -> Option<BigInt> {
        self.lines.get(contractor).map(|line| line.balance())
    }

    pub fn total_balance(&self) -> BigInt {
        self.lines.iter().map(|line| line.balance()).sum()
    }

    /// Reserves `amount` toward `counterparty`.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::InvalidAmount`] - Amount is zero.
    /// - [`PaymentError::TrustLineAbsent`] - No line with the counterparty.
    /// - [`PaymentError::InsufficientAmount`] - Amount exceeds what is available.
    /// - [`PaymentError::DuplicateReservation`] - Path already holds a reservation in this direction.
    pub fn reserve(
        &self,
        counterparty: &NodeId,
        transaction_id: TransactionId,
        path_id: PathId,
        amount: TrustLineAmount,
        direction: ReservationDirection,
    ) -> Result<AmountReservation, PaymentError> {
        let line = self.line(counterparty)?;
        let mut data = line.inner.lock();
        data.reserve(transaction_id, path_id, amount, direction)
    }

    /// Shrinks `reservation` to `new_amount` and returns the new handle.
    pub fn update(
        &self,
        reservation: &AmountReservation,
        new_amount: TrustLineAmount,
    ) -> Result<AmountReservation, PaymentError> {
        let line = self.line(&reservation.counterparty)?;
        let mut data = line.inner.lock();
        data.update(reservation, new_amount)
    }

    /// Releases `reservation`. Freeing twice is an error.
    pub fn free(&self, reservation: &AmountReservation) -> Result<(), PaymentError> {
        let line = self.line(&reservation.counterparty)?;
        let mut data = line.inner.lock();
        data.free(reservation).map(|_| ())
    }

    /// Sum of amounts held toward `counterparty`, optionally for one transaction only.
    pub fn total_reserved(
        &self,
        counterparty: &NodeId,
        direction: ReservationDirection,
        transaction_id: Option<&TransactionId>,
    ) -> TrustLineAmount {
        self.lines
            .get(counterparty)
            .map(|line| line.inner.lock().reserved(direction, transaction_id))
            .unwrap_or_default()
    }

    /// Moves the balance with `counterparty` by `delta`.
    pub fn apply_committed_amount(
        &self,
        counterparty: &NodeId,
        delta: &BigInt,
    ) -> Result<(), PaymentError> {
        let line = self.line(counterparty)?;
        line.inner.lock().apply(delta);
        Ok(())
    }

    /// Converts a held reservation into a balance change and releases it.
    ///
    /// The balance moves before the hold is released, so in between the
    /// line reports less capacity than it has, never more.
    pub fn commit_reservation(&self, reservation: &AmountReservation) -> Result<(), PaymentError> {
        let held = {
            let line = self.line(&reservation.counterparty)?;
            let data = line.inner.lock();
            data.reservations[data.position(reservation)?].clone()
        };
        self.apply_committed_amount(&held.counterparty, &held.committed_delta())?;
        self.free(&held)
    }

    /// Releases every reservation `transaction_id` still holds on any line.
    ///
    /// Returns how many reservations were dropped.
    pub fn free_transaction(&self, transaction_id: &TransactionId) -> usize {
        self.lines
            .iter()
            .map(|line| {
                let mut data = line.inner.lock();
                let before = data.reservations.len();
                data.reservations.retain(|r| &r.transaction_id != transaction_id);
                before - data.reservations.len()
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amount(value: u32) -> TrustLineAmount {
        TrustLineAmount::from(value)
    }

    fn make_data() -> TrustLineData {
        TrustLineData::new(
            NodeId::from_u128(1),
            NodeId::from_u128(2),
            amount(50),
            amount(100),
        )
    }

    // === TrustLineData Internal Tests ===

    #[test]
    fn data_reserve_reduces_availability() {
        let mut data = make_data();
        data.reserve(
            TransactionId::from_u128(1),
            PathId(0),
            amount(30),
            ReservationDirection::Outgoing,
        )
        .unwrap();
        assert_eq!(data.available_outgoing(), amount(70));
        assert_eq!(data.available_incoming(), amount(50));
    }

    #[test]
    fn data_balance_shifts_availability() {
        let mut data = make_data();
        data.apply(&BigInt::from(-40));
        assert_eq!(data.available_outgoing(), amount(60));
        assert_eq!(data.available_incoming(), amount(90));
    }

    #[test]
    fn data_availability_never_negative() {
        let mut data = make_data();
        data.apply(&BigInt::from(-150));
        assert_eq!(data.available_outgoing(), amount(0));
    }

    #[test]
    fn data_inactive_line_has_nothing_available() {
        let mut data = make_data();
        data.active = false;
        assert!(data.available_outgoing().is_zero());
        assert!(data.available_incoming().is_zero());
    }

    #[test]
    fn data_update_rejects_zero() {
        let mut data = make_data();
        let reservation = data
            .reserve(
                TransactionId::from_u128(1),
                PathId(0),
                amount(30),
                ReservationDirection::Incoming,
            )
            .unwrap();
        assert_eq!(
            data.update(&reservation, amount(0)),
            Err(PaymentError::InvalidAmount)
        );
    }

    // === Serialization Tests ===

    #[test]
    fn serializer_writes_amounts_as_strings() {
        let line = TrustLine::new(
            NodeId::from_u128(0xa),
            NodeId::from_u128(0xb),
            amount(5),
            amount(7),
        );
        line.inner.lock().apply(&BigInt::from(-3));

        let json = serde_json::to_string(&line).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["node"], "a");
        assert_eq!(parsed["contractor"], "b");
        assert_eq!(parsed["incoming_limit"], "5");
        assert_eq!(parsed["outgoing_limit"], "7");
        assert_eq!(parsed["balance"], "-3");
        assert_eq!(parsed["active"], true);
    }
}
