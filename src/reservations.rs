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

//! Amount reservations: temporary holds against a trust line's capacity.
//!
//! A reservation value is a handle. The authoritative copy lives in the
//! [`TrustLines`](crate::TrustLines) arena and is addressed by
//! `(counterparty, transaction, path, direction)`. Handles go stale after
//! an update, so callers keep the value returned by the last mutation.

use crate::base::{NodeId, PathId, TransactionId, TrustLineAmount};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the trust line a reservation holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ReservationDirection {
    /// Amount the counterparty is going to pay us.
    Incoming,
    /// Amount we are going to pay the counterparty.
    Outgoing,
}

impl ReservationDirection {
    pub fn opposite(self) -> Self {
        match self {
            ReservationDirection::Incoming => ReservationDirection::Outgoing,
            ReservationDirection::Outgoing => ReservationDirection::Incoming,
        }
    }
}

impl fmt::Display for ReservationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReservationDirection::Incoming => f.write_str("incoming"),
            ReservationDirection::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// A hold of `amount` on the trust line with `counterparty` for one path of one payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmountReservation {
    pub counterparty: NodeId,
    pub transaction_id: TransactionId,
    pub path_id: PathId,
    pub amount: TrustLineAmount,
    pub direction: ReservationDirection,
}

impl AmountReservation {
    /// True when `other` addresses the same slot in the arena.
    pub fn same_slot(&self, other: &AmountReservation) -> bool {
        self.counterparty == other.counterparty
            && self.transaction_id == other.transaction_id
            && self.path_id == other.path_id
            && self.direction == other.direction
    }

    /// Balance change this hold produces once the payment commits.
    pub fn committed_delta(&self) -> BigInt {
        match self.direction {
            ReservationDirection::Outgoing => -BigInt::from(self.amount.clone()),
            ReservationDirection::Incoming => BigInt::from(self.amount.clone()),
        }
    }
}

/// What a node claims to hold toward one neighbor, exchanged before voting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationClaim {
    pub path_id: PathId,
    pub amount: TrustLineAmount,
    pub direction: ReservationDirection,
}

impl From<&AmountReservation> for ReservationClaim {
    fn from(reservation: &AmountReservation) -> Self {
        Self {
            path_id: reservation.path_id,
            amount: reservation.amount.clone(),
            direction: reservation.direction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_reservation(path: u16, direction: ReservationDirection) -> AmountReservation {
        AmountReservation {
            counterparty: NodeId::from_u128(2),
            transaction_id: TransactionId::from_u128(1),
            path_id: PathId(path),
            amount: TrustLineAmount::from(10u32),
            direction,
        }
    }

    #[test]
    fn opposite_direction() {
        assert_eq!(
            ReservationDirection::Incoming.opposite(),
            ReservationDirection::Outgoing
        );
        assert_eq!(
            ReservationDirection::Outgoing.opposite(),
            ReservationDirection::Incoming
        );
    }

    #[test]
    fn same_slot_ignores_amount() {
        let a = make_reservation(1, ReservationDirection::Outgoing);
        let mut b = a.clone();
        b.amount = TrustLineAmount::from(3u32);
        assert!(a.same_slot(&b));
        assert!(!a.same_slot(&make_reservation(2, ReservationDirection::Outgoing)));
        assert!(!a.same_slot(&make_reservation(1, ReservationDirection::Incoming)));
    }

    #[test]
    fn committed_delta_follows_direction() {
        assert_eq!(
            make_reservation(1, ReservationDirection::Outgoing).committed_delta(),
            BigInt::from(-10)
        );
        assert_eq!(
            make_reservation(1, ReservationDirection::Incoming).committed_delta(),
            BigInt::from(10)
        );
    }

    #[test]
    fn claim_copies_reservation_fields() {
        let reservation = make_reservation(4, ReservationDirection::Incoming);
        let claim = ReservationClaim::from(&reservation);
        assert_eq!(claim.path_id, PathId(4));
        assert_eq!(claim.amount, TrustLineAmount::from(10u32));
        assert_eq!(claim.direction, ReservationDirection::Incoming);
    }
}
