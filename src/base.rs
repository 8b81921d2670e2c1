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

//! Core identifier and amount types shared by every payment transaction.

use num_bigint::BigUint;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::fmt;
use std::str::FromStr;

/// Amount carried by a trust line, a reservation or a payment.
///
/// Arbitrary precision and never negative. Signed quantities (balances)
/// use [`num_bigint::BigInt`] instead.
pub type TrustLineAmount = BigUint;

/// Error returned when an identifier can't be parsed from its hex form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError;

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("identifier must be 1 to 32 hex digits")
    }
}

impl std::error::Error for ParseIdError {}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub [u8; Self::SIZE]);

        impl $name {
            /// Size of the identifier on the wire.
            pub const SIZE: usize = 16;

            pub const fn from_u128(value: u128) -> Self {
                Self(value.to_be_bytes())
            }

            pub const fn as_u128(&self) -> u128 {
                u128::from_be_bytes(self.0)
            }

            pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0 == [0u8; Self::SIZE]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:x}", self.as_u128())
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.is_empty() || s.len() > 32 {
                    return Err(ParseIdError);
                }
                u128::from_str_radix(s, 16)
                    .map(Self::from_u128)
                    .map_err(|_| ParseIdError)
            }
        }

        // Hex text in CSV and JSON, raw bytes on the wire.
        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                if serializer.is_human_readable() {
                    serializer.collect_str(self)
                } else {
                    self.0.serialize(serializer)
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                if deserializer.is_human_readable() {
                    let text = String::deserialize(deserializer)?;
                    text.parse().map_err(de::Error::custom)
                } else {
                    <[u8; Self::SIZE]>::deserialize(deserializer).map(Self)
                }
            }
        }
    };
}

opaque_id!(
    /// Identifier of a node in the trust network.
    ///
    /// The all-zero value is reserved: a ballot carrying an empty
    /// coordinator means "not decided yet".
    NodeId
);

opaque_id!(
    /// Identifier of one payment, shared by every participant of it.
    TransactionId
);

impl TransactionId {
    /// Derives a fresh identifier from the originating node and a local counter.
    pub fn generate(origin: &NodeId, counter: u64) -> Self {
        let prefix = origin.as_u128() as u64 as u128;
        Self::from_u128((prefix << 64) | counter as u128)
    }
}

/// Identifier of one path inside a payment transaction.
///
/// Unique only within the transaction that allocated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathId(pub u16);

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
