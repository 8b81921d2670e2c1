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

//! Protocol tuning parameters.
//!
//! Every suspend point of a payment transaction waits for a multiple of
//! [`PaymentConfig::message_transfer_lag`]. Nodes that must interoperate
//! have to agree on these values.
//!
//! The configuration loads from TOML; missing keys keep their defaults and
//! durations are given in milliseconds:
//!
//! ```toml
//! max_path_length = 4
//! message_transfer_lag_ms = 500
//! max_recovery_attempts = 2
//! ```

use serde::{Deserialize, Deserializer};
use std::time::Duration;

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Configuration shared by all payment transactions of one node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PaymentConfig {
    /// Longest accepted path, sender and receiver included.
    pub max_path_length: usize,

    /// Time budget for one message to cross one hop.
    #[serde(rename = "message_transfer_lag_ms", deserialize_with = "millis")]
    pub message_transfer_lag: Duration,

    /// Receiver timeouts tolerated before the payment is given up.
    pub max_receiver_inaccessible: u32,

    /// Liveness questions a participant sends without hearing back.
    pub max_clarification_attempts: u32,

    /// Recovery rounds a voted participant performs before giving up.
    pub max_recovery_attempts: u32,

    /// Pause before a recovery round is repeated.
    #[serde(rename = "recovery_retry_delay_ms", deserialize_with = "millis")]
    pub recovery_retry_delay: Duration,

    /// When false, new outgoing payments are refused.
    pub payments_enabled: bool,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            max_path_length: 5,
            message_transfer_lag: Duration::from_millis(2_000),
            max_receiver_inaccessible: 3,
            max_clarification_attempts: 3,
            max_recovery_attempts: 5,
            recovery_retry_delay: Duration::from_millis(2_000),
            payments_enabled: true,
        }
    }
}

impl PaymentConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a TOML document; absent keys keep their defaults.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Upper bound for a round trip spanning `hops` message transfers.
    pub fn max_network_delay(&self, hops: u32) -> Duration {
        self.message_transfer_lag * hops
    }

    /// How long the receiver waits for the next reservation request.
    pub fn receiver_reservation_window(&self) -> Duration {
        let hops = self.max_path_length.saturating_sub(1) as u32;
        self.max_network_delay(hops * 4)
    }

    /// Set the maximum path length.
    pub fn with_max_path_length(mut self, length: usize) -> Self {
        self.max_path_length = length;
        self
    }

    /// Set the per-hop message transfer lag.
    pub fn with_message_transfer_lag(mut self, lag: Duration) -> Self {
        self.message_transfer_lag = lag;
        self
    }

    /// Set how many receiver timeouts are tolerated.
    pub fn with_max_receiver_inaccessible(mut self, count: u32) -> Self {
        self.max_receiver_inaccessible = count;
        self
    }

    /// Set the number of liveness questions before giving up.
    pub fn with_max_clarification_attempts(mut self, count: u32) -> Self {
        self.max_clarification_attempts = count;
        self
    }

    /// Set the number of recovery rounds before giving up.
    pub fn with_max_recovery_attempts(mut self, count: u32) -> Self {
        self.max_recovery_attempts = count;
        self
    }

    pub fn with_recovery_retry_delay(mut self, delay: Duration) -> Self {
        self.recovery_retry_delay = delay;
        self
    }

    pub fn with_payments_enabled(mut self, enabled: bool) -> Self {
        self.payments_enabled = enabled;
        self
    }
}
