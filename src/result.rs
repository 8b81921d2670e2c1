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

//! What a transaction hands back to the scheduler and the manager.
//!
//! A `run` never blocks. It returns a [`TransactionResult`] telling the
//! scheduler when to run it again, and pushes [`TransactionEvent`]s for
//! everything that has to leave the transaction.

use crate::base::{NodeId, TransactionId};
use crate::messages::{Message, MessageType};
use crate::path::Path;
use std::fmt;
use std::time::Duration;

/// Caller-facing result of a payment command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Ok(TransactionId),
    ProtocolError,
    InsufficientFunds,
    RemoteNodeInaccessible,
    NoConsensus,
    NoRoutes,
    UnexpectedError,
    ForbiddenRunTransaction,
}

impl PaymentOutcome {
    /// Stable numeric result code.
    pub fn code(&self) -> u16 {
        match self {
            PaymentOutcome::Ok(_) => 200,
            PaymentOutcome::ProtocolError => 401,
            PaymentOutcome::InsufficientFunds => 412,
            PaymentOutcome::RemoteNodeInaccessible => 444,
            PaymentOutcome::NoConsensus => 449,
            PaymentOutcome::NoRoutes => 462,
            PaymentOutcome::UnexpectedError => 501,
            PaymentOutcome::ForbiddenRunTransaction => 603,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, PaymentOutcome::Ok(_))
    }
}

impl fmt::Display for PaymentOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentOutcome::Ok(id) => write!(f, "{} ok {id}", self.code()),
            PaymentOutcome::ProtocolError => write!(f, "{} protocol error", self.code()),
            PaymentOutcome::InsufficientFunds => write!(f, "{} insufficient funds", self.code()),
            PaymentOutcome::RemoteNodeInaccessible => {
                write!(f, "{} remote node is inaccessible", self.code())
            }
            PaymentOutcome::NoConsensus => write!(f, "{} no consensus", self.code()),
            PaymentOutcome::NoRoutes => write!(f, "{} no routes", self.code()),
            PaymentOutcome::UnexpectedError => write!(f, "{} unexpected error", self.code()),
            PaymentOutcome::ForbiddenRunTransaction => {
                write!(f, "{} payments are disabled", self.code())
            }
        }
    }
}

/// Kinds of resources a transaction may wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Paths,
}

/// Asynchronously produced input attached to a waiting transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Candidate paths from the path finder.
    Paths(Vec<Path>),
}

impl Resource {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Resource::Paths(_) => ResourceType::Paths,
        }
    }
}

/// Scheduling directive returned by every transaction `run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionResult {
    /// Terminal. Carries the command result for transactions started by a command.
    Done(Option<PaymentOutcome>),
    /// Run again as soon as the produced messages are flushed.
    FlushAndContinue,
    /// Suspend until one of `types` arrives or `timeout` elapses.
    WaitForMessages {
        types: Vec<MessageType>,
        timeout: Duration,
    },
    /// Suspend until one of `types` is attached or `timeout` elapses.
    WaitForResources {
        types: Vec<ResourceType>,
        timeout: Duration,
    },
    /// Sleep for the given delay, then run again.
    AwakeAfter(Duration),
    /// Keep the previous wait, including its deadline.
    ContinuePreviousState,
}

impl TransactionResult {
    pub fn done() -> Self {
        TransactionResult::Done(None)
    }

    pub fn outcome(outcome: PaymentOutcome) -> Self {
        TransactionResult::Done(Some(outcome))
    }

    pub fn wait_for_messages(types: &[MessageType], timeout: Duration) -> Self {
        TransactionResult::WaitForMessages {
            types: types.to_vec(),
            timeout,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, TransactionResult::Done(_))
    }
}

/// Follow-up work a payment hands to the rest of the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubsidiaryTransactionRequest {
    /// Look for debt cycles through the given neighbors, whose balances just changed.
    CycleClosing { neighbors: Vec<NodeId> },
}

/// Side effects produced by a transaction run, drained by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEvent {
    OutgoingMessage { to: NodeId, message: Message },
    SubsidiaryTransaction(SubsidiaryTransactionRequest),
    /// Snapshot of a voted participant's ballot, kept so the node can
    /// recover the payment if it loses the in-memory transaction.
    SerializationRequest {
        transaction_id: TransactionId,
        ballot: Vec<u8>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_codes() {
        assert_eq!(PaymentOutcome::Ok(TransactionId::from_u128(1)).code(), 200);
        assert_eq!(PaymentOutcome::ProtocolError.code(), 401);
        assert_eq!(PaymentOutcome::InsufficientFunds.code(), 412);
        assert_eq!(PaymentOutcome::RemoteNodeInaccessible.code(), 444);
        assert_eq!(PaymentOutcome::NoConsensus.code(), 449);
        assert_eq!(PaymentOutcome::NoRoutes.code(), 462);
        assert_eq!(PaymentOutcome::UnexpectedError.code(), 501);
        assert_eq!(PaymentOutcome::ForbiddenRunTransaction.code(), 603);
    }

    #[test]
    fn outcome_display_never_leaks_internals() {
        assert_eq!(PaymentOutcome::NoRoutes.to_string(), "462 no routes");
        assert_eq!(
            PaymentOutcome::Ok(TransactionId::from_u128(0xff)).to_string(),
            "200 ok ff"
        );
    }

    #[test]
    fn result_helpers() {
        assert!(TransactionResult::done().is_done());
        assert!(TransactionResult::outcome(PaymentOutcome::NoConsensus).is_done());
        assert!(!TransactionResult::AwakeAfter(Duration::from_secs(1)).is_done());
        assert_eq!(
            Resource::Paths(Vec::new()).resource_type(),
            ResourceType::Paths
        );
    }
}
