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

//! # TrustNet Payments
//!
//! Multi-hop payments over a network of bilateral trust lines. A payment
//! reserves amounts hop by hop along one or more paths, agrees on the final
//! per-path amounts with every participant, collects a unanimous ballot and
//! only then turns the reservations into balance changes.
//!
//! ## Core Components
//!
//! - [`PaymentsManager`]: per-node entry point for payment commands and inbound messages
//! - [`TransactionsScheduler`]: drives transactions by the [`TransactionResult`] they return
//! - [`TrustLines`]: the node's ledger, owning every amount reservation
//! - [`PathFinder`]: candidate path discovery, with [`GraphPathFinder`] as an in-memory graph
//! - [`PaymentStorage`]: transactional payment history and ballot persistence
//! - [`ParticipantsVotes`]: the ballot every participant signs before commit
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use trustnet_payments::{
//!     GraphPathFinder, MemoryStorage, NodeId, PaymentConfig, PaymentOutcome, PaymentsManager,
//!     TrustLineAmount, TrustLines,
//! };
//!
//! let alice = NodeId::from_u128(1);
//! let bob = NodeId::from_u128(2);
//! let trust_lines = TrustLines::new(alice);
//! trust_lines.open(bob, TrustLineAmount::from(0u32), TrustLineAmount::from(100u32));
//!
//! let manager = PaymentsManager::new(
//!     Arc::new(trust_lines),
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(GraphPathFinder::new(5)),
//!     PaymentConfig::new().with_payments_enabled(false),
//! );
//! let id = manager.launch_payment(bob, TrustLineAmount::from(10u32)).unwrap();
//! assert_eq!(manager.outcome(&id), Some(PaymentOutcome::ForbiddenRunTransaction));
//! ```
//!
//! ## Thread Safety
//!
//! Trust lines serialize reservations per counterparty, so payments running
//! concurrently on one node never oversubscribe a line. The library never
//! blocks on the network: transactions express waits as directives and the
//! owner of the [`PaymentsManager`] supplies time through `tick`.

pub mod ballot;
mod base;
pub mod codec;
pub mod config;
pub mod error;
pub mod manager;
pub mod messages;
pub mod path;
pub mod path_finder;
pub mod reservations;
pub mod result;
pub mod scheduler;
pub mod storage;
pub mod transactions;
pub mod trust_lines;

pub use ballot::{ParticipantsVotes, Vote};
pub use base::{NodeId, ParseIdError, PathId, TransactionId, TrustLineAmount};
pub use config::PaymentConfig;
pub use error::{CodecError, PaymentError, StorageError};
pub use manager::PaymentsManager;
pub use messages::{Message, MessageBody, MessageType, PathAmounts, ReservationState, TtlState, Verdict};
pub use path::{NodeState, Path, PathStats};
pub use path_finder::{GraphPathFinder, PathFinder};
pub use reservations::{AmountReservation, ReservationClaim, ReservationDirection};
pub use result::{
    PaymentOutcome, Resource, ResourceType, SubsidiaryTransactionRequest, TransactionEvent,
    TransactionResult,
};
pub use scheduler::{Attachment, FinishedTransaction, TransactionsScheduler};
pub use storage::{MemoryStorage, PaymentKind, PaymentRecord, PaymentStorage, StorageTransaction};
pub use transactions::{PaymentTransaction, Stage, TransactionContext, TransactionKind};
pub use trust_lines::{TrustLine, TrustLines};
