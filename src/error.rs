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

//! Error types for reservation bookkeeping, wire decoding and storage.
//!
//! None of these reach the caller of a payment command directly: the
//! transactions translate them into a [`PaymentOutcome`](crate::PaymentOutcome).

use crate::base::{NodeId, PathId, TransactionId};
use crate::messages::MessageType;
use thiserror::Error;

/// Reservation, path and protocol errors raised inside a payment transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    /// Amount is zero where a positive amount is required
    #[error("invalid amount (must be positive)")]
    InvalidAmount,

    /// Requested amount exceeds what the trust line can still supply
    #[error("insufficient amount available on trust line")]
    InsufficientAmount,

    /// No trust line exists with the counterparty
    #[error("trust line with {0} is absent")]
    TrustLineAbsent(NodeId),

    /// The referenced reservation is not held on the trust line
    #[error("reservation not found")]
    ReservationNotFound,

    /// A reservation for the same path and direction is already held
    #[error("reservation for path {0} already exists")]
    DuplicateReservation(PathId),

    /// Reservations may only shrink
    #[error("reservation can't be increased")]
    ReservationIncrease,

    /// Path contains a repeated node or is too short
    #[error("invalid path")]
    InvalidPath,

    /// Path index or path id is unknown to the transaction
    #[error("path {0} not found")]
    PathNotFound(PathId),

    /// Every intermediate node of the path has already been processed
    #[error("no unprocessed nodes left on path")]
    PathExhausted,

    /// No candidate paths remain
    #[error("no paths are available")]
    NoPathsAvailable,

    /// The sender of a message is not a trust line neighbor
    #[error("node {0} is not a neighbor")]
    NotNeighbor(NodeId),

    /// Message type has no handler in the transaction's current stage
    #[error("unexpected message {0}")]
    UnexpectedMessage(MessageType),

    /// Stage does not belong to the transaction's role
    #[error("invalid stage for this transaction")]
    InvalidStage,

    /// A transaction with the same id is already running on this node
    #[error("transaction {0} is already scheduled")]
    DuplicateTransaction(TransactionId),

    /// Node is not listed in the ballot
    #[error("participant {0} not found in ballot")]
    ParticipantNotFound(NodeId),

    /// Internal invariant broken
    #[error("invariant violated: {0}")]
    InvariantViolation(&'static str),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors raised while decoding a message from its wire form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer ended before the expected field
    #[error("unexpected end of buffer")]
    UnexpectedEof,

    /// Discriminator is not a known message type
    #[error("unknown message type {0}")]
    UnknownMessageType(u16),

    /// Field value is out of its valid range
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),

    /// Bytes left over after the message was decoded
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// Payload doesn't match the shape of its message type
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl From<bincode::Error> for CodecError {
    fn from(error: bincode::Error) -> Self {
        match *error {
            bincode::ErrorKind::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                CodecError::UnexpectedEof
            }
            other => CodecError::Malformed(other.to_string()),
        }
    }
}

/// Errors raised by payment storage backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No record for the requested key
    #[error("record not found")]
    NotFound,

    /// Storage transaction was already committed or rolled back
    #[error("storage transaction is closed")]
    Closed,
}
