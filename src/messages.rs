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

//! Protocol messages exchanged by payment participants.
//!
//! Every message carries the sender and the payment's transaction id in a
//! common header; the body is a tagged variant with a stable numeric
//! discriminator (see [`MessageType`]).

use crate::ballot::ParticipantsVotes;
use crate::base::{NodeId, PathId, TransactionId, TrustLineAmount};
use crate::reservations::ReservationClaim;
use serde::{Deserialize, Serialize};
use std::fmt;

/// `(path, amount)` pairs. The first entry of a reservation request is the
/// new reservation; the rest are already finalized amounts for the recipient.
pub type PathAmounts = Vec<(PathId, TrustLineAmount)>;

/// Stable wire discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    ReceiverInitPaymentRequest = 201,
    ReceiverInitPaymentResponse = 202,
    CoordinatorReservationRequest = 203,
    CoordinatorReservationResponse = 204,
    IntermediateNodeReservationRequest = 205,
    IntermediateNodeReservationResponse = 206,
    FinalAmountsConfiguration = 211,
    FinalAmountsConfigurationResponse = 212,
    ParticipantsVotes = 213,
    VotesStatusRequest = 214,
    FinalPathConfiguration = 215,
    TtlProlongationRequest = 217,
    TtlProlongationResponse = 218,
    ReservationsInRelationToNode = 219,
}

impl MessageType {
    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn from_id(id: u16) -> Option<Self> {
        use MessageType::*;
        let message_type = match id {
            201 => ReceiverInitPaymentRequest,
            202 => ReceiverInitPaymentResponse,
            203 => CoordinatorReservationRequest,
            204 => CoordinatorReservationResponse,
            205 => IntermediateNodeReservationRequest,
            206 => IntermediateNodeReservationResponse,
            211 => FinalAmountsConfiguration,
            212 => FinalAmountsConfigurationResponse,
            213 => ParticipantsVotes,
            214 => VotesStatusRequest,
            215 => FinalPathConfiguration,
            217 => TtlProlongationRequest,
            218 => TtlProlongationResponse,
            219 => ReservationsInRelationToNode,
            _ => return None,
        };
        Some(message_type)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.id())
    }
}

/// Accept/reject answer used by the init and final-amounts handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Accepted,
    Rejected,
}

/// Answer to a reservation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationState {
    /// Reserved the amount carried in the response.
    Accepted,
    /// Nothing reserved on this hop.
    Rejected,
    /// Bookkeeping desynchronized; the whole exchange is closed.
    Closed,
    /// The node after the responder didn't answer.
    NextNodeInaccessible,
}

/// Answer to a liveness question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TtlState {
    Continue,
    Finish,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    ReceiverInitPaymentRequest {
        path_id: PathId,
        amount: TrustLineAmount,
    },
    ReceiverInitPaymentResponse {
        path_id: PathId,
        verdict: Verdict,
    },
    /// Asks an intermediate node to reserve toward `next_node`.
    CoordinatorReservationRequest {
        reservations: PathAmounts,
        next_node: NodeId,
    },
    CoordinatorReservationResponse {
        path_id: PathId,
        state: ReservationState,
        amount: TrustLineAmount,
    },
    /// Asks the recipient to reserve incoming amount from the sender.
    IntermediateNodeReservationRequest {
        reservations: PathAmounts,
    },
    IntermediateNodeReservationResponse {
        path_id: PathId,
        state: ReservationState,
        amount: TrustLineAmount,
    },
    FinalAmountsConfiguration {
        amounts: PathAmounts,
    },
    FinalAmountsConfigurationResponse {
        verdict: Verdict,
    },
    ParticipantsVotes(ParticipantsVotes),
    VotesStatusRequest,
    /// Final amount of one path; zero means the path was dropped.
    FinalPathConfiguration {
        path_id: PathId,
        amount: TrustLineAmount,
    },
    TtlProlongationRequest,
    TtlProlongationResponse {
        state: TtlState,
    },
    ReservationsInRelationToNode {
        reservations: Vec<ReservationClaim>,
    },
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::ReceiverInitPaymentRequest { .. } => MessageType::ReceiverInitPaymentRequest,
            MessageBody::ReceiverInitPaymentResponse { .. } => MessageType::ReceiverInitPaymentResponse,
            MessageBody::CoordinatorReservationRequest { .. } => {
                MessageType::CoordinatorReservationRequest
            }
            MessageBody::CoordinatorReservationResponse { .. } => {
                MessageType::CoordinatorReservationResponse
            }
            MessageBody::IntermediateNodeReservationRequest { .. } => {
                MessageType::IntermediateNodeReservationRequest
            }
            MessageBody::IntermediateNodeReservationResponse { .. } => {
                MessageType::IntermediateNodeReservationResponse
            }
            MessageBody::FinalAmountsConfiguration { .. } => MessageType::FinalAmountsConfiguration,
            MessageBody::FinalAmountsConfigurationResponse { .. } => {
                MessageType::FinalAmountsConfigurationResponse
            }
            MessageBody::ParticipantsVotes(_) => MessageType::ParticipantsVotes,
            MessageBody::VotesStatusRequest => MessageType::VotesStatusRequest,
            MessageBody::FinalPathConfiguration { .. } => MessageType::FinalPathConfiguration,
            MessageBody::TtlProlongationRequest => MessageType::TtlProlongationRequest,
            MessageBody::TtlProlongationResponse { .. } => MessageType::TtlProlongationResponse,
            MessageBody::ReservationsInRelationToNode { .. } => {
                MessageType::ReservationsInRelationToNode
            }
        }
    }
}

/// A protocol message: common header plus typed body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: NodeId,
    pub transaction_id: TransactionId,
    pub body: MessageBody,
}

impl Message {
    pub fn new(sender: NodeId, transaction_id: TransactionId, body: MessageBody) -> Self {
        Self {
            sender,
            transaction_id,
            body,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }
}
