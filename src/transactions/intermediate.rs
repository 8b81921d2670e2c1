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

//! Intermediate node side of a payment.
//!
//! An intermediate node reserves incoming amount from its upstream
//! neighbor, and when the coordinator asks, reserves outgoing amount
//! toward the next node and relays that node's answer. It may appear on
//! several paths of the same payment.

use crate::base::{NodeId, PathId, TransactionId, TrustLineAmount};
use crate::error::PaymentError;
use crate::messages::{Message, MessageBody, MessageType, ReservationState};
use crate::reservations::ReservationDirection;
use crate::result::TransactionResult;
use crate::transactions::base::{BasePaymentTransaction, Stage, TransactionContext, TransactionKind};
use num_traits::Zero;
use std::cmp::min;
use tracing::{debug, warn};

const IDLE_TYPES: [MessageType; 6] = [
    MessageType::IntermediateNodeReservationRequest,
    MessageType::CoordinatorReservationRequest,
    MessageType::FinalPathConfiguration,
    MessageType::FinalAmountsConfiguration,
    MessageType::ReservationsInRelationToNode,
    MessageType::TtlProlongationResponse,
];

/// Outgoing reservation request waiting for the next node's answer.
#[derive(Debug, Clone, Copy)]
struct Forwarding {
    path_id: PathId,
    next_node: NodeId,
}

#[derive(Debug)]
pub struct IntermediateNodePaymentTransaction {
    base: BasePaymentTransaction,
    forwarding: Option<Forwarding>,
}

impl IntermediateNodePaymentTransaction {
    /// Creates the transaction from the first reservation request of the payment.
    ///
    /// # Errors
    ///
    /// [`PaymentError::UnexpectedMessage`] if `message` is not an
    /// `IntermediateNodeReservationRequest`.
    pub fn new(ctx: TransactionContext, message: Message) -> Result<Self, PaymentError> {
        if message.message_type() != MessageType::IntermediateNodeReservationRequest {
            return Err(PaymentError::UnexpectedMessage(message.message_type()));
        }
        let mut base = BasePaymentTransaction::new(
            ctx,
            message.transaction_id,
            TransactionKind::Intermediate,
            Stage::AmountReservationsProcessing,
        );
        base.push_message(message);
        Ok(Self {
            base,
            forwarding: None,
        })
    }

    pub fn id(&self) -> TransactionId {
        self.base.id
    }

    pub(crate) fn base(&self) -> &BasePaymentTransaction {
        &self.base
    }

    pub(crate) fn base_mut(&mut self) -> &mut BasePaymentTransaction {
        &mut self.base
    }

    pub fn run(&mut self) -> TransactionResult {
        debug!(
            transaction = %self.base.id,
            node = %self.base.node(),
            stage = ?self.base.stage,
            "intermediate run"
        );
        let result = match self.base.stage {
            Stage::AmountReservationsProcessing | Stage::ClarificationBeforeVoting => {
                self.run_amount_reservation_stage()
            }
            _ => self.base.run_participant_stage(),
        };
        result.unwrap_or_else(|error| {
            warn!(transaction = %self.base.id, %error, "intermediate node failed");
            if self.base.is_voted() {
                self.base.start_recovery()
            } else {
                self.base.reject("unexpected error")
            }
        })
    }

    fn wait_idle(&self) -> TransactionResult {
        TransactionResult::wait_for_messages(
            &IDLE_TYPES,
            self.base.config().receiver_reservation_window(),
        )
    }

    fn run_amount_reservation_stage(&mut self) -> Result<TransactionResult, PaymentError> {
        if let Some(forwarding) = self.forwarding.take() {
            return self.process_next_node_response(forwarding);
        }
        let Some(message) = self.base.take_message() else {
            return Ok(self
                .base
                .on_silence(Stage::ClarificationBeforeVoting, &IDLE_TYPES));
        };
        let sender = message.sender;
        match message.body {
            MessageBody::IntermediateNodeReservationRequest { reservations } => {
                self.process_reservation_request(sender, reservations)
            }
            MessageBody::CoordinatorReservationRequest {
                reservations,
                next_node,
            } => self.process_coordinator_request(sender, reservations, next_node),
            MessageBody::FinalPathConfiguration { path_id, amount } => {
                self.process_final_path_configuration(sender, path_id, amount)
            }
            MessageBody::FinalAmountsConfiguration { amounts } => {
                self.base.process_final_amounts_configuration(sender, amounts)
            }
            MessageBody::ReservationsInRelationToNode { reservations } => {
                self.base.store_remote_reservations(sender, reservations);
                Ok(TransactionResult::ContinuePreviousState)
            }
            MessageBody::TtlProlongationResponse { state } => {
                let wait = self.wait_idle();
                Ok(self
                    .base
                    .on_ttl_response(state, Stage::AmountReservationsProcessing, wait))
            }
            other => Err(PaymentError::UnexpectedMessage(other.message_type())),
        }
    }

    fn respond_upstream(&self, to: NodeId, path_id: PathId, state: ReservationState, amount: TrustLineAmount) {
        self.base.send(
            to,
            MessageBody::IntermediateNodeReservationResponse {
                path_id,
                state,
                amount,
            },
        );
    }

    fn respond_coordinator(&self, path_id: PathId, state: ReservationState, amount: TrustLineAmount) -> Result<(), PaymentError> {
        let coordinator = self.base.coordinator()?;
        self.base.send(
            coordinator,
            MessageBody::CoordinatorReservationResponse {
                path_id,
                state,
                amount,
            },
        );
        Ok(())
    }

    /// Incoming side: same accept, clamp and desync rules as the receiver.
    fn process_reservation_request(
        &mut self,
        sender: NodeId,
        reservations: Vec<(PathId, TrustLineAmount)>,
    ) -> Result<TransactionResult, PaymentError> {
        self.base.stage = Stage::AmountReservationsProcessing;
        let Some(((path_id, requested), rest)) = reservations.split_first() else {
            self.respond_upstream(sender, PathId(0), ReservationState::Closed, TrustLineAmount::zero());
            return Ok(self.wait_idle());
        };
        let path_id = *path_id;

        if let Err(error) = self.base.ctx.trust_lines.ensure_neighbor(&sender) {
            warn!(transaction = %self.base.id, %error, "reservation request refused");
            self.respond_upstream(sender, path_id, ReservationState::Rejected, TrustLineAmount::zero());
            return Ok(self.wait_idle());
        }

        if let Err(error) = self.base.update_reservations(rest, Some(path_id)) {
            warn!(transaction = %self.base.id, path = %path_id, %error, "reservations desynchronized");
            self.base.should_reject = true;
            self.respond_upstream(sender, path_id, ReservationState::Closed, TrustLineAmount::zero());
            return Ok(self.wait_idle());
        }

        let available = self.base.ctx.trust_lines.available_incoming(&sender);
        if available.is_zero() {
            self.respond_upstream(sender, path_id, ReservationState::Rejected, TrustLineAmount::zero());
            return Ok(self.wait_idle());
        }
        let amount = min(requested.clone(), available);
        match self
            .base
            .reserve(sender, path_id, amount, ReservationDirection::Incoming)
        {
            Ok(reservation) => {
                self.respond_upstream(sender, path_id, ReservationState::Accepted, reservation.amount);
            }
            Err(error) => {
                debug!(transaction = %self.base.id, path = %path_id, %error, "can't reserve");
                self.respond_upstream(sender, path_id, ReservationState::Rejected, TrustLineAmount::zero());
            }
        }
        Ok(self.wait_idle())
    }

    /// Outgoing side: reserve toward `next_node` and forward the request.
    fn process_coordinator_request(
        &mut self,
        sender: NodeId,
        reservations: Vec<(PathId, TrustLineAmount)>,
        next_node: NodeId,
    ) -> Result<TransactionResult, PaymentError> {
        let coordinator = *self.base.coordinator.get_or_insert(sender);
        if sender != coordinator {
            warn!(transaction = %self.base.id, %sender, "coordinator request from a different node");
            return Ok(TransactionResult::ContinuePreviousState);
        }
        let Some(((path_id, max_flow), rest)) = reservations.split_first() else {
            self.respond_coordinator(PathId(0), ReservationState::Closed, TrustLineAmount::zero())?;
            return Ok(self.wait_idle());
        };
        let path_id = *path_id;

        let Some(incoming) = self
            .base
            .path_reservation(path_id, ReservationDirection::Incoming)
            .cloned()
        else {
            debug!(transaction = %self.base.id, path = %path_id, "no incoming reservation for path");
            self.respond_coordinator(path_id, ReservationState::Rejected, TrustLineAmount::zero())?;
            return Ok(self.wait_idle());
        };

        let mut amount = incoming.amount.clone();
        if *max_flow < amount {
            if max_flow.is_zero() {
                self.reject_path(path_id)?;
                return Ok(self.wait_idle());
            }
            self.base.shorten_reservation(
                &incoming.counterparty,
                path_id,
                ReservationDirection::Incoming,
                max_flow.clone(),
            )?;
            amount = max_flow.clone();
        }

        if next_node == incoming.counterparty || !self.base.ctx.trust_lines.is_neighbor(&next_node) {
            warn!(transaction = %self.base.id, next = %next_node, "next node is not a neighbor");
            self.reject_path(path_id)?;
            return Ok(self.wait_idle());
        }

        let available = self.base.ctx.trust_lines.available_outgoing(&next_node);
        let outgoing = min(amount, available);
        if outgoing.is_zero() {
            self.reject_path(path_id)?;
            return Ok(self.wait_idle());
        }
        if let Err(error) = self.base.reserve(
            next_node,
            path_id,
            outgoing.clone(),
            ReservationDirection::Outgoing,
        ) {
            debug!(transaction = %self.base.id, path = %path_id, %error, "can't reserve toward next node");
            self.reject_path(path_id)?;
            return Ok(self.wait_idle());
        }

        let mut forwarded = vec![(path_id, outgoing)];
        forwarded.extend(rest.iter().cloned());
        self.base.send(
            next_node,
            MessageBody::IntermediateNodeReservationRequest {
                reservations: forwarded,
            },
        );
        self.forwarding = Some(Forwarding { path_id, next_node });
        Ok(TransactionResult::wait_for_messages(
            &[MessageType::IntermediateNodeReservationResponse],
            self.base.max_network_delay(2),
        ))
    }

    fn reject_path(&mut self, path_id: PathId) -> Result<(), PaymentError> {
        self.base.drop_path(path_id);
        self.respond_coordinator(path_id, ReservationState::Rejected, TrustLineAmount::zero())
    }

    fn process_next_node_response(&mut self, forwarding: Forwarding) -> Result<TransactionResult, PaymentError> {
        let path_id = forwarding.path_id;
        let Some(message) = self.base.take_message() else {
            debug!(transaction = %self.base.id, next = %forwarding.next_node, "next node is silent");
            self.base.drop_path(path_id);
            self.respond_coordinator(
                path_id,
                ReservationState::NextNodeInaccessible,
                TrustLineAmount::zero(),
            )?;
            return Ok(self.wait_idle());
        };

        let (state, amount) = match message.body {
            MessageBody::IntermediateNodeReservationResponse {
                path_id: response_path,
                state,
                amount,
            } if response_path == path_id && message.sender == forwarding.next_node => (state, amount),
            _ => {
                self.forwarding = Some(forwarding);
                return Ok(TransactionResult::ContinuePreviousState);
            }
        };

        match state {
            ReservationState::Accepted if !amount.is_zero() => {
                if self.shorten_path(path_id, &amount).is_err() {
                    self.base.drop_path(path_id);
                    self.respond_coordinator(path_id, ReservationState::Closed, TrustLineAmount::zero())?;
                } else {
                    self.respond_coordinator(path_id, ReservationState::Accepted, amount)?;
                }
            }
            ReservationState::Closed => {
                self.base.drop_path(path_id);
                self.respond_coordinator(path_id, ReservationState::Closed, TrustLineAmount::zero())?;
            }
            _ => self.reject_path(path_id)?,
        }
        Ok(self.wait_idle())
    }

    /// Shrinks both sides of `path_id` to `amount`.
    fn shorten_path(&mut self, path_id: PathId, amount: &TrustLineAmount) -> Result<(), PaymentError> {
        for direction in [ReservationDirection::Incoming, ReservationDirection::Outgoing] {
            let Some(reservation) = self.base.path_reservation(path_id, direction).cloned() else {
                return Err(PaymentError::ReservationNotFound);
            };
            if *amount > reservation.amount {
                return Err(PaymentError::ReservationIncrease);
            }
            self.base
                .shorten_reservation(&reservation.counterparty, path_id, direction, amount.clone())?;
        }
        Ok(())
    }

    fn process_final_path_configuration(
        &mut self,
        sender: NodeId,
        path_id: PathId,
        amount: TrustLineAmount,
    ) -> Result<TransactionResult, PaymentError> {
        if *self.base.coordinator.get_or_insert(sender) != sender {
            debug!(transaction = %self.base.id, %sender, "path configuration from a non-coordinator");
            return Ok(TransactionResult::ContinuePreviousState);
        }
        if amount.is_zero() {
            let dropped = self.base.drop_path(path_id);
            debug!(transaction = %self.base.id, path = %path_id, dropped, "path dropped by coordinator");
        } else if let Err(error) = self.shorten_path(path_id, &amount) {
            warn!(transaction = %self.base.id, path = %path_id, %error, "final path amount doesn't match");
            self.base.should_reject = true;
        }
        Ok(self.wait_idle())
    }
}
