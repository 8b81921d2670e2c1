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

//! Receiver side of a payment.
//!
//! The receiver accepts or refuses the coordinator's init request, then
//! collects one incoming reservation per path until their sum equals the
//! payment amount. From there it follows the shared confirmation and
//! voting stages.

use crate::base::{NodeId, PathId, TransactionId, TrustLineAmount};
use crate::error::PaymentError;
use crate::messages::{Message, MessageBody, MessageType, ReservationState, Verdict};
use crate::reservations::ReservationDirection;
use crate::result::TransactionResult;
use crate::storage::PaymentKind;
use crate::transactions::base::{BasePaymentTransaction, Stage, TransactionContext, TransactionKind};
use num_traits::Zero;
use std::cmp::min;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct ReceiverPaymentTransaction {
    base: BasePaymentTransaction,
    amount: TrustLineAmount,
}

impl ReceiverPaymentTransaction {
    /// Creates the transaction from the coordinator's init request.
    ///
    /// # Errors
    ///
    /// [`PaymentError::UnexpectedMessage`] if `message` is not a
    /// `ReceiverInitPaymentRequest`.
    pub fn new(ctx: TransactionContext, message: Message) -> Result<Self, PaymentError> {
        let MessageBody::ReceiverInitPaymentRequest { amount, .. } = &message.body else {
            return Err(PaymentError::UnexpectedMessage(message.message_type()));
        };
        let amount = amount.clone();
        let mut base = BasePaymentTransaction::new(
            ctx,
            message.transaction_id,
            TransactionKind::Receiver,
            Stage::CoordinatorRequestApproving,
        );
        base.coordinator = Some(message.sender);
        base.history_entry = Some((PaymentKind::Incoming, message.sender));
        base.push_message(message);
        Ok(Self { base, amount })
    }

    pub fn id(&self) -> TransactionId {
        self.base.id
    }

    pub fn amount(&self) -> &TrustLineAmount {
        &self.amount
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
            "receiver run"
        );
        let result = match self.base.stage {
            Stage::CoordinatorRequestApproving => self.run_coordinator_request_processing_stage(),
            Stage::AmountReservationsProcessing | Stage::ClarificationBeforeVoting => {
                self.run_amount_reservation_stage()
            }
            Stage::FinalAmountsConfigurationConfirmation | Stage::ClarificationDuringFinalAmounts
                if self.base.peek_message_type()
                    == Some(MessageType::IntermediateNodeReservationRequest) =>
            {
                self.run_amount_reservation_stage()
            }
            _ => self.base.run_participant_stage(),
        };
        result.unwrap_or_else(|error| {
            warn!(transaction = %self.base.id, %error, "receiver failed");
            if self.base.is_voted() {
                self.base.start_recovery()
            } else {
                self.base.reject("unexpected error")
            }
        })
    }

    fn wait_for_reservations(&self) -> TransactionResult {
        TransactionResult::wait_for_messages(
            &[
                MessageType::IntermediateNodeReservationRequest,
                MessageType::TtlProlongationResponse,
            ],
            self.base.config().receiver_reservation_window(),
        )
    }

    fn run_coordinator_request_processing_stage(&mut self) -> Result<TransactionResult, PaymentError> {
        let message = self
            .base
            .take_message()
            .ok_or(PaymentError::InvariantViolation("init request is missing"))?;
        let MessageBody::ReceiverInitPaymentRequest { path_id, .. } = message.body else {
            return Err(PaymentError::UnexpectedMessage(message.message_type()));
        };
        let coordinator = message.sender;

        let available = self.base.ctx.trust_lines.total_available_incoming();
        if available < self.amount {
            info!(
                transaction = %self.base.id,
                amount = %self.amount,
                available = %available,
                "not enough incoming capacity"
            );
            self.base.send(
                coordinator,
                MessageBody::ReceiverInitPaymentResponse {
                    path_id,
                    verdict: Verdict::Rejected,
                },
            );
            return Ok(TransactionResult::done());
        }

        self.base.send(
            coordinator,
            MessageBody::ReceiverInitPaymentResponse {
                path_id,
                verdict: Verdict::Accepted,
            },
        );
        self.base.stage = Stage::AmountReservationsProcessing;
        Ok(self.wait_for_reservations())
    }

    fn run_amount_reservation_stage(&mut self) -> Result<TransactionResult, PaymentError> {
        let Some(message) = self.base.take_message() else {
            return Ok(self.base.on_silence(
                Stage::ClarificationBeforeVoting,
                &[MessageType::IntermediateNodeReservationRequest],
            ));
        };
        let sender = message.sender;
        match message.body {
            MessageBody::IntermediateNodeReservationRequest { reservations } => {
                self.process_reservation_request(sender, reservations)
            }
            MessageBody::TtlProlongationResponse { state } => {
                let wait = self.wait_for_reservations();
                Ok(self
                    .base
                    .on_ttl_response(state, Stage::AmountReservationsProcessing, wait))
            }
            other => Err(PaymentError::UnexpectedMessage(other.message_type())),
        }
    }

    fn respond(&self, to: NodeId, path_id: PathId, state: ReservationState, amount: TrustLineAmount) {
        self.base.send(
            to,
            MessageBody::IntermediateNodeReservationResponse {
                path_id,
                state,
                amount,
            },
        );
    }

    fn process_reservation_request(
        &mut self,
        sender: NodeId,
        reservations: Vec<(PathId, TrustLineAmount)>,
    ) -> Result<TransactionResult, PaymentError> {
        self.base.stage = Stage::AmountReservationsProcessing;
        let Some(((path_id, requested), rest)) = reservations.split_first() else {
            self.respond(sender, PathId(0), ReservationState::Closed, TrustLineAmount::zero());
            return Ok(self.wait_for_reservations());
        };
        let path_id = *path_id;

        if let Err(error) = self.base.ctx.trust_lines.ensure_neighbor(&sender) {
            warn!(transaction = %self.base.id, %error, "reservation request refused");
            self.respond(sender, path_id, ReservationState::Rejected, TrustLineAmount::zero());
            return Ok(self.wait_for_reservations());
        }

        if let Err(error) = self.base.update_reservations(rest, Some(path_id)) {
            warn!(transaction = %self.base.id, path = %path_id, %error, "reservations desynchronized");
            self.base.should_reject = true;
            self.respond(sender, path_id, ReservationState::Closed, TrustLineAmount::zero());
            return Ok(self.wait_for_reservations());
        }

        let available = self.base.ctx.trust_lines.available_incoming(&sender);
        if available.is_zero() {
            self.respond(sender, path_id, ReservationState::Rejected, TrustLineAmount::zero());
            return Ok(self.wait_for_reservations());
        }
        let amount = min(requested.clone(), available);
        let reservation = match self.base.reserve(
            sender,
            path_id,
            amount,
            ReservationDirection::Incoming,
        ) {
            Ok(reservation) => reservation,
            Err(error) => {
                debug!(transaction = %self.base.id, path = %path_id, %error, "can't reserve");
                self.respond(sender, path_id, ReservationState::Rejected, TrustLineAmount::zero());
                return Ok(self.wait_for_reservations());
            }
        };

        let total = self.base.total_reserved(ReservationDirection::Incoming);
        if total > self.amount {
            warn!(
                transaction = %self.base.id,
                total = %total,
                amount = %self.amount,
                "reserved more than the payment amount"
            );
            self.base.should_reject = true;
            self.respond(sender, path_id, ReservationState::Closed, TrustLineAmount::zero());
            return Ok(self.wait_for_reservations());
        }

        self.respond(sender, path_id, ReservationState::Accepted, reservation.amount);
        if total == self.amount {
            debug!(transaction = %self.base.id, "all incoming amount reserved");
            self.base.stage = Stage::FinalAmountsConfigurationConfirmation;
            return Ok(self.base.wait_for_final_amounts());
        }
        Ok(self.wait_for_reservations())
    }
}
