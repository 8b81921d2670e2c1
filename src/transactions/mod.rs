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

//! Payment transactions of the three roles and the sum type the scheduler drives.

mod base;
mod coordinator;
mod intermediate;
mod receiver;
pub mod votes_status;

pub use base::{Stage, TransactionContext, TransactionKind};
pub use coordinator::CoordinatorPaymentTransaction;
pub use intermediate::IntermediateNodePaymentTransaction;
pub use receiver::ReceiverPaymentTransaction;

use crate::base::TransactionId;
use crate::messages::Message;
use crate::result::{Resource, TransactionResult};
use base::BasePaymentTransaction;
use tracing::info;

/// A payment transaction in any role.
#[derive(Debug)]
pub enum PaymentTransaction {
    Coordinator(Box<CoordinatorPaymentTransaction>),
    Receiver(Box<ReceiverPaymentTransaction>),
    Intermediate(Box<IntermediateNodePaymentTransaction>),
}

impl PaymentTransaction {
    fn base(&self) -> &BasePaymentTransaction {
        match self {
            PaymentTransaction::Coordinator(tx) => tx.base(),
            PaymentTransaction::Receiver(tx) => tx.base(),
            PaymentTransaction::Intermediate(tx) => tx.base(),
        }
    }

    fn base_mut(&mut self) -> &mut BasePaymentTransaction {
        match self {
            PaymentTransaction::Coordinator(tx) => tx.base_mut(),
            PaymentTransaction::Receiver(tx) => tx.base_mut(),
            PaymentTransaction::Intermediate(tx) => tx.base_mut(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.base().id
    }

    pub fn kind(&self) -> TransactionKind {
        self.base().kind
    }

    pub fn stage(&self) -> Stage {
        self.base().stage
    }

    /// Advances the state machine with whatever is in the inbox.
    pub fn run(&mut self) -> TransactionResult {
        match self {
            PaymentTransaction::Coordinator(tx) => tx.run(),
            PaymentTransaction::Receiver(tx) => tx.run(),
            PaymentTransaction::Intermediate(tx) => tx.run(),
        }
    }

    pub fn push_message(&mut self, message: Message) {
        self.base_mut().push_message(message);
    }

    pub fn push_resource(&mut self, resource: Resource) {
        self.base_mut().push_resource(resource);
    }

    /// Stops the transaction, releasing everything it reserved.
    pub fn kill(&mut self) {
        let base = self.base_mut();
        info!(transaction = %base.id, role = %base.kind, "transaction killed");
        base.rollback();
        base.ctx.path_finder.release(&base.id);
    }
}

impl From<CoordinatorPaymentTransaction> for PaymentTransaction {
    fn from(tx: CoordinatorPaymentTransaction) -> Self {
        PaymentTransaction::Coordinator(Box::new(tx))
    }
}

impl From<ReceiverPaymentTransaction> for PaymentTransaction {
    fn from(tx: ReceiverPaymentTransaction) -> Self {
        PaymentTransaction::Receiver(Box::new(tx))
    }
}

impl From<IntermediateNodePaymentTransaction> for PaymentTransaction {
    fn from(tx: IntermediateNodePaymentTransaction) -> Self {
        PaymentTransaction::Intermediate(Box::new(tx))
    }
}
