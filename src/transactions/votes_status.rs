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

//! Answers ballot status queries from participants in recovery.

use crate::ballot::ParticipantsVotes;
use crate::base::NodeId;
use crate::codec;
use crate::error::StorageError;
use crate::messages::{Message, MessageBody};
use crate::storage::PaymentStorage;
use tracing::{debug, warn};

/// Builds the reply to a `VotesStatusRequest`.
///
/// A payment still running here answers with an undecided ballot, a
/// finished one with the ballot stored when it was decided. Without any
/// record the node answers with a rejection, so the requester rolls back.
pub fn respond(
    node: NodeId,
    storage: &dyn PaymentStorage,
    in_process: bool,
    request: &Message,
) -> Message {
    let ballot = if in_process {
        ParticipantsVotes::undecided()
    } else {
        stored_ballot(node, storage, request)
    };
    debug!(
        transaction = %request.transaction_id,
        requester = %request.sender,
        undecided = ballot.is_undecided(),
        "votes status answered"
    );
    Message::new(
        node,
        request.transaction_id,
        MessageBody::ParticipantsVotes(ballot),
    )
}

fn stored_ballot(node: NodeId, storage: &dyn PaymentStorage, request: &Message) -> ParticipantsVotes {
    match storage.load_ballot_state(&request.transaction_id) {
        Ok(bytes) => match codec::decode_ballot(&bytes) {
            Ok(ballot) => ballot,
            Err(error) => {
                warn!(transaction = %request.transaction_id, %error, "stored ballot is corrupted");
                ParticipantsVotes::rejection(node, request.sender)
            }
        },
        Err(StorageError::NotFound) => ParticipantsVotes::rejection(node, request.sender),
        Err(error) => {
            warn!(transaction = %request.transaction_id, %error, "can't load ballot");
            ParticipantsVotes::rejection(node, request.sender)
        }
    }
}
