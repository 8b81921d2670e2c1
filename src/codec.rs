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

//! Wire encoding of [`Message`] and of stored ballots.
//!
//! ```text
//! message = type:u16 (big-endian) | bincode(Message)
//! ballot  = bincode(ParticipantsVotes)
//! ```
//!
//! The type tag lets a node refuse unknown messages before touching the
//! payload. Payloads use bincode's varint integers, so amounts of any size
//! keep their full magnitude. Decoding rejects truncated input, trailing
//! bytes, a tag that disagrees with the body and ballots that list a
//! participant twice.

use crate::ballot::ParticipantsVotes;
use crate::error::CodecError;
use crate::messages::{Message, MessageBody, MessageType};
use bincode::Options;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;

fn options() -> impl Options {
    bincode::DefaultOptions::new().allow_trailing_bytes()
}

/// Serializes a message into its wire form.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let mut buffer = message.message_type().id().to_be_bytes().to_vec();
    options().serialize_into(&mut buffer, message)?;
    Ok(buffer)
}

/// Parses a message produced by [`encode`].
pub fn decode(buffer: &[u8]) -> Result<Message, CodecError> {
    let (tag, payload) = buffer
        .split_first_chunk::<2>()
        .ok_or(CodecError::UnexpectedEof)?;
    let type_id = u16::from_be_bytes(*tag);
    let message_type =
        MessageType::from_id(type_id).ok_or(CodecError::UnknownMessageType(type_id))?;
    let message: Message = read_all(payload)?;
    if message.message_type() != message_type {
        return Err(CodecError::InvalidValue("message type"));
    }
    if let MessageBody::ParticipantsVotes(ballot) = &message.body {
        check_ballot(ballot)?;
    }
    Ok(message)
}

/// Serializes a ballot for storage.
pub fn encode_ballot(ballot: &ParticipantsVotes) -> Result<Vec<u8>, CodecError> {
    Ok(options().serialize(ballot)?)
}

pub fn decode_ballot(buffer: &[u8]) -> Result<ParticipantsVotes, CodecError> {
    let ballot = read_all(buffer)?;
    check_ballot(&ballot)?;
    Ok(ballot)
}

fn read_all<T: DeserializeOwned>(mut payload: &[u8]) -> Result<T, CodecError> {
    let value = options().deserialize_from(&mut payload)?;
    match payload.len() {
        0 => Ok(value),
        left => Err(CodecError::TrailingBytes(left)),
    }
}

fn check_ballot(ballot: &ParticipantsVotes) -> Result<(), CodecError> {
    let mut seen = BTreeSet::new();
    if ballot.participants().all(|node| seen.insert(*node)) {
        Ok(())
    } else {
        Err(CodecError::InvalidValue("duplicated participant"))
    }
}
