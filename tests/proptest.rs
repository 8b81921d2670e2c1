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

//! Property-based tests for reservations, ballots and the wire codec.
//!
//! These tests verify invariants that should hold for any sequence of
//! reservation operations and any well-formed message.

use num_bigint::{BigInt, BigUint};
use proptest::prelude::*;
use trustnet_payments::{
    Message, MessageBody, NodeId, ParticipantsVotes, PathId, ReservationClaim, ReservationDirection,
    ReservationState, TransactionId, TrustLineAmount, TrustLines, TtlState, Vote, codec,
};

// =============================================================================
// Arbitrary Strategies
// =============================================================================

fn arb_node() -> impl Strategy<Value = NodeId> {
    (1u128..=u128::MAX).prop_map(NodeId::from_u128)
}

fn arb_transaction_id() -> impl Strategy<Value = TransactionId> {
    any::<u128>().prop_map(TransactionId::from_u128)
}

/// Small positive amount, so that random operations often collide with limits.
fn arb_amount() -> impl Strategy<Value = TrustLineAmount> {
    (1u32..=200).prop_map(TrustLineAmount::from)
}

/// Amount of any magnitude, up to a few hundred bits.
fn arb_big_amount() -> impl Strategy<Value = TrustLineAmount> {
    prop::collection::vec(any::<u32>(), 0..8).prop_map(BigUint::new)
}

fn arb_direction() -> impl Strategy<Value = ReservationDirection> {
    prop_oneof![
        Just(ReservationDirection::Incoming),
        Just(ReservationDirection::Outgoing),
    ]
}

fn arb_path_amounts() -> impl Strategy<Value = Vec<(PathId, TrustLineAmount)>> {
    prop::collection::vec((any::<u16>().prop_map(PathId), arb_big_amount()), 0..6)
}

#[derive(Debug, Clone)]
enum Op {
    Reserve {
        path: u16,
        amount: TrustLineAmount,
        direction: ReservationDirection,
    },
    Shrink {
        index: usize,
        amount: TrustLineAmount,
    },
    Free {
        index: usize,
    },
    Commit {
        index: usize,
    },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u16..4, arb_amount(), arb_direction())
            .prop_map(|(path, amount, direction)| Op::Reserve { path, amount, direction }),
        1 => (any::<usize>(), arb_amount()).prop_map(|(index, amount)| Op::Shrink { index, amount }),
        1 => any::<usize>().prop_map(|index| Op::Free { index }),
        1 => any::<usize>().prop_map(|index| Op::Commit { index }),
    ]
}

/// Coordinator plus distinct participants, the coordinator excluded.
fn arb_ballot_nodes() -> impl Strategy<Value = (NodeId, Vec<NodeId>)> {
    (arb_node(), prop::collection::btree_set(arb_node(), 1..8)).prop_map(|(coordinator, set)| {
        let participants = set.into_iter().filter(|n| *n != coordinator).collect();
        (coordinator, participants)
    })
}

fn arb_vote() -> impl Strategy<Value = Vote> {
    prop_oneof![Just(Vote::Approved), Just(Vote::Rejected), Just(Vote::Uncertain)]
}

fn arb_ballot() -> impl Strategy<Value = ParticipantsVotes> {
    (arb_ballot_nodes(), prop::collection::vec(arb_vote(), 8)).prop_map(
        |((coordinator, participants), votes)| {
            let mut ballot = ParticipantsVotes::new(coordinator);
            for (participant, vote) in participants.iter().zip(votes) {
                ballot.add_participant(*participant);
                let _ = match vote {
                    Vote::Approved => ballot.approve(participant),
                    Vote::Rejected => ballot.reject(participant),
                    Vote::Uncertain => Ok(()),
                };
            }
            ballot
        },
    )
}

fn arb_body() -> impl Strategy<Value = MessageBody> {
    prop_oneof![
        (any::<u16>(), arb_big_amount()).prop_map(|(path, amount)| {
            MessageBody::ReceiverInitPaymentRequest { path_id: PathId(path), amount }
        }),
        arb_path_amounts()
            .prop_map(|reservations| MessageBody::IntermediateNodeReservationRequest { reservations }),
        (arb_path_amounts(), arb_node()).prop_map(|(reservations, next_node)| {
            MessageBody::CoordinatorReservationRequest { reservations, next_node }
        }),
        (any::<u16>(), arb_big_amount()).prop_map(|(path, amount)| {
            MessageBody::CoordinatorReservationResponse {
                path_id: PathId(path),
                state: ReservationState::Accepted,
                amount,
            }
        }),
        arb_path_amounts().prop_map(|amounts| MessageBody::FinalAmountsConfiguration { amounts }),
        arb_ballot().prop_map(MessageBody::ParticipantsVotes),
        prop::collection::vec((any::<u16>(), arb_big_amount(), arb_direction()), 0..4).prop_map(
            |claims| MessageBody::ReservationsInRelationToNode {
                reservations: claims
                    .into_iter()
                    .map(|(path, amount, direction)| ReservationClaim {
                        path_id: PathId(path),
                        amount,
                        direction,
                    })
                    .collect(),
            }
        ),
        Just(MessageBody::TtlProlongationResponse { state: TtlState::Finish }),
        Just(MessageBody::VotesStatusRequest),
    ]
}

fn arb_message() -> impl Strategy<Value = Message> {
    (arb_node(), arb_transaction_id(), arb_body())
        .prop_map(|(sender, id, body)| Message::new(sender, id, body))
}

fn node(n: u128) -> NodeId {
    NodeId::from_u128(n)
}

/// Node 1 with a line to node 2: may receive 300, may pay 500.
fn make_trust_lines() -> TrustLines {
    let lines = TrustLines::new(node(1));
    lines.open(node(2), TrustLineAmount::from(300u32), TrustLineAmount::from(500u32));
    lines
}

fn signed(amount: TrustLineAmount) -> BigInt {
    BigInt::from(amount)
}

// =============================================================================
// Reservation Invariant Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Reserved plus committed amounts never exceed the limits, whatever the order of operations.
    #[test]
    fn reservations_never_exceed_limits(ops in prop::collection::vec(arb_op(), 1..40)) {
        let lines = make_trust_lines();
        let tx = TransactionId::from_u128(7);
        let mut held = Vec::new();

        for op in ops {
            match op {
                Op::Reserve { path, amount, direction } => {
                    if let Ok(reservation) = lines.reserve(&node(2), tx, PathId(path), amount, direction) {
                        held.push(reservation);
                    }
                }
                Op::Shrink { index, amount } if !held.is_empty() => {
                    let index = index % held.len();
                    let before = held[index].amount.clone();
                    match lines.update(&held[index], amount.clone()) {
                        Ok(updated) => {
                            prop_assert!(updated.amount <= before);
                            held[index] = updated;
                        }
                        Err(_) => prop_assert!(amount > before),
                    }
                }
                Op::Free { index } if !held.is_empty() => {
                    let reservation = held.swap_remove(index % held.len());
                    prop_assert!(lines.free(&reservation).is_ok());
                }
                Op::Commit { index } if !held.is_empty() => {
                    let reservation = held.swap_remove(index % held.len());
                    prop_assert!(lines.commit_reservation(&reservation).is_ok());
                }
                _ => {}
            }

            let balance = lines.balance(&node(2)).unwrap_or_default();
            let reserved_out = signed(lines.total_reserved(&node(2), ReservationDirection::Outgoing, None));
            let reserved_in = signed(lines.total_reserved(&node(2), ReservationDirection::Incoming, None));
            prop_assert!(BigInt::from(500) + &balance - reserved_out >= BigInt::from(0));
            prop_assert!(BigInt::from(300) - &balance - reserved_in >= BigInt::from(0));
        }
    }

    /// Freeing a transaction restores exactly what was available before it.
    #[test]
    fn free_transaction_restores_availability(
        ops in prop::collection::vec((0u16..8, arb_amount(), arb_direction()), 1..20),
    ) {
        let lines = make_trust_lines();
        let other = TransactionId::from_u128(1);
        lines
            .reserve(&node(2), other, PathId(0), TrustLineAmount::from(50u32), ReservationDirection::Outgoing)
            .unwrap();
        let outgoing = lines.available_outgoing(&node(2));
        let incoming = lines.available_incoming(&node(2));

        let tx = TransactionId::from_u128(2);
        for (path, amount, direction) in ops {
            let _ = lines.reserve(&node(2), tx, PathId(path), amount, direction);
        }
        lines.free_transaction(&tx);

        prop_assert_eq!(lines.available_outgoing(&node(2)), outgoing);
        prop_assert_eq!(lines.available_incoming(&node(2)), incoming);
        prop_assert_eq!(lines.get(&node(2)).unwrap().reservations_count(), 1);
    }

    /// Committing mirrored reservations moves both balances by the same amount.
    #[test]
    fn mirrored_commit_conserves_balance(amounts in prop::collection::vec(arb_amount(), 1..10)) {
        let payer = TrustLines::new(node(1));
        let payee = TrustLines::new(node(2));
        payer.open(node(2), TrustLineAmount::from(0u32), TrustLineAmount::from(1000u32));
        payee.open(node(1), TrustLineAmount::from(1000u32), TrustLineAmount::from(0u32));

        for (index, amount) in amounts.into_iter().enumerate() {
            let tx = TransactionId::from_u128(index as u128 + 1);
            let Ok(out) = payer.reserve(&node(2), tx, PathId(0), amount.clone(), ReservationDirection::Outgoing) else {
                continue;
            };
            let incoming = payee
                .reserve(&node(1), tx, PathId(0), amount, ReservationDirection::Incoming)
                .unwrap();
            payer.commit_reservation(&out).unwrap();
            payee.commit_reservation(&incoming).unwrap();
            prop_assert_eq!(payer.total_balance() + payee.total_balance(), BigInt::from(0));
        }
    }
}

// =============================================================================
// Ballot Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Consensus means every participant approved; one rejection rules it out.
    #[test]
    fn consensus_requires_all_approvals(ballot in arb_ballot()) {
        let all_approved = !ballot.is_empty()
            && ballot.votes().iter().all(|(_, vote)| *vote == Vote::Approved);
        prop_assert_eq!(ballot.achieved_consensus(), all_approved);
        if ballot.contains_reject_vote() {
            prop_assert!(!ballot.achieved_consensus());
            prop_assert!(!ballot.is_final());
        }
    }

    /// A ballot only becomes final once the coordinator signs it last.
    #[test]
    fn final_ballot_extends_the_voted_one((coordinator, participants) in arb_ballot_nodes()) {
        let mut ballot = ParticipantsVotes::new(coordinator);
        for participant in &participants {
            ballot.add_participant(*participant);
        }
        for participant in &participants {
            ballot.approve(participant).unwrap();
        }
        prop_assert!(!ballot.is_final());

        let voted = ballot.clone();
        ballot.add_participant(coordinator);
        ballot.approve(&coordinator).unwrap();
        prop_assert!(ballot.is_final());
        prop_assert!(ballot.extends(&voted));
        prop_assert!(!voted.extends(&ballot));
    }

    /// Stored ballots decode to the same votes.
    #[test]
    fn stored_ballot_is_lossless(ballot in arb_ballot()) {
        let decoded = codec::decode_ballot(&codec::encode_ballot(&ballot).unwrap()).unwrap();
        prop_assert_eq!(decoded, ballot);
    }
}

// =============================================================================
// Codec Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    #[test]
    fn message_encoding_is_lossless(message in arb_message()) {
        let decoded = codec::decode(&codec::encode(&message).unwrap()).unwrap();
        prop_assert_eq!(decoded, message);
    }

    /// Any strict prefix of a valid message is refused.
    #[test]
    fn truncated_message_is_refused(message in arb_message(), cut in any::<prop::sample::Index>()) {
        let bytes = codec::encode(&message).unwrap();
        let len = cut.index(bytes.len());
        prop_assert!(codec::decode(&bytes[..len]).is_err());
    }
}
