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

//! In-process network of payment nodes for integration tests.
//!
//! Messages travel encoded, in FIFO order, and arrive instantly. Time only
//! moves when nothing is in flight: the clock then jumps to the earliest
//! deadline of any node.

#![allow(dead_code)]

use num_bigint::BigInt;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use trustnet_payments::{
    GraphPathFinder, MemoryStorage, Message, MessageType, NodeId, PaymentConfig, PaymentOutcome,
    PaymentStorage, PaymentsManager, ReservationDirection, TransactionId, TrustLineAmount,
    TrustLines, codec,
};

/// Upper bound on delivery and clock rounds before a test is declared stuck.
const MAX_ROUNDS: usize = 100_000;

pub fn node(n: u128) -> NodeId {
    NodeId::from_u128(n)
}

pub fn amount(value: u32) -> TrustLineAmount {
    TrustLineAmount::from(value)
}

pub fn balance(value: i64) -> BigInt {
    BigInt::from(value)
}

/// Returns false to drop the message.
pub type Filter = Box<dyn FnMut(NodeId, &Message) -> bool>;
/// Returns true to park the message until it is released.
pub type Hold = Box<dyn FnMut(NodeId, &Message) -> bool>;
pub type Tamper = Box<dyn FnMut(NodeId, &mut Message)>;

pub struct NetworkBuilder {
    lines: BTreeMap<(NodeId, NodeId), u32>,
    config: PaymentConfig,
    node_configs: BTreeMap<NodeId, PaymentConfig>,
    max_paths: Option<usize>,
}

impl NetworkBuilder {
    /// `payer` may pay `payee` up to `limit`.
    pub fn line(mut self, payer: u128, payee: u128, limit: u32) -> Self {
        self.lines.insert((node(payer), node(payee)), limit);
        self
    }

    pub fn config(mut self, config: PaymentConfig) -> Self {
        self.config = config;
        self
    }

    /// Gives node `id` its own configuration instead of the shared one.
    pub fn node_config(mut self, id: u128, config: PaymentConfig) -> Self {
        self.node_configs.insert(node(id), config);
        self
    }

    pub fn max_paths(mut self, max_paths: usize) -> Self {
        self.max_paths = Some(max_paths);
        self
    }

    pub fn build(self) -> Network {
        let mut finder = GraphPathFinder::new(self.config.max_path_length);
        if let Some(max_paths) = self.max_paths {
            finder = finder.with_max_paths(max_paths);
        }
        let finder = Arc::new(finder);

        let ids: BTreeSet<NodeId> = self.lines.keys().flat_map(|(a, b)| [*a, *b]).collect();
        let mut nodes = BTreeMap::new();
        for id in ids {
            let trust_lines = TrustLines::new(id);
            let contractors: BTreeSet<NodeId> = self
                .lines
                .keys()
                .filter_map(|(a, b)| match (*a == id, *b == id) {
                    (true, _) => Some(*b),
                    (_, true) => Some(*a),
                    _ => None,
                })
                .collect();
            for contractor in contractors {
                let outgoing = self.lines.get(&(id, contractor)).copied().unwrap_or(0);
                let incoming = self.lines.get(&(contractor, id)).copied().unwrap_or(0);
                trust_lines.open(contractor, amount(incoming), amount(outgoing));
            }
            let storage: Arc<dyn PaymentStorage> = Arc::new(MemoryStorage::new());
            let manager = PaymentsManager::new(
                Arc::new(trust_lines),
                storage,
                finder.clone(),
                self.node_configs.get(&id).unwrap_or(&self.config).clone(),
            );
            nodes.insert(id, manager);
        }
        for ((payer, payee), limit) in &self.lines {
            finder.set_capacity(*payer, *payee, amount(*limit));
        }

        Network {
            nodes,
            finder,
            queue: VecDeque::new(),
            launched: HashMap::new(),
            now: Duration::ZERO,
            filter: None,
            hold: None,
            held: Vec::new(),
            tamper: None,
            delivered: Vec::new(),
        }
    }
}

pub struct Network {
    nodes: BTreeMap<NodeId, PaymentsManager>,
    finder: Arc<GraphPathFinder>,
    queue: VecDeque<(NodeId, Vec<u8>)>,
    launched: HashMap<TransactionId, NodeId>,
    now: Duration,
    filter: Option<Filter>,
    hold: Option<Hold>,
    held: Vec<(NodeId, Message)>,
    tamper: Option<Tamper>,
    /// Every message handed to a node, with its destination.
    pub delivered: Vec<(NodeId, Message)>,
}

impl Network {
    pub fn builder() -> NetworkBuilder {
        NetworkBuilder {
            lines: BTreeMap::new(),
            config: PaymentConfig::new(),
            node_configs: BTreeMap::new(),
            max_paths: None,
        }
    }

    pub fn set_filter(&mut self, filter: impl FnMut(NodeId, &Message) -> bool + 'static) {
        self.filter = Some(Box::new(filter));
    }

    /// Parks matching messages instead of delivering them.
    pub fn set_hold(&mut self, hold: impl FnMut(NodeId, &Message) -> bool + 'static) {
        self.hold = Some(Box::new(hold));
    }

    /// Messages parked so far, with their destinations.
    pub fn held(&self) -> &[(NodeId, Message)] {
        &self.held
    }

    /// Stops holding and puts every parked message back in flight.
    pub fn release_held(&mut self) {
        self.hold = None;
        for (to, message) in std::mem::take(&mut self.held) {
            self.queue
                .push_back((to, codec::encode(&message).expect("message encodes")));
        }
    }

    /// Stops holding and loses every parked message.
    pub fn discard_held(&mut self) {
        self.hold = None;
        self.held.clear();
    }

    pub fn set_tamper(&mut self, tamper: impl FnMut(NodeId, &mut Message) + 'static) {
        self.tamper = Some(Box::new(tamper));
    }

    pub fn manager(&self, id: u128) -> &PaymentsManager {
        &self.nodes[&node(id)]
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    /// Starts a payment without driving the network.
    pub fn launch(&mut self, from: u128, to: u128, value: u32) -> TransactionId {
        let id = self
            .manager(from)
            .launch_payment(node(to), amount(value))
            .expect("transaction id is unique");
        self.launched.insert(id, node(from));
        id
    }

    /// Starts a payment and drives the network until every node is idle.
    pub fn pay(&mut self, from: u128, to: u128, value: u32) -> (TransactionId, PaymentOutcome) {
        let id = self.launch(from, to, value);
        self.run_until_idle();
        let outcome = self
            .manager(from)
            .outcome(&id)
            .expect("payment finished");
        (id, outcome)
    }

    /// Hands `message` to `to` as if it came over the wire.
    pub fn inject(&mut self, to: u128, message: Message) {
        self.queue
            .push_back((node(to), codec::encode(&message).expect("message encodes")));
    }

    fn collect_outgoing(&mut self) -> bool {
        let mut produced = false;
        for (transaction_id, resource) in self.finder.drain_resources() {
            if let Some(origin) = self.launched.get(&transaction_id) {
                self.nodes[origin].attach_resource(&transaction_id, resource);
                produced = true;
            }
        }
        for manager in self.nodes.values() {
            for (to, message) in manager.drain_outgoing() {
                let bytes = codec::encode(&message).expect("message encodes");
                self.queue.push_back((to, bytes));
                produced = true;
            }
        }
        produced
    }

    /// Delivers messages until nothing is in flight.
    pub fn deliver_all(&mut self) {
        for _ in 0..MAX_ROUNDS {
            self.collect_outgoing();
            let Some((to, bytes)) = self.queue.pop_front() else {
                if !self.collect_outgoing() {
                    return;
                }
                continue;
            };
            let mut message = codec::decode(&bytes).expect("message decodes");
            if let Some(filter) = self.filter.as_mut()
                && !filter(to, &message)
            {
                continue;
            }
            if let Some(hold) = self.hold.as_mut()
                && hold(to, &message)
            {
                self.held.push((to, message));
                continue;
            }
            if let Some(tamper) = self.tamper.as_mut() {
                tamper(to, &mut message);
            }
            self.delivered.push((to, message.clone()));
            if let Some(manager) = self.nodes.get(&to) {
                manager
                    .process_encoded(&codec::encode(&message).expect("message encodes"))
                    .expect("message decodes");
            }
        }
        panic!("network didn't settle");
    }

    /// Alternates delivery and clock jumps until no transaction runs anywhere.
    pub fn run_until_idle(&mut self) {
        self.run_until(|_| false);
    }

    /// Like [`Network::run_until_idle`], but stops as soon as `done` holds
    /// with nothing in flight.
    pub fn run_until(&mut self, mut done: impl FnMut(&Network) -> bool) {
        for _ in 0..MAX_ROUNDS {
            self.deliver_all();
            if done(&*self) {
                return;
            }
            let Some(deadline) = self.nodes.values().filter_map(|m| m.next_deadline()).min() else {
                return;
            };
            self.now = self.now.max(deadline);
            for manager in self.nodes.values() {
                manager.tick(self.now);
            }
        }
        panic!("transactions didn't finish");
    }

    /// Messages of `message_type` handed to `to` so far.
    pub fn delivered_to(&self, to: u128, message_type: MessageType) -> Vec<&Message> {
        self.delivered
            .iter()
            .filter(|(destination, message)| {
                *destination == node(to) && message.message_type() == message_type
            })
            .map(|(_, message)| message)
            .collect()
    }

    pub fn balance(&self, owner: u128, contractor: u128) -> BigInt {
        self.manager(owner)
            .trust_lines()
            .balance(&node(contractor))
            .expect("trust line exists")
    }

    pub fn available_outgoing(&self, owner: u128, contractor: u128) -> TrustLineAmount {
        self.manager(owner).trust_lines().available_outgoing(&node(contractor))
    }

    /// Reservations held on every line of every node.
    pub fn reservations_count(&self) -> usize {
        self.nodes
            .values()
            .flat_map(|manager| {
                manager
                    .trust_lines()
                    .iter()
                    .map(|line| line.reservations_count())
                    .collect::<Vec<_>>()
            })
            .sum()
    }

    pub fn reserved(&self, owner: u128, contractor: u128, direction: ReservationDirection) -> TrustLineAmount {
        self.manager(owner)
            .trust_lines()
            .total_reserved(&node(contractor), direction, None)
    }

    pub fn storage(&self, id: u128) -> &Arc<dyn PaymentStorage> {
        self.manager(id).storage()
    }
}
