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

//! Candidate path discovery.
//!
//! The coordinator asks for paths once, asynchronously, and later rebuilds
//! them synchronously after marking what the failed round consumed. The
//! bundled [`GraphPathFinder`] works over a static capacity graph; real
//! deployments plug their own routing behind [`PathFinder`].

use crate::base::{NodeId, TransactionId, TrustLineAmount};
use crate::path::Path;
use crate::result::Resource;
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use num_traits::Zero;
use std::collections::{BTreeSet, HashMap};

/// Default upper bound on paths returned by one search.
const MAX_PATHS: usize = 32;

/// Routing capability injected into the coordinator.
pub trait PathFinder: Send + Sync {
    /// Starts an asynchronous search. Results arrive later as a
    /// [`Resource::Paths`] attached to `transaction_id`.
    fn request_paths(&self, transaction_id: TransactionId, source: NodeId, destination: NodeId);

    /// Searches again, skipping `excluded` nodes and capacity already marked used.
    fn rebuild_paths(
        &self,
        transaction_id: TransactionId,
        source: NodeId,
        destination: NodeId,
        excluded: &BTreeSet<NodeId>,
    ) -> Vec<Path>;

    /// Marks `amount` of the edge `from -> to` as consumed by `transaction_id`.
    fn add_used_amount(
        &self,
        transaction_id: TransactionId,
        from: NodeId,
        to: NodeId,
        amount: TrustLineAmount,
    );

    /// Marks the whole edge `from -> to` as consumed by `transaction_id`.
    fn make_fully_used(&self, transaction_id: TransactionId, from: NodeId, to: NodeId);

    /// Forgets the usage marks of a finished transaction.
    fn release(&self, transaction_id: &TransactionId);
}

#[derive(Debug, Clone)]
enum EdgeUsage {
    Partial(TrustLineAmount),
    Full,
}

/// Depth-first search over a directed capacity graph.
///
/// An edge `from -> to` with capacity `c` means `from` can pay `to` up to `c`.
#[derive(Debug)]
pub struct GraphPathFinder {
    max_path_length: usize,
    max_paths: usize,
    capacities: DashMap<(NodeId, NodeId), TrustLineAmount>,
    usage: DashMap<TransactionId, HashMap<(NodeId, NodeId), EdgeUsage>>,
    resources: SegQueue<(TransactionId, Resource)>,
}

impl GraphPathFinder {
    pub fn new(max_path_length: usize) -> Self {
        Self {
            max_path_length,
            max_paths: MAX_PATHS,
            capacities: DashMap::new(),
            usage: DashMap::new(),
            resources: SegQueue::new(),
        }
    }

    /// Caps how many paths one search returns.
    pub fn with_max_paths(mut self, max_paths: usize) -> Self {
        self.max_paths = max_paths;
        self
    }

    /// Sets the capacity of `from -> to`. Zero removes the edge.
    pub fn set_capacity(&self, from: NodeId, to: NodeId, capacity: TrustLineAmount) {
        if capacity.is_zero() {
            self.capacities.remove(&(from, to));
        } else {
            self.capacities.insert((from, to), capacity);
        }
    }

    /// Takes every resource produced since the last call.
    pub fn drain_resources(&self) -> Vec<(TransactionId, Resource)> {
        std::iter::from_fn(|| self.resources.pop()).collect()
    }

    fn residual(&self, transaction_id: &TransactionId, from: &NodeId, to: &NodeId) -> TrustLineAmount {
        let Some(capacity) = self.capacities.get(&(*from, *to)).map(|c| c.value().clone()) else {
            return TrustLineAmount::zero();
        };
        let used = self
            .usage
            .get(transaction_id)
            .and_then(|usage| usage.get(&(*from, *to)).cloned());
        match used {
            None => capacity,
            Some(EdgeUsage::Full) => TrustLineAmount::zero(),
            Some(EdgeUsage::Partial(used)) if used >= capacity => TrustLineAmount::zero(),
            Some(EdgeUsage::Partial(used)) => capacity - used,
        }
    }

    fn neighbors(&self, node: &NodeId) -> Vec<NodeId> {
        let mut neighbors: Vec<NodeId> = self
            .capacities
            .iter()
            .filter(|entry| entry.key().0 == *node)
            .map(|entry| entry.key().1)
            .collect();
        neighbors.sort();
        neighbors
    }

    fn find_paths(
        &self,
        transaction_id: &TransactionId,
        source: NodeId,
        destination: NodeId,
        excluded: &BTreeSet<NodeId>,
    ) -> Vec<Path> {
        let mut found = Vec::new();
        let mut stack = vec![source];
        self.walk(transaction_id, destination, excluded, &mut stack, &mut found);
        found.sort_by(|a: &Path, b: &Path| {
            a.len().cmp(&b.len()).then_with(|| a.nodes().cmp(b.nodes()))
        });
        found.truncate(self.max_paths);
        found
    }

    fn walk(
        &self,
        transaction_id: &TransactionId,
        destination: NodeId,
        excluded: &BTreeSet<NodeId>,
        stack: &mut Vec<NodeId>,
        found: &mut Vec<Path>,
    ) {
        let Some(current) = stack.last().copied() else {
            return;
        };
        if current == destination {
            found.push(Path::new(stack.clone()));
            return;
        }
        if stack.len() >= self.max_path_length {
            return;
        }
        for next in self.neighbors(&current) {
            if stack.contains(&next) || (next != destination && excluded.contains(&next)) {
                continue;
            }
            if self.residual(transaction_id, &current, &next).is_zero() {
                continue;
            }
            stack.push(next);
            self.walk(transaction_id, destination, excluded, stack, found);
            stack.pop();
        }
    }
}

impl PathFinder for GraphPathFinder {
    fn request_paths(&self, transaction_id: TransactionId, source: NodeId, destination: NodeId) {
        let paths = self.find_paths(&transaction_id, source, destination, &BTreeSet::new());
        tracing::debug!(%transaction_id, paths = paths.len(), "paths found");
        self.resources.push((transaction_id, Resource::Paths(paths)));
    }

    fn rebuild_paths(
        &self,
        transaction_id: TransactionId,
        source: NodeId,
        destination: NodeId,
        excluded: &BTreeSet<NodeId>,
    ) -> Vec<Path> {
        self.find_paths(&transaction_id, source, destination, excluded)
    }

    fn add_used_amount(
        &self,
        transaction_id: TransactionId,
        from: NodeId,
        to: NodeId,
        amount: TrustLineAmount,
    ) {
        let mut usage = self.usage.entry(transaction_id).or_default();
        let entry = usage
            .entry((from, to))
            .or_insert_with(|| EdgeUsage::Partial(TrustLineAmount::zero()));
        if let EdgeUsage::Partial(used) = entry {
            *used += amount;
        }
    }

    fn make_fully_used(&self, transaction_id: TransactionId, from: NodeId, to: NodeId) {
        self.usage
            .entry(transaction_id)
            .or_default()
            .insert((from, to), EdgeUsage::Full);
    }

    fn release(&self, transaction_id: &TransactionId) {
        self.usage.remove(transaction_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u128) -> NodeId {
        NodeId::from_u128(n)
    }

    fn make_finder() -> GraphPathFinder {
        // 1 -> 2 -> 4 and 1 -> 3 -> 4, plus direct 1 -> 4
        let finder = GraphPathFinder::new(5);
        for (from, to) in [(1, 2), (2, 4), (1, 3), (3, 4), (1, 4)] {
            finder.set_capacity(node(from), node(to), TrustLineAmount::from(100u32));
        }
        finder
    }

    #[test]
    fn shortest_paths_first() {
        let finder = make_finder();
        let tx = TransactionId::from_u128(1);
        finder.request_paths(tx, node(1), node(4));

        let resources = finder.drain_resources();
        assert_eq!(resources.len(), 1);
        let (id, Resource::Paths(paths)) = &resources[0];
        assert_eq!(*id, tx);
        assert_eq!(paths.len(), 3);
        assert_eq!(paths[0], Path::new(vec![node(1), node(4)]));
        assert_eq!(paths[1], Path::new(vec![node(1), node(2), node(4)]));
        assert!(finder.drain_resources().is_empty());
    }

    #[test]
    fn rebuild_skips_used_edges_and_excluded_nodes() {
        let finder = make_finder();
        let tx = TransactionId::from_u128(1);
        finder.make_fully_used(tx, node(1), node(4));
        finder.add_used_amount(tx, node(1), node(2), TrustLineAmount::from(100u32));

        let excluded = BTreeSet::from([node(3)]);
        assert!(finder.rebuild_paths(tx, node(1), node(4), &excluded).is_empty());

        let paths = finder.rebuild_paths(tx, node(1), node(4), &BTreeSet::new());
        assert_eq!(paths, vec![Path::new(vec![node(1), node(3), node(4)])]);

        // Marks are per transaction.
        let other = TransactionId::from_u128(2);
        assert_eq!(finder.rebuild_paths(other, node(1), node(4), &excluded).len(), 2);

        finder.release(&tx);
        assert_eq!(finder.rebuild_paths(tx, node(1), node(4), &BTreeSet::new()).len(), 3);
    }

    #[test]
    fn search_returns_at_most_max_paths() {
        let finder = make_finder().with_max_paths(1);
        let paths = finder.rebuild_paths(TransactionId::from_u128(1), node(1), node(4), &BTreeSet::new());
        assert_eq!(paths, vec![Path::new(vec![node(1), node(4)])]);
    }

    #[test]
    fn path_length_is_bounded() {
        let finder = GraphPathFinder::new(3);
        for (from, to) in [(1, 2), (2, 3), (3, 4)] {
            finder.set_capacity(node(from), node(to), TrustLineAmount::from(1u32));
        }
        assert!(finder.rebuild_paths(TransactionId::from_u128(1), node(1), node(4), &BTreeSet::new()).is_empty());
    }
}
