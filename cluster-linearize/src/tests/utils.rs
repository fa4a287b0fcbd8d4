// Copyright (c) 2021-2024 RBB S.r.l
// opensource@mintlayer.org
// SPDX-License-Identifier: MIT
// Licensed under the MIT License;
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://github.com/mintlayer/mintlayer-core/blob/master/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Helpers shared by the tests of all modules.

use std::cmp::Ordering;

use randomness::Rng;

use crate::bitset::TxSet;
use crate::depgraph::{DepGraph, DepGraphIndex};
use crate::feefrac::{feerate_cmp, FeeFrac};

pub fn random_feerate(rng: &mut impl Rng) -> FeeFrac {
    FeeFrac::new(rng.gen_range(0..10_000), rng.gen_range(1..1_000))
}

/// A random acyclic graph of `num_txs` transactions, where each of the
/// possible forward dependencies exists with probability `density`.
pub fn random_depgraph<S: TxSet>(
    rng: &mut impl Rng,
    num_txs: u32,
    density: f64,
) -> DepGraph<S> {
    assert!(num_txs <= S::CAPACITY);
    let mut depgraph = DepGraph::new();
    for _ in 0..num_txs {
        depgraph.add_transaction(random_feerate(rng));
    }
    for child in 1..num_txs {
        let mut parents = S::default();
        for parent in 0..child {
            if rng.gen_bool(density) {
                parents.set(parent);
            }
        }
        depgraph.add_dependencies(parents, child);
    }
    depgraph
}

/// A random acyclic graph where every transaction has at most one child
/// (parent counts are unrestricted), i.e. an in-tree shape per component.
pub fn random_single_child_depgraph<S: TxSet>(rng: &mut impl Rng, num_txs: u32) -> DepGraph<S> {
    assert!(num_txs <= S::CAPACITY);
    let mut depgraph = DepGraph::new();
    for _ in 0..num_txs {
        depgraph.add_transaction(random_feerate(rng));
    }
    for parent in 0..num_txs.saturating_sub(1) {
        if rng.gen_bool(0.75) {
            let child = rng.gen_range(parent + 1..num_txs);
            depgraph.add_dependencies(S::singleton(parent), child);
        }
    }
    depgraph
}

/// A uniformly-random-ish topological order over the graph's positions, built
/// by repeatedly emitting a random transaction with no unmet parents.
pub fn random_topological_order<S: TxSet>(
    depgraph: &DepGraph<S>,
    rng: &mut impl Rng,
) -> Vec<DepGraphIndex> {
    let mut ret = Vec::with_capacity(depgraph.tx_count() as usize);
    let mut todo = depgraph.positions();
    let mut emitted = S::default();
    while todo.any() {
        let ready: Vec<DepGraphIndex> = todo
            .iter()
            .filter(|&tx| (depgraph.ancestors(tx) - emitted) == S::singleton(tx))
            .collect();
        let tx = ready[rng.gen_range(0..ready.len())];
        ret.push(tx);
        emitted.set(tx);
        todo.reset(tx);
    }
    ret
}

/// Whether `order` is a permutation of the graph's positions in which every
/// transaction appears after all of its ancestors.
pub fn is_topological<S: TxSet>(depgraph: &DepGraph<S>, order: &[DepGraphIndex]) -> bool {
    if order.len() != depgraph.tx_count() as usize {
        return false;
    }
    let mut emitted = S::default();
    for &tx in order {
        if !depgraph.positions().contains(tx) || emitted.contains(tx) {
            return false;
        }
        if (depgraph.ancestors(tx) - emitted) != S::singleton(tx) {
            return false;
        }
        emitted.set(tx);
    }
    true
}

/// The optimal feerate diagram of a small cluster, by exhaustive search:
/// repeatedly pick the highest-feerate subset that is ancestor-closed within
/// the remaining transactions (largest such subset on feerate ties), which is
/// the first chunk of an optimal linearization of the remainder.
pub fn exhaustive_optimal_diagram<S: TxSet>(depgraph: &DepGraph<S>) -> Vec<FeeFrac> {
    let positions: Vec<DepGraphIndex> = depgraph.positions().iter().collect();
    let num_txs = positions.len();
    assert!(num_txs <= 16, "exhaustive search is exponential");

    let mut ret = Vec::new();
    let mut todo = depgraph.positions();
    while todo.any() {
        let mut best: Option<(S, FeeFrac)> = None;
        for mask in 1u32..(1 << num_txs) {
            let mut subset = S::default();
            for (bit, &pos) in positions.iter().enumerate() {
                if mask & (1 << bit) != 0 {
                    subset.set(pos);
                }
            }
            if !subset.is_subset_of(&todo) {
                continue;
            }
            let closed = subset
                .iter()
                .all(|tx| (depgraph.ancestors(tx) & todo).is_subset_of(&subset));
            if !closed {
                continue;
            }
            let feerate = depgraph.combined_feerate(subset);
            let replace = match &best {
                None => true,
                Some((_, best_feerate)) => match feerate_cmp(&feerate, best_feerate) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => feerate.size > best_feerate.size,
                },
            };
            if replace {
                best = Some((subset, feerate));
            }
        }
        let (subset, feerate) = best.expect("todo is non-empty");
        ret.push(feerate);
        todo -= subset;
    }
    ret
}
