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

use std::cmp::Ordering;

use logging::log;

use crate::bitset::TxSet;
use crate::depgraph::{DepGraph, DepGraphIndex};
use crate::spanning_forest::SpanningForestState;

/// The outcome of [linearize].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinearizeResult {
    /// The computed linearization: a topologically valid permutation of the
    /// graph's positions.
    pub linearization: Vec<DepGraphIndex>,
    /// Whether the linearization is known to be optimal, with minimal chunks.
    pub optimal: bool,
    /// The amount of work performed, in the same units as `max_iterations`.
    pub cost: u64,
}

/// The default fallback comparator: order transactions by position.
pub fn index_tx_order(a: DepGraphIndex, b: DepGraphIndex) -> Ordering {
    a.cmp(&b)
}

/// Find or improve a linearization for a cluster.
///
/// * `depgraph`: the dependency graph of the cluster.
/// * `max_iterations`: upper bound on the amount of optimization work, in
///   transactions touched by chunk merges and splits. When the bound is hit,
///   the best state found so far is emitted with `optimal = false`.
/// * `rng_seed`: seed controlling all search order randomization. Randomizing
///   prevents peers from predicting which clusters are hard for us; fixing the
///   seed makes the result reproducible.
/// * `fallback_order`: a strict total order on positions used to break ties
///   among equal-feerate chunks and transactions.
/// * `old_linearization`: an existing linearization to start from, or empty.
///   The result is never worse than it in the feerate-diagram sense.
/// * `is_topological`: whether `old_linearization` (if non-empty) is already
///   topologically valid.
pub fn linearize<S, F>(
    depgraph: &DepGraph<S>,
    max_iterations: u64,
    rng_seed: u64,
    fallback_order: F,
    old_linearization: &[DepGraphIndex],
    is_topological: bool,
) -> LinearizeResult
where
    S: TxSet,
    F: Fn(DepGraphIndex, DepGraphIndex) -> Ordering,
{
    // A cluster of at most one transaction has exactly one linearization;
    // no optimization work can apply to it.
    if depgraph.tx_count() <= 1 {
        return LinearizeResult {
            linearization: depgraph.positions().iter().collect(),
            optimal: true,
            cost: 0,
        };
    }

    let mut forest = SpanningForestState::new(depgraph, rng_seed);
    if !old_linearization.is_empty() {
        forest.load_linearization(old_linearization);
        if !is_topological {
            forest.make_topological();
        }
    } else {
        forest.make_topological();
    }
    // Improvement steps until optimal or out of budget.
    if forest.cost() < max_iterations {
        forest.start_optimizing();
        while forest.optimize_step() {
            if forest.cost() >= max_iterations {
                break;
            }
        }
    }
    // Chunk minimization steps until minimal or out of budget. Only a fully
    // minimized state is reported as optimal.
    let mut optimal = false;
    if forest.cost() < max_iterations {
        forest.start_minimizing();
        loop {
            if !forest.minimize_step() {
                optimal = true;
                break;
            }
            if forest.cost() >= max_iterations {
                break;
            }
        }
    }
    let linearization = forest.get_linearization(&fallback_order);
    log::trace!(
        "linearized cluster of {} transactions, cost {} of {}, optimal: {}",
        depgraph.tx_count(),
        forest.cost(),
        max_iterations,
        optimal,
    );
    LinearizeResult {
        linearization,
        optimal,
        cost: forest.cost(),
    }
}
