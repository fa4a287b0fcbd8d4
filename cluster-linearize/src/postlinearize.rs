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

//! Cheap in-place improvement of an existing linearization.

use std::cmp::Ordering;

use crate::bitset::TxSet;
use crate::depgraph::{DepGraph, DepGraphIndex};
use crate::feefrac::{feerate_cmp, FeeFrac};

/// Index of the sentinel in the entries array; transaction `t` lives at
/// `t + 1`.
const SENTINEL: DepGraphIndex = 0;
/// Marks a group's first transaction (no predecessor within the group).
const NO_PREV_TX: DepGraphIndex = 0;

/// Per-transaction record. Groups are singly-linked lists of transactions
/// (each pointing at its predecessor), and the groups themselves form a
/// singly-linked circular list through their tail transactions, closed by the
/// sentinel.
#[derive(Clone, Copy, Default)]
struct TxEntry<S> {
    /// Previous transaction in this group; NO_PREV_TX for the group's first.
    prev_tx: DepGraphIndex,

    // The fields below are only meaningful for a group's tail transaction.
    /// First transaction of the group, possibly itself.
    first_tx: DepGraphIndex,
    /// Tail of the previous group; the sentinel points back at the last
    /// group, closing the circle.
    prev_group: DepGraphIndex,
    /// All transactions in the group. Empty for the sentinel.
    group: S,
    /// All dependencies of the group (ancestors in forward passes,
    /// descendants in backward ones).
    deps: S,
    /// Combined fee and size of the group. The fee is negated in backward
    /// passes. Empty for the sentinel, which therefore never compares higher
    /// or lower than any group.
    feerate: FeeFrac,
}

/// Improve a linearization in place.
///
/// Two passes are made over it: first backward, then forward. Each pass walks
/// the input order, maintaining a list of groups; every transaction starts as
/// its own group at the back, and while it has a strictly higher feerate than
/// its predecessor group it either absorbs that group (when it depends on it)
/// or swaps past it. The backward pass is the same computation on the
/// reversed problem: reversed iteration, descendants in place of ancestors,
/// and negated fees.
///
/// Guarantees:
/// - The result is never worse than the input (feerate-diagram order), and
///   its chunks are connected.
/// - For tree-shaped graphs (every transaction with at most one parent, or
///   every transaction with at most one child) the result is optimal.
/// - Starting with the backward pass makes "move a leaf to the end, possibly
///   with a raised fee, then post-linearize" never worse than the original,
///   which is what incremental mempool updates rely on.
pub fn post_linearize<S: TxSet>(depgraph: &DepGraph<S>, linearization: &mut [DepGraphIndex]) {
    let mut entries: Vec<TxEntry<S>> =
        vec![TxEntry::default(); depgraph.position_range() as usize + 1];

    for pass in 0..2 {
        let rev = pass % 2 == 0;
        // The sentinel starts out alone in the circular group list.
        entries[SENTINEL as usize].prev_group = SENTINEL;
        debug_assert!(entries[SENTINEL as usize].feerate.is_empty());

        for i in 0..linearization.len() {
            let idx = linearization[if rev { linearization.len() - 1 - i } else { i }];
            // New singleton group at the back of the list.
            let cur_group = idx + 1;
            entries[cur_group as usize] = TxEntry {
                prev_tx: NO_PREV_TX,
                first_tx: cur_group,
                prev_group: entries[SENTINEL as usize].prev_group,
                group: S::singleton(idx),
                deps: if rev {
                    depgraph.descendants(idx)
                } else {
                    depgraph.ancestors(idx)
                },
                feerate: {
                    let mut feerate = depgraph.feerate(idx);
                    if rev {
                        feerate.fee = -feerate.fee;
                    }
                    feerate
                },
            };
            entries[SENTINEL as usize].prev_group = cur_group;

            // Walk the new group towards the front while it outearns its
            // predecessor, merging or swapping as dependencies dictate.
            let mut next_group = SENTINEL;
            let mut prev_group = entries[cur_group as usize].prev_group;
            while feerate_cmp(
                &entries[cur_group as usize].feerate,
                &entries[prev_group as usize].feerate,
            ) == Ordering::Greater
            {
                debug_assert_eq!(entries[next_group as usize].prev_group, cur_group);
                debug_assert_eq!(entries[cur_group as usize].prev_group, prev_group);
                // The sentinel's empty feerate never loses a comparison, so
                // neither of these can be the sentinel here.
                debug_assert_ne!(cur_group, SENTINEL);
                debug_assert_ne!(prev_group, SENTINEL);
                let prev_entry = entries[prev_group as usize];
                if entries[cur_group as usize].deps.overlaps(&prev_entry.group) {
                    // Merge the predecessor into the current group. Its
                    // group/deps/feerate remain in place but become unused.
                    entries[cur_group as usize].group |= prev_entry.group;
                    entries[cur_group as usize].deps |= prev_entry.deps;
                    entries[cur_group as usize].feerate += prev_entry.feerate;
                    let first_tx = entries[cur_group as usize].first_tx;
                    entries[first_tx as usize].prev_tx = prev_group;
                    entries[cur_group as usize].first_tx = prev_entry.first_tx;
                    prev_group = prev_entry.prev_group;
                    entries[cur_group as usize].prev_group = prev_group;
                } else {
                    // No dependency: swap the two groups in the list.
                    let preprev_group = prev_entry.prev_group;
                    entries[next_group as usize].prev_group = prev_group;
                    entries[prev_group as usize].prev_group = cur_group;
                    entries[cur_group as usize].prev_group = preprev_group;
                    next_group = prev_group;
                    prev_group = preprev_group;
                }
            }
        }

        // Write the groups back into the linearization; backward passes
        // reverse the order again.
        let mut cur_group = entries[SENTINEL as usize].prev_group;
        let mut done = 0;
        while cur_group != SENTINEL {
            let mut cur_tx = cur_group;
            loop {
                if rev {
                    linearization[done] = cur_tx - 1;
                } else {
                    linearization[linearization.len() - 1 - done] = cur_tx - 1;
                }
                done += 1;
                cur_tx = entries[cur_tx as usize].prev_tx;
                if cur_tx == NO_PREV_TX {
                    break;
                }
            }
            cur_group = entries[cur_group as usize].prev_group;
        }
        debug_assert_eq!(done, linearization.len());
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use test_utils::random::{make_seedable_rng, Rng, Seed};

    use crate::bitset::{BitSet64, TxSet};
    use crate::chunking::{chunk_linearization, chunk_linearization_info, compare_chunks};
    use crate::depgraph::DepGraph;
    use crate::tests::utils::{is_topological, random_depgraph, random_topological_order};

    use super::*;

    #[test]
    fn alternating_path_improves() {
        // Path a -> b -> c -> d with feerates 1, 10, 1, 10: post-linearizing
        // [a, b, c, d] must not worsen its diagram.
        let mut depgraph = DepGraph::<BitSet64>::new();
        let a = depgraph.add_transaction(FeeFrac::new(1, 1));
        let b = depgraph.add_transaction(FeeFrac::new(10, 1));
        let c = depgraph.add_transaction(FeeFrac::new(1, 1));
        let d = depgraph.add_transaction(FeeFrac::new(10, 1));
        depgraph.add_dependencies(BitSet64::singleton(a), b);
        depgraph.add_dependencies(BitSet64::singleton(b), c);
        depgraph.add_dependencies(BitSet64::singleton(c), d);

        let original = vec![a, b, c, d];
        let mut improved = original.clone();
        post_linearize(&depgraph, &mut improved);

        assert!(is_topological(&depgraph, &improved));
        let before = chunk_linearization(&depgraph, &original);
        let after = chunk_linearization(&depgraph, &improved);
        assert!(matches!(
            compare_chunks(&after, &before),
            Some(Ordering::Greater | Ordering::Equal)
        ));
    }

    #[rstest]
    #[trace]
    #[case(Seed::from_entropy())]
    fn never_worsens(#[case] seed: Seed) {
        let mut rng = make_seedable_rng(seed);
        for _ in 0..30 {
            let num_txs = rng.gen_range(1..30);
            let depgraph: DepGraph<BitSet64> = random_depgraph(&mut rng, num_txs, 0.2);
            let original = random_topological_order(&depgraph, &mut rng);
            let mut improved = original.clone();
            post_linearize(&depgraph, &mut improved);

            assert!(is_topological(&depgraph, &improved));
            let before = chunk_linearization(&depgraph, &original);
            let after = chunk_linearization(&depgraph, &improved);
            assert!(matches!(
                compare_chunks(&after, &before),
                Some(Ordering::Greater | Ordering::Equal)
            ));
        }
    }

    #[rstest]
    #[trace]
    #[case(Seed::from_entropy())]
    fn chunks_are_connected(#[case] seed: Seed) {
        let mut rng = make_seedable_rng(seed);
        for _ in 0..30 {
            let num_txs = rng.gen_range(1..25);
            let depgraph: DepGraph<BitSet64> = random_depgraph(&mut rng, num_txs, 0.2);
            let mut linearization = random_topological_order(&depgraph, &mut rng);
            post_linearize(&depgraph, &mut linearization);

            for chunk in chunk_linearization_info(&depgraph, &linearization) {
                assert!(depgraph.is_connected_set(chunk.transactions));
            }
        }
    }

    #[rstest]
    #[trace]
    #[case(Seed::from_entropy())]
    fn repeated_applications_never_worsen(#[case] seed: Seed) {
        let mut rng = make_seedable_rng(seed);
        let depgraph: DepGraph<BitSet64> = random_depgraph(&mut rng, 20, 0.25);
        let mut linearization = random_topological_order(&depgraph, &mut rng);
        let mut prev = chunk_linearization(&depgraph, &linearization);
        for _ in 0..3 {
            post_linearize(&depgraph, &mut linearization);
            let cur = chunk_linearization(&depgraph, &linearization);
            assert!(matches!(
                compare_chunks(&cur, &prev),
                Some(Ordering::Greater | Ordering::Equal)
            ));
            prev = cur;
        }
    }
}
