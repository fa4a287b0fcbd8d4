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

//! End-to-end scenarios with known expected outcomes.

use std::cmp::Ordering;

use rstest::rstest;
use test_utils::random::{make_seedable_rng, Rng, Seed};

use crate::bitset::{BitSet128, BitSet64, TxSet};
use crate::chunking::{chunk_linearization, compare_chunks};
use crate::depgraph::DepGraph;
use crate::feefrac::FeeFrac;
use crate::linearize::{index_tx_order, linearize};
use crate::postlinearize::post_linearize;
use crate::tests::utils::{is_topological, random_depgraph};

#[test]
fn diamond_of_equal_feerates() {
    // b and c depend on a; d depends on b and c; all feerates (1, 1). Every
    // topological order is equally good, so the fallback order decides.
    let mut depgraph = DepGraph::<BitSet64>::new();
    let a = depgraph.add_transaction(FeeFrac::new(1, 1));
    let b = depgraph.add_transaction(FeeFrac::new(1, 1));
    let c = depgraph.add_transaction(FeeFrac::new(1, 1));
    let d = depgraph.add_transaction(FeeFrac::new(1, 1));
    depgraph.add_dependencies(BitSet64::singleton(a), b);
    depgraph.add_dependencies(BitSet64::singleton(a), c);
    depgraph.add_dependencies(BitSet64::singleton(b) | BitSet64::singleton(c), d);

    let result = linearize(&depgraph, u64::MAX, 0x1234, index_tx_order, &[], true);
    assert_eq!(result.linearization, vec![a, b, c, d]);
    assert!(result.optimal);

    // The diagram is a single (4, 4) segment (possibly emitted as several
    // equal-feerate chunks).
    let chunks = chunk_linearization(&depgraph, &result.linearization);
    assert_eq!(
        compare_chunks(&chunks, &[FeeFrac::new(4, 4)]),
        Some(Ordering::Equal)
    );
}

#[test]
fn high_feerate_tail_is_grouped_with_parent() {
    // b (10/1) and c (1/1) both depend on a (1/1). The optimizer must group
    // a with b, leaving c on its own.
    let mut depgraph = DepGraph::<BitSet64>::new();
    let a = depgraph.add_transaction(FeeFrac::new(1, 1));
    let b = depgraph.add_transaction(FeeFrac::new(10, 1));
    let c = depgraph.add_transaction(FeeFrac::new(1, 1));
    depgraph.add_dependencies(BitSet64::singleton(a), b);
    depgraph.add_dependencies(BitSet64::singleton(a), c);

    let result = linearize(&depgraph, u64::MAX, 42, index_tx_order, &[], true);
    assert_eq!(result.linearization, vec![a, b, c]);
    assert!(result.optimal);
    assert_eq!(
        chunk_linearization(&depgraph, &result.linearization),
        vec![FeeFrac::new(11, 2), FeeFrac::new(1, 1)]
    );
}

#[test]
fn cheap_child_of_expensive_parent() {
    // b (1/1) depends on a (10/1): a single chunk, parent first.
    let mut depgraph = DepGraph::<BitSet64>::new();
    let a = depgraph.add_transaction(FeeFrac::new(10, 1));
    let b = depgraph.add_transaction(FeeFrac::new(1, 1));
    depgraph.add_dependencies(BitSet64::singleton(a), b);

    let result = linearize(&depgraph, u64::MAX, 7, index_tx_order, &[], true);
    assert_eq!(result.linearization, vec![a, b]);
    assert!(result.optimal);
    // The cheap child never merges into its parent's chunk: chunks only merge
    // when the feerate rises.
    assert_eq!(
        chunk_linearization(&depgraph, &result.linearization),
        vec![FeeFrac::new(10, 1), FeeFrac::new(1, 1)]
    );
}

#[rstest]
#[trace]
#[case(Seed::from_entropy())]
fn budget_exhaustion_still_yields_topological_order(#[case] seed: Seed) {
    let mut rng = make_seedable_rng(seed);
    let depgraph: DepGraph<BitSet128> = random_depgraph(&mut rng, 60, 0.25);

    let result = linearize(&depgraph, 0, rng.gen::<u64>(), index_tx_order, &[], true);
    assert!(is_topological(&depgraph, &result.linearization));
    assert!(!result.optimal);
    let n = u64::from(depgraph.tx_count());
    assert!(result.cost <= n * n);
}

#[test]
fn post_linearize_improves_alternating_path() {
    // Path a -> b -> c -> d (each depending on the previous) with feerates
    // 1, 10, 1, 10.
    let mut depgraph = DepGraph::<BitSet64>::new();
    let a = depgraph.add_transaction(FeeFrac::new(1, 1));
    let b = depgraph.add_transaction(FeeFrac::new(10, 1));
    let c = depgraph.add_transaction(FeeFrac::new(1, 1));
    let d = depgraph.add_transaction(FeeFrac::new(10, 1));
    depgraph.add_dependencies(BitSet64::singleton(a), b);
    depgraph.add_dependencies(BitSet64::singleton(b), c);
    depgraph.add_dependencies(BitSet64::singleton(c), d);

    let original = vec![a, b, c, d];
    let before = chunk_linearization(&depgraph, &original);
    let mut improved = original;
    post_linearize(&depgraph, &mut improved);
    let after = chunk_linearization(&depgraph, &improved);

    assert!(is_topological(&depgraph, &improved));
    assert!(matches!(
        compare_chunks(&after, &before),
        Some(Ordering::Greater | Ordering::Equal)
    ));
}

#[rstest]
#[trace]
#[case(Seed::from_entropy())]
fn reoptimizing_a_prior_linearization_never_worsens(#[case] seed: Seed) {
    let mut rng = make_seedable_rng(seed);
    for _ in 0..10 {
        let num_txs = rng.gen_range(2..30);
        let depgraph: DepGraph<BitSet64> = random_depgraph(&mut rng, num_txs, 0.25);

        let first = linearize(&depgraph, u64::MAX, 1, index_tx_order, &[], true);
        let second = linearize(
            &depgraph,
            u64::MAX,
            2,
            index_tx_order,
            &first.linearization,
            true,
        );

        let first_chunks = chunk_linearization(&depgraph, &first.linearization);
        let second_chunks = chunk_linearization(&depgraph, &second.linearization);
        assert!(matches!(
            compare_chunks(&second_chunks, &first_chunks),
            Some(Ordering::Greater | Ordering::Equal)
        ));
    }
}

#[test]
fn trivial_clusters() {
    let empty = DepGraph::<BitSet64>::new();
    let result = linearize(&empty, 0, 0, index_tx_order, &[], true);
    assert!(result.linearization.is_empty());
    assert!(result.optimal);
    assert_eq!(result.cost, 0);

    let mut single = DepGraph::<BitSet64>::new();
    let a = single.add_transaction(FeeFrac::new(5, 2));
    let result = linearize(&single, 0, 0, index_tx_order, &[], true);
    assert_eq!(result.linearization, vec![a]);
    assert!(result.optimal);
    assert_eq!(result.cost, 0);
}
