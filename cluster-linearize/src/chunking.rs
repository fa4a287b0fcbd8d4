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

//! Chunking of linearizations and the feerate-diagram partial order.
//!
//! The chunks of a linearization are the unique partition into contiguous
//! blocks whose feerates strictly decrease from front to back. Two
//! linearizations of the same cluster are compared through the cumulative
//! (size, fee) diagrams of their chunks.

use std::cmp::Ordering;

use crate::bitset::TxSet;
use crate::depgraph::{DepGraph, DepGraphIndex, SetInfo};
use crate::feefrac::{feerate_cmp, FeeFrac};

/// Compute the chunks of a linearization as [SetInfo]s, front to back.
pub fn chunk_linearization_info<S: TxSet>(
    depgraph: &DepGraph<S>,
    linearization: &[DepGraphIndex],
) -> Vec<SetInfo<S>> {
    let mut ret: Vec<SetInfo<S>> = Vec::new();
    for &i in linearization {
        let mut new_chunk = SetInfo::from_tx(depgraph, i);
        // As long as the new chunk has a higher feerate than the last chunk so
        // far, absorb it.
        while let Some(last) = ret.last() {
            if feerate_cmp(&new_chunk.feerate, &last.feerate) != Ordering::Greater {
                break;
            }
            new_chunk |= ret.pop().expect("checked non-empty");
        }
        ret.push(new_chunk);
    }
    ret
}

/// Compute the feerates of the chunks of a linearization. Identical to
/// [chunk_linearization_info], but without the transaction sets.
pub fn chunk_linearization<S: TxSet>(
    depgraph: &DepGraph<S>,
    linearization: &[DepGraphIndex],
) -> Vec<FeeFrac> {
    let mut ret: Vec<FeeFrac> = Vec::new();
    for &i in linearization {
        let mut new_chunk = depgraph.feerate(i);
        while let Some(last) = ret.last() {
            if feerate_cmp(&new_chunk, last) != Ordering::Greater {
                break;
            }
            new_chunk += ret.pop().expect("checked non-empty");
        }
        ret.push(new_chunk);
    }
    ret
}

/// Compare two chunkings of clusters with the same total size by their
/// convexified feerate diagrams.
///
/// Both inputs must be sorted by non-increasing feerate (as produced by
/// [chunk_linearization] or `SpanningForestState::diagram`) and consist of
/// positive-size chunks. The result is a partial order:
/// - `Some(Ordering::Greater)`: `chunks0`'s diagram is somewhere above
///   `chunks1`'s and nowhere below it.
/// - `Some(Ordering::Equal)`: the diagrams coincide everywhere.
/// - `None`: each diagram is above the other somewhere (incomparable).
pub fn compare_chunks(chunks0: &[FeeFrac], chunks1: &[FeeFrac]) -> Option<Ordering> {
    let points0 = cumulative_points(chunks0);
    let points1 = cumulative_points(chunks1);
    assert_eq!(
        points0.last().map_or(0, |p| p.size),
        points1.last().map_or(0, |p| p.size),
        "diagrams of different total size are not comparable"
    );

    let mut zero_above_one = false;
    let mut one_above_zero = false;
    for point in points0.iter() {
        match compare_point_to_diagram(point, &points1) {
            Ordering::Greater => zero_above_one = true,
            Ordering::Less => one_above_zero = true,
            Ordering::Equal => (),
        }
    }
    for point in points1.iter() {
        match compare_point_to_diagram(point, &points0) {
            Ordering::Greater => one_above_zero = true,
            Ordering::Less => zero_above_one = true,
            Ordering::Equal => (),
        }
    }
    match (zero_above_one, one_above_zero) {
        (true, true) => None,
        (true, false) => Some(Ordering::Greater),
        (false, true) => Some(Ordering::Less),
        (false, false) => Some(Ordering::Equal),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct DiagramPoint {
    size: i64,
    fee: i128,
}

/// The cumulative diagram vertices of a chunking, starting at the origin.
fn cumulative_points(chunks: &[FeeFrac]) -> Vec<DiagramPoint> {
    let mut points = Vec::with_capacity(chunks.len() + 1);
    points.push(DiagramPoint { size: 0, fee: 0 });
    let mut acc = DiagramPoint { size: 0, fee: 0 };
    for (idx, chunk) in chunks.iter().enumerate() {
        debug_assert!(chunk.size > 0, "chunks must have positive size");
        if idx > 0 {
            debug_assert_ne!(
                feerate_cmp(chunk, &chunks[idx - 1]),
                Ordering::Greater,
                "chunk feerates must be non-increasing"
            );
        }
        acc.size += i64::from(chunk.size);
        acc.fee += i128::from(chunk.fee);
        points.push(acc);
    }
    points
}

/// Compare a vertex against a piecewise-linear diagram at the vertex's size.
/// The vertex's size must lie within the diagram's size range.
fn compare_point_to_diagram(point: &DiagramPoint, points: &[DiagramPoint]) -> Ordering {
    let after = points.partition_point(|p| p.size < point.size);
    debug_assert!(after < points.len());
    let p1 = points[after];
    if p1.size == point.size {
        return point.fee.cmp(&p1.fee);
    }
    // Interpolate between the two vertices straddling the size. Cross-multiply
    // to stay in integers.
    let p0 = points[after - 1];
    debug_assert!(p0.size < point.size && point.size < p1.size);
    let span = i128::from(p1.size - p0.size);
    let lhs = (point.fee - p0.fee) * span;
    let rhs = (p1.fee - p0.fee) * i128::from(point.size - p0.size);
    lhs.cmp(&rhs)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use test_utils::random::{make_seedable_rng, Rng, Seed};

    use crate::bitset::BitSet64;
    use crate::tests::utils::random_depgraph;

    use super::*;

    fn frac(fee: i64, size: i32) -> FeeFrac {
        FeeFrac::new(fee, size)
    }

    #[test]
    fn chunking_merges_rising_feerates() {
        let mut depgraph = DepGraph::<BitSet64>::new();
        let a = depgraph.add_transaction(frac(1, 1));
        let b = depgraph.add_transaction(frac(10, 1));
        depgraph.add_dependencies(BitSet64::singleton(a), b);

        // b has a higher feerate than a, so [a, b] is one chunk.
        assert_eq!(chunk_linearization(&depgraph, &[a, b]), vec![frac(11, 2)]);

        let info = chunk_linearization_info(&depgraph, &[a, b]);
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].transactions, BitSet64::fill(2));
        assert_eq!(info[0].feerate, frac(11, 2));
    }

    #[test]
    fn chunking_keeps_falling_feerates_apart() {
        let mut depgraph = DepGraph::<BitSet64>::new();
        let a = depgraph.add_transaction(frac(10, 1));
        let b = depgraph.add_transaction(frac(1, 1));
        depgraph.add_dependencies(BitSet64::singleton(a), b);

        assert_eq!(chunk_linearization(&depgraph, &[a, b]), vec![frac(10, 1), frac(1, 1)]);
    }

    #[test]
    fn chunking_cascades() {
        // Feerates 1, 2, 3: the 3 pulls in the 2, and the merged (5, 2) pulls
        // in the 1, leaving a single chunk.
        let mut depgraph = DepGraph::<BitSet64>::new();
        let a = depgraph.add_transaction(frac(1, 1));
        let b = depgraph.add_transaction(frac(2, 1));
        let c = depgraph.add_transaction(frac(3, 1));
        depgraph.add_dependencies(BitSet64::singleton(a), b);
        depgraph.add_dependencies(BitSet64::singleton(b), c);

        assert_eq!(chunk_linearization(&depgraph, &[a, b, c]), vec![frac(6, 3)]);
    }

    #[rstest]
    #[trace]
    #[case(Seed::from_entropy())]
    fn chunk_feerates_strictly_decrease(#[case] seed: Seed) {
        let mut rng = make_seedable_rng(seed);
        for _ in 0..20 {
            let num_txs = rng.gen_range(1..30);
            let depgraph: DepGraph<BitSet64> = random_depgraph(&mut rng, num_txs, 0.2);
            let mut linearization = Vec::new();
            depgraph.append_topo(&mut linearization, depgraph.positions());

            let chunks = chunk_linearization(&depgraph, &linearization);
            assert!(chunks
                .windows(2)
                .all(|w| feerate_cmp(&w[0], &w[1]) == Ordering::Greater));

            // Chunk totals add up to the whole cluster.
            let total: FeeFrac = chunks.iter().fold(FeeFrac::default(), |acc, c| acc + *c);
            assert_eq!(total, depgraph.combined_feerate(depgraph.positions()));

            // The chunk sets partition the linearization into contiguous runs.
            let info = chunk_linearization_info(&depgraph, &linearization);
            let mut pos = 0;
            for chunk in &info {
                let len = chunk.transactions.count() as usize;
                for &tx in &linearization[pos..pos + len] {
                    assert!(chunk.transactions.contains(tx));
                }
                pos += len;
            }
            assert_eq!(pos, linearization.len());
        }
    }

    #[test]
    fn compare_chunks_total_order_on_lines() {
        // Same cluster (total fee 10, size 4) chunked three ways.
        let better = vec![frac(8, 2), frac(2, 2)];
        let worse = vec![frac(5, 2), frac(5, 2)];
        assert_eq!(compare_chunks(&better, &worse), Some(Ordering::Greater));
        assert_eq!(compare_chunks(&worse, &better), Some(Ordering::Less));
        assert_eq!(compare_chunks(&better, &better), Some(Ordering::Equal));
    }

    #[test]
    fn compare_chunks_segment_split_is_equal() {
        // Splitting a chunk into equal-feerate parts does not change the
        // diagram.
        let merged = vec![frac(10, 4)];
        let split = vec![frac(5, 2), frac(5, 2)];
        assert_eq!(compare_chunks(&merged, &split), Some(Ordering::Equal));
    }

    #[test]
    fn compare_chunks_incomparable() {
        // Both diagrams reach (4, 6), but the first is higher at size 1 and
        // the second is higher at size 2.
        let steep_start = vec![frac(4, 1), frac(1, 1), frac(1, 1), frac(0, 1)];
        let steep_middle = vec![frac(6, 2), frac(0, 2)];
        assert_eq!(compare_chunks(&steep_start, &steep_middle), None);
        assert_eq!(compare_chunks(&steep_middle, &steep_start), None);
    }

    #[test]
    fn compare_chunks_different_fee_totals() {
        // A cluster whose diagram is above the other's everywhere dominates,
        // even with different total fees.
        let high = vec![frac(8, 2), frac(4, 2)];
        let low = vec![frac(6, 2), frac(0, 2)];
        assert_eq!(compare_chunks(&high, &low), Some(Ordering::Greater));
    }
}
