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

//! The spanning-forest linearization (SFL) state machine.
//!
//! Every dependency of the cluster is either "active" or "inactive"; the set
//! of active dependencies is the whole state. Transactions connected through
//! active dependencies (ignoring direction) form a chunk, so the state implies
//! a partition of the cluster into chunks. Activating a dependency merges two
//! chunks, deactivating one splits a chunk in two, and the state is kept
//! acyclic at all times: within each chunk the active dependencies form a
//! tree, making the overall active set a spanning forest.
//!
//! The state can satisfy successively stronger predicates:
//!
//! - *topological*: no inactive dependency runs from a chunk to another chunk
//!   of higher-or-equal feerate. A topological state emits a topologically
//!   valid linearization.
//! - *optimal*: topological, and no active dependency has a top set (the part
//!   that would split off on the parent's side) with strictly higher feerate
//!   than its bottom set. An optimal state emits an optimal linearization in
//!   the feerate-diagram sense.
//! - *minimal*: optimal, and no chunk can be split into equal-feerate parts
//!   without mutual dependencies. Minimization realizes every such split, so
//!   the emitted chunks are as fine as possible.
//!
//! The driver loop is: make the state topological ([Self::make_topological] or
//! [Self::load_linearization]), repeatedly improve it
//! ([Self::optimize_step]) until optimal, then split equal-feerate chunks
//! ([Self::minimize_step]) until minimal, and emit
//! ([Self::get_linearization]). Each phase can be abandoned at any point and
//! the state still emits a valid linearization, which is what makes the
//! iteration budget in [crate::linearize()] possible.
//!
//! All tie-breaking is uniformly random from a caller-seeded RNG: merge
//! candidates, the dependency activated between two merging chunks, queue
//! orders, split candidates and pivots. Same seed, same result.

use std::cmp::Ordering;
use std::collections::VecDeque;

use randomness::{rngs::SmallRng, Rng};

use crate::bitset::TxSet;
use crate::depgraph::{DepGraph, DepGraphIndex, SetInfo};
use crate::feefrac::{feerate_cmp, FeeFrac};

/// Index into the set-info arena. Entries are either chunks or the top sets of
/// active dependencies; `chunk_idxs` tracks which are which.
type SetIdx = u32;

const INVALID_SET_IDX: SetIdx = SetIdx::MAX;

/// Per-transaction state.
#[derive(Clone, Copy, Debug, Default)]
struct TxData<S> {
    /// The reduced parent set of this transaction. Immutable after
    /// construction.
    parents: S,
    /// The reduced child set of this transaction. Immutable after
    /// construction.
    children: S,
    /// The subset of `children` reachable through an active dependency.
    active_children: S,
    /// Which chunk this transaction belongs to.
    chunk_idx: SetIdx,
}

/// Out-of-chunk transactions reachable from a chunk through parent (`up`) and
/// child (`down`) edges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Reachable<S> {
    up: S,
    down: S,
}

/// The state of the spanning-forest linearization algorithm for one cluster.
pub struct SpanningForestState<'a, S: TxSet> {
    /// Internal RNG; all tie-breaks draw from here.
    rng: SmallRng,
    /// The graph being linearized. Read-only for the state's lifetime.
    depgraph: &'a DepGraph<S>,
    /// All positions of transactions in the cluster.
    transaction_idxs: S,
    /// The set-info entries that are currently chunks (the rest are top sets
    /// of active dependencies).
    chunk_idxs: S,
    /// The set-info indexes currently sitting in `suboptimal_chunks`. Entries
    /// may have stopped being chunks since they were queued.
    suboptimal_idxs: S,
    /// Per-transaction data, indexed by position (holes unused).
    tx_data: Vec<TxData<S>>,
    /// For each (parent, child) pair with an active dependency, the set-info
    /// index of the dependency's top set. Flat matrix of `position_range`
    /// squared entries.
    dep_top_idx: Vec<SetIdx>,
    /// Chunks and active-dependency top sets.
    set_info: Vec<SetInfo<S>>,
    /// For each chunk, the out-of-chunk reachable transactions.
    reachable: Vec<Reachable<S>>,
    /// FIFO of chunks that may still be improvable.
    suboptimal_chunks: VecDeque<SetIdx>,
    /// FIFO of (chunk, pivot transaction, flags) for chunks that may still be
    /// splittable into equal-feerate parts. Flag bit 0: currently attempting
    /// to move the pivot down rather than up. Flag bit 1: second attempt, the
    /// other direction has already failed.
    nonminimal_chunks: VecDeque<(SetIdx, DepGraphIndex, u8)>,
    /// Transactions touched by activations and deactivations so far.
    cost: u64,
    /// Cached `position_range` for indexing into `dep_top_idx`.
    pos_range: usize,
}

impl<'a, S: TxSet> SpanningForestState<'a, S> {
    /// Construct a state for `depgraph` with every dependency inactive, i.e.
    /// every transaction in its own singleton chunk. Not topological yet.
    pub fn new(depgraph: &'a DepGraph<S>, rng_seed: u64) -> Self {
        let pos_range = depgraph.position_range() as usize;
        let transaction_idxs = depgraph.positions();
        let num_transactions = transaction_idxs.count();
        let mut state = Self {
            rng: randomness::make_deterministic_rng(rng_seed),
            depgraph,
            transaction_idxs,
            chunk_idxs: S::fill(num_transactions),
            suboptimal_idxs: S::default(),
            tx_data: vec![TxData::default(); pos_range],
            dep_top_idx: vec![INVALID_SET_IDX; pos_range * pos_range],
            set_info: vec![SetInfo::default(); num_transactions as usize],
            reachable: vec![Reachable::default(); num_transactions as usize],
            suboptimal_chunks: VecDeque::new(),
            nonminimal_chunks: VecDeque::new(),
            cost: 0,
            pos_range,
        };
        let mut num_chunks: SetIdx = 0;
        for tx_idx in transaction_idxs.iter() {
            let parents = depgraph.reduced_parents(tx_idx);
            state.tx_data[tx_idx as usize].parents = parents;
            for parent_idx in parents.iter() {
                state.tx_data[parent_idx as usize].children.set(tx_idx);
            }
            // A singleton chunk per transaction.
            state.tx_data[tx_idx as usize].chunk_idx = num_chunks;
            state.set_info[num_chunks as usize] = SetInfo::from_tx(depgraph, tx_idx);
            num_chunks += 1;
        }
        debug_assert_eq!(num_chunks, num_transactions);
        // Each singleton chunk reaches exactly its transaction's parents and
        // children.
        for chunk_idx in 0..num_chunks {
            let tx_idx = state.set_info[chunk_idx as usize]
                .transactions
                .first()
                .expect("chunks are never empty");
            let tx_data = &state.tx_data[tx_idx as usize];
            state.reachable[chunk_idx as usize] = Reachable {
                up: tx_data.parents,
                down: tx_data.children,
            };
        }
        state
    }

    /// How much activation/deactivation work was performed so far, in touched
    /// transactions.
    pub fn cost(&self) -> u64 {
        self.cost
    }

    fn dep_top(&self, parent_idx: DepGraphIndex, child_idx: DepGraphIndex) -> SetIdx {
        self.dep_top_idx[parent_idx as usize * self.pos_range + child_idx as usize]
    }

    fn set_dep_top(&mut self, parent_idx: DepGraphIndex, child_idx: DepGraphIndex, set_idx: SetIdx) {
        self.dep_top_idx[parent_idx as usize * self.pos_range + child_idx as usize] = set_idx;
    }

    /// Pick a uniformly random transaction from a non-empty set.
    fn pick_random_tx(&mut self, tx_idxs: S) -> DepGraphIndex {
        debug_assert!(tx_idxs.any());
        let pos = self.rng.gen_range(0..tx_idxs.count());
        tx_idxs.iter().nth(pos as usize).expect("position is within the set")
    }

    /// Activate the inactive dependency from `parent_idx` to `child_idx`,
    /// whose endpoints must be in different chunks, merging those chunks.
    /// Returns the merged chunk's set index.
    fn activate(&mut self, parent_idx: DepGraphIndex, child_idx: DepGraphIndex) -> SetIdx {
        debug_assert!(self.tx_data[parent_idx as usize].children.contains(child_idx));
        debug_assert!(!self.tx_data[parent_idx as usize].active_children.contains(child_idx));
        // The parent chunk becomes the top set of the new active dependency;
        // the child chunk's slot grows into the merged chunk.
        let parent_chunk_idx = self.tx_data[parent_idx as usize].chunk_idx;
        let child_chunk_idx = self.tx_data[child_idx as usize].chunk_idx;
        debug_assert_ne!(parent_chunk_idx, child_chunk_idx);
        debug_assert!(self.chunk_idxs.contains(parent_chunk_idx));
        debug_assert!(self.chunk_idxs.contains(child_chunk_idx));
        let top_info = self.set_info[parent_chunk_idx as usize];
        let bottom_info = self.set_info[child_chunk_idx as usize];

        // Any active dependency with the activated dependency's parent in its
        // top set gains the bottom part, and any with the child in its top set
        // gains the top part. Dependencies whose top set contains neither are
        // unaffected.
        for tx_idx in top_info.transactions.iter() {
            self.tx_data[tx_idx as usize].chunk_idx = child_chunk_idx;
            let active_children = self.tx_data[tx_idx as usize].active_children;
            for dep_child_idx in active_children.iter() {
                let dep_top_idx = self.dep_top(tx_idx, dep_child_idx) as usize;
                if self.set_info[dep_top_idx].transactions.contains(parent_idx) {
                    self.set_info[dep_top_idx] |= bottom_info;
                }
            }
        }
        for tx_idx in bottom_info.transactions.iter() {
            let active_children = self.tx_data[tx_idx as usize].active_children;
            for dep_child_idx in active_children.iter() {
                let dep_top_idx = self.dep_top(tx_idx, dep_child_idx) as usize;
                if self.set_info[dep_top_idx].transactions.contains(child_idx) {
                    self.set_info[dep_top_idx] |= top_info;
                }
            }
        }

        // Merge the two chunk infos into the child chunk's slot.
        let mut merged_info = bottom_info;
        merged_info |= top_info;
        self.cost += u64::from(merged_info.transactions.count());
        self.set_info[child_chunk_idx as usize] = merged_info;

        // The merged chunk reaches whatever either part reached, minus itself.
        let parent_reachable = self.reachable[parent_chunk_idx as usize];
        let merged_reachable = &mut self.reachable[child_chunk_idx as usize];
        merged_reachable.up |= parent_reachable.up;
        merged_reachable.down |= parent_reachable.down;
        merged_reachable.up -= merged_info.transactions;
        merged_reachable.down -= merged_info.transactions;

        // The parent chunk's slot becomes the new dependency's top set.
        self.set_dep_top(parent_idx, child_idx, parent_chunk_idx);
        self.tx_data[parent_idx as usize].active_children.set(child_idx);
        self.chunk_idxs.reset(parent_chunk_idx);
        child_chunk_idx
    }

    /// Deactivate the active dependency from `parent_idx` to `child_idx`,
    /// splitting its chunk. Returns the set indexes of the resulting
    /// (parent-side, child-side) chunks.
    fn deactivate(
        &mut self,
        parent_idx: DepGraphIndex,
        child_idx: DepGraphIndex,
    ) -> (SetIdx, SetIdx) {
        debug_assert!(self.tx_data[parent_idx as usize].children.contains(child_idx));
        debug_assert!(self.tx_data[parent_idx as usize].active_children.contains(child_idx));
        // The dependency's top set becomes the parent chunk; the remainder of
        // the current chunk becomes the child chunk.
        let parent_chunk_idx = self.dep_top(parent_idx, child_idx);
        let child_chunk_idx = self.tx_data[parent_idx as usize].chunk_idx;
        debug_assert_ne!(parent_chunk_idx, child_chunk_idx);
        debug_assert!(self.chunk_idxs.contains(child_chunk_idx));
        debug_assert!(!self.chunk_idxs.contains(parent_chunk_idx));

        self.tx_data[parent_idx as usize].active_children.reset(child_idx);
        self.chunk_idxs.set(parent_chunk_idx);
        self.cost += u64::from(self.set_info[child_chunk_idx as usize].transactions.count());

        let top_info = self.set_info[parent_chunk_idx as usize];
        let mut bottom_info = self.set_info[child_chunk_idx as usize];
        bottom_info -= top_info;
        self.set_info[child_chunk_idx as usize] = bottom_info;

        // Mirror image of the updates in activate(): remove the split-off part
        // from the top sets that contained it. Aggregate the parents/children
        // of both halves along the way, to recompute their reachable sets.
        let mut top_parents = S::default();
        let mut top_children = S::default();
        for tx_idx in top_info.transactions.iter() {
            self.tx_data[tx_idx as usize].chunk_idx = parent_chunk_idx;
            top_parents |= self.tx_data[tx_idx as usize].parents;
            top_children |= self.tx_data[tx_idx as usize].children;
            let active_children = self.tx_data[tx_idx as usize].active_children;
            for dep_child_idx in active_children.iter() {
                let dep_top_idx = self.dep_top(tx_idx, dep_child_idx) as usize;
                if self.set_info[dep_top_idx].transactions.contains(parent_idx) {
                    self.set_info[dep_top_idx] -= bottom_info;
                }
            }
        }
        let mut bottom_parents = S::default();
        let mut bottom_children = S::default();
        for tx_idx in bottom_info.transactions.iter() {
            bottom_parents |= self.tx_data[tx_idx as usize].parents;
            bottom_children |= self.tx_data[tx_idx as usize].children;
            let active_children = self.tx_data[tx_idx as usize].active_children;
            for dep_child_idx in active_children.iter() {
                let dep_top_idx = self.dep_top(tx_idx, dep_child_idx) as usize;
                if self.set_info[dep_top_idx].transactions.contains(child_idx) {
                    self.set_info[dep_top_idx] -= top_info;
                }
            }
        }
        self.reachable[parent_chunk_idx as usize] = Reachable {
            up: top_parents - top_info.transactions,
            down: top_children - top_info.transactions,
        };
        self.reachable[child_chunk_idx as usize] = Reachable {
            up: bottom_parents - bottom_info.transactions,
            down: bottom_children - bottom_info.transactions,
        };
        (parent_chunk_idx, child_chunk_idx)
    }

    /// Merge two chunks with at least one dependency from `top_idx` to
    /// `bottom_idx`, activating a uniformly random one of those dependencies.
    /// Returns the merged chunk's set index.
    fn merge_chunks(&mut self, top_idx: SetIdx, bottom_idx: SetIdx) -> SetIdx {
        debug_assert!(self.chunk_idxs.contains(top_idx));
        debug_assert!(self.chunk_idxs.contains(bottom_idx));
        let top_txn = self.set_info[top_idx as usize].transactions;
        let bottom_txn = self.set_info[bottom_idx as usize].transactions;
        let mut num_deps: u32 = 0;
        for tx_idx in top_txn.iter() {
            num_deps += (self.tx_data[tx_idx as usize].children & bottom_txn).count();
        }
        debug_assert!(num_deps > 0);
        let mut pick = self.rng.gen_range(0..num_deps);
        for tx_idx in top_txn.iter() {
            let intersect = self.tx_data[tx_idx as usize].children & bottom_txn;
            let count = intersect.count();
            if pick < count {
                for child_idx in intersect.iter() {
                    if pick == 0 {
                        return self.activate(tx_idx, child_idx);
                    }
                    pick -= 1;
                }
                unreachable!("pick is below the intersection count");
            }
            pick -= count;
        }
        unreachable!("a dependency between the chunks must exist");
    }

    /// Find the chunk to merge `chunk_idx` with: the lowest-feerate chunk it
    /// depends on among those of lower-or-equal feerate (upward), or the
    /// highest-feerate chunk depending on it among those of higher-or-equal
    /// feerate (downward). Equal-feerate candidates are tie-broken uniformly
    /// at random.
    fn pick_merge_candidate(&mut self, chunk_idx: SetIdx, downward: bool) -> Option<SetIdx> {
        debug_assert!(self.chunk_idxs.contains(chunk_idx));
        let mut best_feerate = self.set_info[chunk_idx as usize].feerate;
        let mut best_idx = None;
        let mut best_tiebreak = 0u64;

        let reachable = self.reachable[chunk_idx as usize];
        let mut todo = if downward { reachable.down } else { reachable.up };
        let mut steps = 0;
        while todo.any() {
            steps += 1;
            // Find the chunk of some reachable transaction, and take all its
            // transactions out of the todo set at once.
            let first = todo.first().expect("todo is non-empty");
            let reached_chunk_idx = self.tx_data[first as usize].chunk_idx;
            let reached_feerate = self.set_info[reached_chunk_idx as usize].feerate;
            todo -= self.set_info[reached_chunk_idx as usize].transactions;
            let cmp = if downward {
                feerate_cmp(&best_feerate, &reached_feerate)
            } else {
                feerate_cmp(&reached_feerate, &best_feerate)
            };
            if cmp == Ordering::Greater {
                continue;
            }
            let tiebreak = self.rng.gen::<u64>();
            if cmp == Ordering::Less || tiebreak >= best_tiebreak {
                best_feerate = reached_feerate;
                best_idx = Some(reached_chunk_idx);
                best_tiebreak = tiebreak;
            }
        }
        debug_assert!(steps <= self.set_info.len());
        best_idx
    }

    /// Perform one upward or downward merge on `chunk_idx`, if a candidate
    /// exists. Returns the merged chunk's set index.
    fn merge_step(&mut self, chunk_idx: SetIdx, downward: bool) -> Option<SetIdx> {
        let merge_chunk_idx = self.pick_merge_candidate(chunk_idx, downward)?;
        let merged = if downward {
            self.merge_chunks(chunk_idx, merge_chunk_idx)
        } else {
            self.merge_chunks(merge_chunk_idx, chunk_idx)
        };
        Some(merged)
    }

    /// Merge `chunk_idx` in one direction until no candidate remains, then
    /// queue the final chunk as potentially improvable.
    fn merge_sequence(&mut self, mut chunk_idx: SetIdx, downward: bool) {
        debug_assert!(self.chunk_idxs.contains(chunk_idx));
        while let Some(merged_chunk_idx) = self.merge_step(chunk_idx, downward) {
            chunk_idx = merged_chunk_idx;
        }
        if !self.suboptimal_idxs.contains(chunk_idx) {
            self.suboptimal_idxs.set(chunk_idx);
            self.suboptimal_chunks.push_back(chunk_idx);
        }
    }

    /// Deactivate a dependency whose top set beats its chunk's feerate, then
    /// restore topology with merge sequences on the two pieces.
    fn improve(&mut self, parent_idx: DepGraphIndex, child_idx: DepGraphIndex) {
        let (parent_chunk_idx, child_chunk_idx) = self.deactivate(parent_idx, child_idx);

        // Only the two chunks from the split can violate topology, so merge
        // sequences on them suffice; no full make_topological needed.
        let parent_reachable_up = self.reachable[parent_chunk_idx as usize].up;
        let child_chunk_txn = self.set_info[child_chunk_idx as usize].transactions;
        if parent_reachable_up.overlaps(&child_chunk_txn) {
            // The top depends on the bottom through some other dependency, so
            // they merge right back (a self-merge); the roles reverse, with the
            // child side on top.
            let merged_chunk_idx = self.merge_chunks(child_chunk_idx, parent_chunk_idx);
            if !self.suboptimal_idxs.contains(merged_chunk_idx) {
                self.suboptimal_idxs.set(merged_chunk_idx);
                self.suboptimal_chunks.push_back(merged_chunk_idx);
            }
        } else {
            self.merge_sequence(parent_chunk_idx, false);
            self.merge_sequence(child_chunk_idx, true);
        }
    }

    /// Pop queue entries until one still is a chunk. Entries can go stale when
    /// a queued chunk is merged away.
    fn pick_chunk_to_optimize(&mut self) -> Option<SetIdx> {
        while let Some(chunk_idx) = self.suboptimal_chunks.pop_front() {
            debug_assert!(self.suboptimal_idxs.contains(chunk_idx));
            self.suboptimal_idxs.reset(chunk_idx);
            if self.chunk_idxs.contains(chunk_idx) {
                return Some(chunk_idx);
            }
        }
        None
    }

    /// Find a uniformly random active dependency in `chunk_idx` whose top-set
    /// feerate strictly beats the chunk's feerate, if any.
    fn pick_dependency_to_split(
        &mut self,
        chunk_idx: SetIdx,
    ) -> Option<(DepGraphIndex, DepGraphIndex)> {
        debug_assert!(self.chunk_idxs.contains(chunk_idx));
        let chunk_info = self.set_info[chunk_idx as usize];

        let mut candidate_dep = None;
        let mut candidate_tiebreak = 0u64;
        for tx_idx in chunk_info.transactions.iter() {
            let active_children = self.tx_data[tx_idx as usize].active_children;
            for child_idx in active_children.iter() {
                let dep_top_feerate = self.set_info[self.dep_top(tx_idx, child_idx) as usize].feerate;
                if feerate_cmp(&dep_top_feerate, &chunk_info.feerate) != Ordering::Greater {
                    continue;
                }
                // Among all eligible dependencies, keep the one with the
                // highest fresh random tiebreak, making the pick uniform.
                let tiebreak = self.rng.gen::<u64>();
                if tiebreak < candidate_tiebreak {
                    continue;
                }
                candidate_dep = Some((tx_idx, child_idx));
                candidate_tiebreak = tiebreak;
            }
        }
        candidate_dep
    }

    /// Load an existing linearization. Must be called directly after
    /// construction. If the linearization is topologically valid for the
    /// graph, the state ends up topological; otherwise
    /// [Self::make_topological] must still be called.
    pub fn load_linearization(&mut self, old_linearization: &[DepGraphIndex]) {
        for &tx_idx in old_linearization {
            debug_assert!(self.transaction_idxs.contains(tx_idx));
            let mut chunk_idx = self.tx_data[tx_idx as usize].chunk_idx;
            // Merge the transaction's chunk upwards as long as that succeeds.
            while let Some(merged) = self.merge_step(chunk_idx, false) {
                chunk_idx = merged;
            }
        }
    }

    /// Make the state topological. Can be called after construction or after
    /// [Self::load_linearization].
    pub fn make_topological(&mut self) {
        debug_assert!(self.suboptimal_chunks.is_empty());
        // One initial merge direction suffices: a non-topological inactive
        // dependency between two chunks is discovered when either the lower
        // chunk tries upward or the upper chunk tries downward, and every
        // chunk gets processed. Chunks resulting from merges retry in both
        // directions.
        let init_downward = self.rng.gen::<bool>();
        let mut merged_chunks = S::default();
        self.suboptimal_idxs = self.chunk_idxs;
        for chunk_idx in self.chunk_idxs.iter() {
            // Insert in uniformly random queue order.
            self.suboptimal_chunks.push_back(chunk_idx);
            let len = self.suboptimal_chunks.len();
            let j = self.rng.gen_range(0..len);
            if j != len - 1 {
                self.suboptimal_chunks.swap(j, len - 1);
            }
        }
        while let Some(chunk_idx) = self.suboptimal_chunks.pop_front() {
            debug_assert!(self.suboptimal_idxs.contains(chunk_idx));
            self.suboptimal_idxs.reset(chunk_idx);
            // Stale entry: merged away since it was queued.
            if !self.chunk_idxs.contains(chunk_idx) {
                continue;
            }
            let both_directions = merged_chunks.contains(chunk_idx);
            let flip = self.rng.gen::<bool>();
            for attempt in 0..2 {
                let downward = (attempt == 0) == flip;
                if !both_directions && downward != init_downward {
                    continue;
                }
                if let Some(result) = self.merge_step(chunk_idx, downward) {
                    if !self.suboptimal_idxs.contains(result) {
                        self.suboptimal_idxs.set(result);
                        self.suboptimal_chunks.push_back(result);
                    }
                    merged_chunks.set(result);
                    break;
                }
            }
        }
    }

    /// Queue every chunk as potentially improvable, in uniformly random
    /// order. The state must be topological.
    pub fn start_optimizing(&mut self) {
        debug_assert!(self.suboptimal_chunks.is_empty());
        self.suboptimal_idxs = self.chunk_idxs;
        for chunk_idx in self.chunk_idxs.iter() {
            self.suboptimal_chunks.push_back(chunk_idx);
            let len = self.suboptimal_chunks.len();
            let j = self.rng.gen_range(0..len);
            if j != len - 1 {
                self.suboptimal_chunks.swap(j, len - 1);
            }
        }
    }

    /// Try to improve the forest. Returns false if the state is optimal, true
    /// if more improvement attempts remain.
    pub fn optimize_step(&mut self) -> bool {
        let Some(chunk_idx) = self.pick_chunk_to_optimize() else {
            return false;
        };
        let Some((parent_idx, child_idx)) = self.pick_dependency_to_split(chunk_idx) else {
            // This chunk cannot be improved; others may remain.
            return !self.suboptimal_chunks.is_empty();
        };
        self.improve(parent_idx, child_idx);
        true
    }

    /// Queue every chunk for minimization with a random pivot transaction and
    /// direction, in uniformly random order. May only be called once the
    /// state is optimal; [Self::optimize_step] must not be called afterwards.
    pub fn start_minimizing(&mut self) {
        self.nonminimal_chunks.clear();
        for chunk_idx in self.chunk_idxs.iter() {
            let pivot_idx = self.pick_random_tx(self.set_info[chunk_idx as usize].transactions);
            let flags = u8::from(self.rng.gen::<bool>());
            self.nonminimal_chunks.push_back((chunk_idx, pivot_idx, flags));
            let len = self.nonminimal_chunks.len();
            let j = self.rng.gen_range(0..len);
            if j != len - 1 {
                self.nonminimal_chunks.swap(j, len - 1);
            }
        }
    }

    /// Try to split a chunk into equal-feerate parts. Returns false once all
    /// chunks are minimal, true if more attempts remain.
    pub fn minimize_step(&mut self) -> bool {
        let Some((chunk_idx, pivot_idx, mut flags)) = self.nonminimal_chunks.pop_front() else {
            return false;
        };
        let chunk_info = self.set_info[chunk_idx as usize];
        let move_pivot_down = flags & 1 != 0;
        let second_stage = flags & 2 != 0;

        // Find a random dependency with equal top and bottom feerates and the
        // pivot on the side it is being moved away from.
        let mut candidate_dep = (0, 0);
        let mut candidate_tiebreak = 0u64;
        let mut have_any = false;
        for tx_idx in chunk_info.transactions.iter() {
            let active_children = self.tx_data[tx_idx as usize].active_children;
            for child_idx in active_children.iter() {
                let dep_top_info = self.set_info[self.dep_top(tx_idx, child_idx) as usize];
                // The top set can never have a higher feerate than the chunk
                // here (optimize_step would have dealt with it); skip those
                // with a lower one.
                if feerate_cmp(&dep_top_info.feerate, &chunk_info.feerate) == Ordering::Less {
                    continue;
                }
                have_any = true;
                if move_pivot_down == dep_top_info.transactions.contains(pivot_idx) {
                    continue;
                }
                let tiebreak = self.rng.gen::<u64>() | 1;
                if tiebreak > candidate_tiebreak {
                    candidate_tiebreak = tiebreak;
                    candidate_dep = (tx_idx, child_idx);
                }
            }
        }
        // No dependency with equal top and bottom feerates at all: the chunk
        // is minimal, drop it.
        if !have_any {
            return true;
        }
        // Equal-feerate dependencies exist, but all have the pivot on the
        // wrong side: retry with the other direction, unless that was already
        // tried.
        if candidate_tiebreak == 0 {
            flags ^= 3;
            if !second_stage {
                self.nonminimal_chunks.push_back((chunk_idx, pivot_idx, flags));
            }
            return true;
        }

        let (parent_chunk_idx, child_chunk_idx) = self.deactivate(candidate_dep.0, candidate_dep.1);
        let parent_reachable_up = self.reachable[parent_chunk_idx as usize].up;
        let child_chunk_txn = self.set_info[child_chunk_idx as usize].transactions;
        if parent_reachable_up.overlaps(&child_chunk_txn) {
            // Self-merge: the dependency activated runs opposite to the one
            // deactivated, so the child side is the top. Requeue the merged
            // chunk with the same pivot and direction.
            let merged_chunk_idx = self.merge_chunks(child_chunk_idx, parent_chunk_idx);
            self.nonminimal_chunks.push_back((merged_chunk_idx, pivot_idx, flags));
        } else {
            // A genuine split. The half with the pivot keeps it, along with
            // the direction flags (including the second-stage bit: a split
            // with the pivot on the other side is already known impossible).
            // The other half gets a fresh random pivot and direction, and the
            // two queue entries are swapped with probability 1/2.
            if move_pivot_down {
                let parent_pivot_idx =
                    self.pick_random_tx(self.set_info[parent_chunk_idx as usize].transactions);
                let parent_flags = u8::from(self.rng.gen::<bool>());
                self.nonminimal_chunks.push_back((parent_chunk_idx, parent_pivot_idx, parent_flags));
                self.nonminimal_chunks.push_back((child_chunk_idx, pivot_idx, flags));
            } else {
                let child_pivot_idx =
                    self.pick_random_tx(self.set_info[child_chunk_idx as usize].transactions);
                let child_flags = u8::from(self.rng.gen::<bool>());
                self.nonminimal_chunks.push_back((parent_chunk_idx, pivot_idx, flags));
                self.nonminimal_chunks.push_back((child_chunk_idx, child_pivot_idx, child_flags));
            }
            if self.rng.gen::<bool>() {
                let len = self.nonminimal_chunks.len();
                self.nonminimal_chunks.swap(len - 1, len - 2);
            }
        }
        true
    }

    /// Produce a topologically valid linearization from the current state,
    /// which must be topological.
    ///
    /// Chunks are emitted in order of: topology, then highest feerate, then
    /// smallest size, then the chunk whose maximum transaction under
    /// `fallback_order` is smallest. Within a chunk, transactions follow:
    /// topology, then highest feerate, then smallest size, then smallest by
    /// `fallback_order`.
    ///
    /// `fallback_order` must be a strict total order on the cluster's
    /// positions; given that, the output is fully deterministic.
    pub fn get_linearization<F>(&self, fallback_order: F) -> Vec<DepGraphIndex>
    where
        F: Fn(DepGraphIndex, DepGraphIndex) -> Ordering,
    {
        let mut ret = Vec::with_capacity(self.set_info.len());
        // Unmet out-of-chunk dependency counts per chunk, and unmet parent
        // counts per transaction.
        let mut chunk_deps = vec![0u32; self.set_info.len()];
        let mut tx_deps = vec![0u32; self.tx_data.len()];
        for chl_idx in self.transaction_idxs.iter() {
            let chl_data = &self.tx_data[chl_idx as usize];
            tx_deps[chl_idx as usize] = chl_data.parents.count();
            let chl_chunk_txn = self.set_info[chl_data.chunk_idx as usize].transactions;
            chunk_deps[chl_data.chunk_idx as usize] += (chl_data.parents - chl_chunk_txn).count();
        }

        let max_fallback = |chunk_idx: SetIdx| -> DepGraphIndex {
            let mut iter = self.set_info[chunk_idx as usize].transactions.iter();
            let mut ret = iter.next().expect("chunks are never empty");
            for tx_idx in iter {
                if fallback_order(tx_idx, ret) == Ordering::Greater {
                    ret = tx_idx;
                }
            }
            ret
        };

        // Whether chunk `a` must be emitted before chunk `b`, among chunks
        // with no unmet dependencies. Entries are (chunk set index, its
        // maximum transaction by fallback_order).
        let chunk_before = |a: &(SetIdx, DepGraphIndex), b: &(SetIdx, DepGraphIndex)| -> bool {
            let a_feerate = self.set_info[a.0 as usize].feerate;
            let b_feerate = self.set_info[b.0 as usize].feerate;
            match feerate_cmp(&a_feerate, &b_feerate) {
                Ordering::Greater => true,
                Ordering::Less => false,
                Ordering::Equal => {
                    if a_feerate.size != b_feerate.size {
                        a_feerate.size < b_feerate.size
                    } else {
                        fallback_order(a.1, b.1) == Ordering::Less
                    }
                }
            }
        };
        // Whether transaction `a` must be emitted before transaction `b`.
        let tx_before = |a: DepGraphIndex, b: DepGraphIndex| -> bool {
            let a_feerate = self.depgraph.feerate(a);
            let b_feerate = self.depgraph.feerate(b);
            match feerate_cmp(&a_feerate, &b_feerate) {
                Ordering::Greater => true,
                Ordering::Less => false,
                Ordering::Equal => {
                    if a_feerate.size != b_feerate.size {
                        a_feerate.size < b_feerate.size
                    } else {
                        fallback_order(a, b) == Ordering::Less
                    }
                }
            }
        };

        // All chunks with no out-of-chunk dependencies are ready.
        let mut ready_chunks: Vec<(SetIdx, DepGraphIndex)> = self
            .chunk_idxs
            .iter()
            .filter(|&chunk_idx| chunk_deps[chunk_idx as usize] == 0)
            .map(|chunk_idx| (chunk_idx, max_fallback(chunk_idx)))
            .collect();
        let mut ready_tx: Vec<DepGraphIndex> = Vec::new();

        while !ready_chunks.is_empty() {
            // Emit the best ready chunk.
            let mut best = 0;
            for i in 1..ready_chunks.len() {
                if chunk_before(&ready_chunks[i], &ready_chunks[best]) {
                    best = i;
                }
            }
            let (chunk_idx, _) = ready_chunks.swap_remove(best);
            debug_assert_eq!(chunk_deps[chunk_idx as usize], 0);
            let chunk_txn = self.set_info[chunk_idx as usize].transactions;

            debug_assert!(ready_tx.is_empty());
            ready_tx.extend(chunk_txn.iter().filter(|&tx_idx| tx_deps[tx_idx as usize] == 0));
            debug_assert!(!ready_tx.is_empty());
            while !ready_tx.is_empty() {
                let mut best = 0;
                for i in 1..ready_tx.len() {
                    if tx_before(ready_tx[i], ready_tx[best]) {
                        best = i;
                    }
                }
                let tx_idx = ready_tx.swap_remove(best);
                ret.push(tx_idx);
                // Release the emitted transaction's children, both within the
                // chunk and across chunks.
                for chl_idx in self.tx_data[tx_idx as usize].children.iter() {
                    debug_assert!(tx_deps[chl_idx as usize] > 0);
                    tx_deps[chl_idx as usize] -= 1;
                    if tx_deps[chl_idx as usize] == 0 && chunk_txn.contains(chl_idx) {
                        ready_tx.push(chl_idx);
                    }
                    let chl_chunk_idx = self.tx_data[chl_idx as usize].chunk_idx;
                    if chl_chunk_idx != chunk_idx {
                        debug_assert!(chunk_deps[chl_chunk_idx as usize] > 0);
                        chunk_deps[chl_chunk_idx as usize] -= 1;
                        if chunk_deps[chl_chunk_idx as usize] == 0 {
                            ready_chunks.push((chl_chunk_idx, max_fallback(chl_chunk_idx)));
                        }
                    }
                }
            }
        }
        debug_assert_eq!(ret.len(), self.set_info.len());
        ret
    }

    /// The feerates of the current chunks, highest first. The linearization
    /// produced by [Self::get_linearization] is always at least as good as
    /// this diagram; once the state is optimal they are equivalent.
    pub fn diagram(&self) -> Vec<FeeFrac> {
        let mut ret: Vec<FeeFrac> =
            self.chunk_idxs.iter().map(|chunk_idx| self.set_info[chunk_idx as usize].feerate).collect();
        ret.sort_unstable_by(|a, b| {
            feerate_cmp(b, a).then_with(|| b.fee.cmp(&a.fee)).then_with(|| a.size.cmp(&b.size))
        });
        ret
    }
}
