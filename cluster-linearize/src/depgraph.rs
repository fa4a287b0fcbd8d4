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

//! The transaction dependency graph.
//!
//! [DepGraph] does not store edges. For every transaction it stores the full
//! ancestor and descendant closures (each including the transaction itself),
//! and every mutation maintains them. Direct parents/children are recovered on
//! demand via [DepGraph::reduced_parents] / [DepGraph::reduced_children].

use crate::bitset::TxSet;
use crate::feefrac::FeeFrac;

/// Index of a transaction position within a [DepGraph] and the cluster it
/// represents.
pub type DepGraphIndex = u32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Entry<S> {
    /// Fee and size of the transaction itself.
    feerate: FeeFrac,
    /// All ancestors of the transaction, including itself.
    ancestors: S,
    /// All descendants of the transaction, including itself.
    descendants: S,
}

/// A transaction graph holding, for every transaction, its feerate and its
/// ancestor/descendant closures.
///
/// Positions of removed transactions become holes whose stale data is ignored
/// until [DepGraph::add_transaction] reuses them.
#[derive(Clone, Debug, Default)]
pub struct DepGraph<S> {
    /// Data for each position, including holes.
    entries: Vec<Entry<S>>,
    /// Which positions are in use.
    used: S,
}

impl<S: TxSet> PartialEq for DepGraph<S> {
    fn eq(&self, other: &Self) -> bool {
        // Holes carry stale data, so only used positions participate.
        self.used == other.used
            && self.used.iter().all(|i| self.entries[i as usize] == other.entries[i as usize])
    }
}

impl<S: TxSet> Eq for DepGraph<S> {}

impl<S: TxSet> DepGraph<S> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            used: S::default(),
        }
    }

    /// Build a DepGraph from an existing one, with positions renumbered.
    ///
    /// `mapping[i]` gives the position in the new graph for position `i` in
    /// the old one; its length must equal `other.position_range()` and its
    /// values at used positions must be distinct and below `pos_range`.
    /// `pos_range` must leave no trailing holes (it equals the largest mapped
    /// position plus one, or 0 for an empty graph).
    ///
    /// Complexity: O(N^2) where N is the transaction count.
    pub fn from_remapped(
        other: &DepGraph<S>,
        mapping: &[DepGraphIndex],
        pos_range: DepGraphIndex,
    ) -> Self {
        debug_assert_eq!(mapping.len(), other.position_range() as usize);
        debug_assert_eq!(pos_range == 0, other.tx_count() == 0);
        let mut ret = Self {
            entries: vec![Entry::default(); pos_range as usize],
            used: S::default(),
        };
        for i in other.positions().iter() {
            let new_idx = mapping[i as usize];
            debug_assert!(new_idx < pos_range);
            let entry = &mut ret.entries[new_idx as usize];
            entry.ancestors = S::singleton(new_idx);
            entry.descendants = S::singleton(new_idx);
            entry.feerate = other.feerate(i);
            ret.used.set(new_idx);
        }
        for i in other.positions().iter() {
            let mut parents = S::default();
            for j in other.reduced_parents(i).iter() {
                parents.set(mapping[j as usize]);
            }
            ret.add_dependencies(parents, mapping[i as usize]);
        }
        debug_assert_eq!(ret.used.last().map_or(0, |last| last + 1), pos_range);
        ret
    }

    /// The set of positions in use.
    pub fn positions(&self) -> S {
        self.used
    }

    /// The exclusive upper bound on used positions.
    pub fn position_range(&self) -> DepGraphIndex {
        self.entries.len() as DepGraphIndex
    }

    /// The number of transactions in the graph.
    pub fn tx_count(&self) -> u32 {
        self.used.count()
    }

    /// The feerate of transaction `i`.
    pub fn feerate(&self, i: DepGraphIndex) -> FeeFrac {
        debug_assert!(self.used.contains(i));
        self.entries[i as usize].feerate
    }

    /// Mutable access to the feerate of transaction `i`. Feerates do not
    /// participate in the closure bookkeeping, so this cannot violate any
    /// graph invariant.
    pub fn feerate_mut(&mut self, i: DepGraphIndex) -> &mut FeeFrac {
        debug_assert!(self.used.contains(i));
        &mut self.entries[i as usize].feerate
    }

    /// The ancestor closure of transaction `i`, including `i` itself.
    pub fn ancestors(&self, i: DepGraphIndex) -> S {
        debug_assert!(self.used.contains(i));
        self.entries[i as usize].ancestors
    }

    /// The descendant closure of transaction `i`, including `i` itself.
    pub fn descendants(&self, i: DepGraphIndex) -> S {
        debug_assert!(self.used.contains(i));
        self.entries[i as usize].descendants
    }

    /// Add a new transaction with no dependencies, in the lowest unused
    /// position, and return that position. Amortized O(1).
    pub fn add_transaction(&mut self, feerate: FeeFrac) -> DepGraphIndex {
        let available = S::fill(S::CAPACITY) - self.used;
        let new_idx = available.first().expect("graph capacity exhausted");
        let entry = Entry {
            feerate,
            ancestors: S::singleton(new_idx),
            descendants: S::singleton(new_idx),
        };
        if new_idx as usize == self.entries.len() {
            self.entries.push(entry);
        } else {
            self.entries[new_idx as usize] = entry;
        }
        self.used.set(new_idx);
        new_idx
    }

    /// Remove the given positions from the graph.
    ///
    /// The removed positions become holes, and dependencies involving them
    /// disappear. Because only closures are tracked, removing a transaction
    /// whose parent and child both survive leaves the parent an ancestor of
    /// the child; closures are masked, never recomputed.
    ///
    /// Complexity: O(N).
    pub fn remove_transactions(&mut self, del: S) {
        self.used -= del;
        // Drop now-unused trailing entries.
        while self
            .entries
            .len()
            .checked_sub(1)
            .is_some_and(|last| !self.used.contains(last as DepGraphIndex))
        {
            self.entries.pop();
        }
        // Mask the closures of the survivors. Holes keep stale data, which is
        // overwritten when the position is reused.
        for entry in self.entries.iter_mut() {
            entry.ancestors &= self.used;
            entry.descendants &= self.used;
        }
    }

    /// Make every transaction in `parents` a parent of `child`, updating all
    /// affected closures. Complexity: O(N).
    pub fn add_dependencies(&mut self, parents: S, child: DepGraphIndex) {
        debug_assert!(self.used.contains(child));
        debug_assert!(parents.is_subset_of(&self.used));
        // Gather the ancestors of the new parents that aren't ancestors of the
        // child already.
        let child_ancestors = self.ancestors(child);
        let mut par_anc = S::default();
        for par in (parents - child_ancestors).iter() {
            par_anc |= self.ancestors(par);
        }
        par_anc -= child_ancestors;
        if par_anc.none() {
            return;
        }
        // Each of those gains the child's descendants, and vice versa.
        let child_descendants = self.descendants(child);
        for anc_of_par in par_anc.iter() {
            self.entries[anc_of_par as usize].descendants |= child_descendants;
        }
        for desc_of_child in child_descendants.iter() {
            self.entries[desc_of_child as usize].ancestors |= par_anc;
        }
    }

    /// The minimal set of parents of `i` whose combined ancestry equals the
    /// full ancestor closure of `i`. Complexity: O(N).
    pub fn reduced_parents(&self, i: DepGraphIndex) -> S {
        let mut parents = self.ancestors(i);
        parents.reset(i);
        for parent in parents.iter() {
            if parents.contains(parent) {
                parents -= self.ancestors(parent);
                parents.set(parent);
            }
        }
        parents
    }

    /// The minimal set of children of `i` whose combined descendancy equals
    /// the full descendant closure of `i`. Complexity: O(N).
    pub fn reduced_children(&self, i: DepGraphIndex) -> S {
        let mut children = self.descendants(i);
        children.reset(i);
        for child in children.iter() {
            if children.contains(child) {
                children -= self.descendants(child);
                children.set(child);
            }
        }
        children
    }

    /// The aggregate feerate of a set of transactions. Complexity: O(|elems|).
    pub fn combined_feerate(&self, elems: S) -> FeeFrac {
        let mut ret = FeeFrac::default();
        for pos in elems.iter() {
            ret += self.entries[pos as usize].feerate;
        }
        ret
    }

    /// The connected component within `todo` that contains `tx`.
    ///
    /// Connectivity runs through ancestor/descendant relations in the whole
    /// graph, so a transaction and its grandparent are connected even when
    /// `todo` misses the parent between them. Complexity: O(result count).
    pub fn get_connected_component(&self, todo: S, tx: DepGraphIndex) -> S {
        debug_assert!(todo.contains(tx));
        debug_assert!(todo.is_subset_of(&self.used));
        let mut to_add = S::singleton(tx);
        let mut ret = S::default();
        loop {
            let old = ret;
            for add in to_add.iter() {
                ret |= self.descendants(add);
                ret |= self.ancestors(add);
            }
            ret &= todo;
            to_add = ret - old;
            if to_add.none() {
                break;
            }
        }
        ret
    }

    /// The connected component within `todo` containing its first transaction,
    /// or the empty set if `todo` is empty.
    pub fn find_connected_component(&self, todo: S) -> S {
        match todo.first() {
            None => todo,
            Some(tx) => self.get_connected_component(todo, tx),
        }
    }

    /// Whether `subset` forms a single connected component.
    pub fn is_connected_set(&self, subset: S) -> bool {
        self.find_connected_component(subset) == subset
    }

    /// Whether the entire graph is connected.
    pub fn is_connected(&self) -> bool {
        self.is_connected_set(self.used)
    }

    /// Append the elements of `select` to `list` in a topologically valid
    /// order: ancestor-count ascending, position ascending. An ancestor always
    /// has a strictly smaller closure than its descendant, so this order never
    /// puts a child before a parent.
    pub fn append_topo(&self, list: &mut Vec<DepGraphIndex>, select: S) {
        let old_len = list.len();
        list.extend(select.iter());
        list[old_len..].sort_unstable_by(|&a, &b| {
            let a_anc_count = self.entries[a as usize].ancestors.count();
            let b_anc_count = self.entries[b as usize].ancestors.count();
            a_anc_count.cmp(&b_anc_count).then(a.cmp(&b))
        });
    }

    /// Whether the graph is acyclic (every closure pair intersects in exactly
    /// the transaction itself).
    pub fn is_acyclic(&self) -> bool {
        self.used.iter().all(|i| (self.ancestors(i) & self.descendants(i)) == S::singleton(i))
    }

    /// The total number of (reduced) dependencies in the graph.
    pub fn dependency_count(&self) -> u32 {
        self.used.iter().map(|i| self.reduced_parents(i).count()).sum()
    }
}

/// A set of transactions together with their aggregate feerate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetInfo<S> {
    /// The transactions in the set.
    pub transactions: S,
    /// Their combined fee and size.
    pub feerate: FeeFrac,
}

impl<S: TxSet> SetInfo<S> {
    pub fn new(transactions: S, feerate: FeeFrac) -> Self {
        Self {
            transactions,
            feerate,
        }
    }

    /// A singleton SetInfo for one transaction of a graph.
    pub fn from_tx(depgraph: &DepGraph<S>, pos: DepGraphIndex) -> Self {
        Self {
            transactions: S::singleton(pos),
            feerate: depgraph.feerate(pos),
        }
    }

    /// A SetInfo for a set of transactions of a graph.
    pub fn from_set(depgraph: &DepGraph<S>, transactions: S) -> Self {
        Self {
            transactions,
            feerate: depgraph.combined_feerate(transactions),
        }
    }

    /// Add a transaction (not yet in the set).
    pub fn insert(&mut self, depgraph: &DepGraph<S>, pos: DepGraphIndex) {
        debug_assert!(!self.transactions.contains(pos));
        self.transactions.set(pos);
        self.feerate += depgraph.feerate(pos);
    }
}

impl<S: TxSet> std::ops::BitOrAssign for SetInfo<S> {
    /// Merge `rhs` into `self`; the sets must be disjoint.
    fn bitor_assign(&mut self, rhs: Self) {
        debug_assert!(!self.transactions.overlaps(&rhs.transactions));
        self.transactions |= rhs.transactions;
        self.feerate += rhs.feerate;
    }
}

impl<S: TxSet> std::ops::SubAssign for SetInfo<S> {
    /// Remove `rhs` from `self`; `rhs` must be a subset.
    fn sub_assign(&mut self, rhs: Self) {
        debug_assert!(rhs.transactions.is_subset_of(&self.transactions));
        self.transactions -= rhs.transactions;
        self.feerate -= rhs.feerate;
    }
}

impl<S: TxSet> std::ops::Sub for SetInfo<S> {
    type Output = Self;
    fn sub(mut self, rhs: Self) -> Self {
        self -= rhs;
        self
    }
}
