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

//! Cluster linearization: given a DAG of transactions with fees and sizes,
//! produce a topologically valid total order that is optimal (or close to it)
//! in the convexified feerate diagram sense.
//!
//! The main entry points are:
//! - [DepGraph]: the dependency graph, tracking per-transaction feerates and
//!   transitively-closed ancestor/descendant sets.
//! - [linearize]: computes a linearization for a graph under an iteration
//!   budget, optionally improving an existing one.
//! - [post_linearize]: a cheap two-pass improver for existing linearizations.
//! - [chunk_linearization]: computes the feerate-monotone chunks of a
//!   linearization, the object through which linearizations are compared.
//!
//! Everything is deterministic given the inputs and the caller-supplied seed.

pub mod bitset;
pub mod chunking;
pub mod depgraph;
pub mod feefrac;
pub mod linearize;
pub mod postlinearize;
pub mod spanning_forest;

pub use bitset::{BitSet, BitSet128, BitSet256, BitSet64, TxSet};
pub use chunking::{chunk_linearization, chunk_linearization_info, compare_chunks};
pub use depgraph::{DepGraph, DepGraphIndex, SetInfo};
pub use feefrac::{feerate_cmp, FeeFrac};
pub use linearize::{index_tx_order, linearize, LinearizeResult};
pub use postlinearize::post_linearize;
pub use spanning_forest::SpanningForestState;

#[cfg(test)]
mod tests;
