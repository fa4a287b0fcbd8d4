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

//! Facade over the `rand` ecosystem, so that the rest of the workspace never
//! depends on `rand` directly.

pub use rand::prelude::SliceRandom;
pub use rand::{seq, CryptoRng, Rng, RngCore, SeedableRng};

pub mod rngs {
    pub use rand::rngs::{OsRng, SmallRng};
}

/// A cryptographically secure RNG seeded from OS entropy.
#[must_use]
pub fn make_true_rng() -> impl rand::Rng + rand::CryptoRng {
    use rand::SeedableRng as _;
    rand::rngs::StdRng::from_entropy()
}

/// A fast non-cryptographic RNG seeded from OS entropy.
#[must_use]
pub fn make_pseudo_rng() -> impl rand::Rng {
    rand::rngs::ThreadRng::default()
}

/// A fast non-cryptographic RNG with a caller-controlled seed.
///
/// Same seed produces the same number stream, which is what makes seeded
/// algorithms reproducible. Never use this where unpredictability matters.
#[must_use]
pub fn make_deterministic_rng(seed: u64) -> rngs::SmallRng {
    use rand::SeedableRng as _;
    rngs::SmallRng::seed_from_u64(seed)
}
