/*
 * This file is part of SinkTree.
 *
 * SinkTree is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! The hasher seam: turns a key plus a "segment index" into a 64-bit word.
//!
//! The trie consumes a key's hash one bit at a time. A single 64-bit hash
//! word is only good for 64 bits of descent; past that, the cursor asks this
//! trait for a fresh word seeded with the next segment index, so a run of
//! colliding prefixes doesn't turn into an infinite descent on a fixed word.

use std::hash::{BuildHasher, Hash, Hasher};

const PRIME64: u64 = 0x517CC1B727220A95; // archimedes
const ROTATE: u32 = 5;

fn mix(state: u64, word: u64) -> u64 {
    (state.rotate_left(ROTATE) ^ word).wrapping_mul(PRIME64)
}

/// Murmur-style finalizer: spreads the bits of a mixed state so that nearby
/// inputs don't produce nearby outputs.
fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51afd7ed558ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ceb9fe1a85ec53);
    k ^= k >> 33;
    k
}

/// `H(key, segment_index) -> u64`. Implementations must be deterministic:
/// the same `(key, segment)` pair always produces the same word, and
/// distinct segment indices should behave as effectively independent
/// re-seedings of the same key.
pub trait SegmentHasher {
    fn hash_segment<K: Hash + ?Sized>(&self, key: &K, segment: u64) -> u64;
}

/// The default segment hasher: seeds a [`std::hash::Hasher`] with the
/// segment index before folding in the key's own `Hash` impl, then runs the
/// combined state through a murmur3-style finalizer.
#[derive(Debug, Clone, Default)]
pub struct DefaultSegmentHasher<S = std::collections::hash_map::RandomState> {
    build: S,
}

impl<S> DefaultSegmentHasher<S> {
    pub fn with_build_hasher(build: S) -> Self {
        Self { build }
    }
}

impl<S: BuildHasher> SegmentHasher for DefaultSegmentHasher<S> {
    fn hash_segment<K: Hash + ?Sized>(&self, key: &K, segment: u64) -> u64 {
        let mut hasher = self.build.build_hasher();
        segment.hash(&mut hasher);
        key.hash(&mut hasher);
        let state = hasher.finish();
        fmix64(mix(state, segment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_segments_diverge() {
        let h = DefaultSegmentHasher::<std::collections::hash_map::RandomState>::default();
        let a = h.hash_segment(&"same-key", 0);
        let b = h.hash_segment(&"same-key", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn deterministic_for_fixed_build_hasher() {
        struct FixedState;
        impl BuildHasher for FixedState {
            type Hasher = std::collections::hash_map::DefaultHasher;
            fn build_hasher(&self) -> Self::Hasher {
                std::collections::hash_map::DefaultHasher::new()
            }
        }
        let h = DefaultSegmentHasher::with_build_hasher(FixedState);
        let a = h.hash_segment(&42u64, 3);
        let b = h.hash_segment(&42u64, 3);
        assert_eq!(a, b);
    }
}
