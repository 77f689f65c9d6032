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

//! A cursor that pulls bits off of a key's hash stream, one `advance(n)` at
//! a time, re-seeding with the next segment whenever the current 64-bit
//! word runs dry.

use std::hash::Hash;

use crate::hash::SegmentHasher;

pub(crate) struct Cursor<'k, K: ?Sized, H> {
    key: &'k K,
    hasher: &'k H,
    segment: u64,
    word: u64,
    bits_alive: u32,
    bits_consumed: u64,
}

impl<'k, K: Hash + ?Sized, H: SegmentHasher> Cursor<'k, K, H> {
    pub fn new(key: &'k K, hasher: &'k H) -> Self {
        let word = hasher.hash_segment(key, 0);
        Self {
            key,
            hasher,
            segment: 0,
            word,
            bits_alive: 64,
            bits_consumed: 0,
        }
    }

    pub fn bits_consumed(&self) -> u64 {
        self.bits_consumed
    }

    /// Pull `n` bits (`n <= 64`) off of the stream, re-seeding across
    /// segment boundaries as needed, and return them right-aligned.
    pub fn advance(&mut self, n: u32) -> u64 {
        debug_assert!(n <= 64);
        let mut result: u64 = 0;
        let mut got: u32 = 0;
        while got < n {
            if self.bits_alive == 0 {
                self.segment += 1;
                self.word = self.hasher.hash_segment(self.key, self.segment);
                self.bits_alive = 64;
            }
            let take = (n - got).min(self.bits_alive);
            let bits = if take == 64 {
                self.word
            } else {
                self.word & ((1u64 << take) - 1)
            };
            result |= bits << got;
            if take == 64 {
                self.word = 0;
            } else {
                self.word >>= take;
            }
            self.bits_alive -= take;
            self.bits_consumed += take as u64;
            got += take;
        }
        result
    }
}

/// Compute the `skip`-th bit of `key`'s own hash stream (skip bits, then
/// take one), without disturbing any caller's cursor. Used to decide which
/// child of a freshly split cell an evicted leaf belongs in.
pub(crate) fn nth_bit<K: Hash + ?Sized, H: SegmentHasher>(hasher: &H, key: &K, skip: u64) -> u64 {
    let mut c = Cursor::new(key, hasher);
    let mut remaining = skip;
    while remaining > 0 {
        let take = remaining.min(64) as u32;
        c.advance(take);
        remaining -= take as u64;
    }
    c.advance(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::DefaultSegmentHasher;

    #[test]
    fn advance_crosses_segment_boundary() {
        let hasher = DefaultSegmentHasher::<std::collections::hash_map::RandomState>::default();
        let mut c = Cursor::new(&"boundary-key", &hasher);
        let first = c.advance(60);
        assert!(first < (1u64 << 60));
        let second = c.advance(10); // forces a re-seed mid-pull
        assert!(second < (1u64 << 10));
        assert_eq!(c.bits_consumed(), 70);
    }

    #[test]
    fn nth_bit_is_deterministic() {
        let hasher = DefaultSegmentHasher::<std::collections::hash_map::RandomState>::default();
        let a = nth_bit(&hasher, &"k", 5);
        let b = nth_bit(&hasher, &"k", 5);
        assert_eq!(a, b);
        assert!(a == 0 || a == 1);
    }
}
