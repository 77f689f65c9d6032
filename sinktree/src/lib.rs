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

//! A concurrent, lock-free, unordered key -> value map backed by a binary
//! hash-trie with its own hazard-pointer reclamation engine.
//!
//! `Put`, `Get` and `Erase` all run without taking a coarse lock; the trie's
//! root grows its fan-out on demand (`sink`) as deeper layers fill up, so
//! lookups stay shallow without ever needing a blocking resize.

mod error;
mod hash;
mod hazard;
mod trie;

pub use error::{HazardError, HazardResult};
pub use hash::{DefaultSegmentHasher, SegmentHasher};
pub use trie::SinkTree;
