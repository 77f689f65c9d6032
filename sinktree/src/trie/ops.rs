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

use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::cursor::{nth_bit, Cursor};
use super::node::{self, Cell, Leaf};
use super::SinkTree;
use crate::hash::SegmentHasher;

unsafe fn drop_leaf<K, V>(addr: usize) {
    drop(Box::from_raw(addr as *mut Leaf<K, V>));
}

/// What the writer is currently trying to publish into `slot`. Every field
/// is a raw pointer, so this is `Copy`: matching it in the CAS-retry loop
/// below must never move it out from under the next iteration.
///
/// `Copy`/`Clone` are implemented by hand rather than derived: `derive`
/// would add `K: Copy, V: Copy` bounds even though every field here is a
/// raw pointer, which is `Copy` regardless of its pointee type.
enum Intent<K, V> {
    /// A plain leaf, ready to be CAS'd into whatever slot we land on.
    Leaf(*mut Leaf<K, V>),
    /// A freshly allocated cell (with the evicted leaf pre-placed in one
    /// child) that still needs to win the CAS replacing `expected_old`.
    /// `second` is the original desired leaf, buffered until the cell is
    /// published.
    Cell {
        cell: *mut Cell<K, V>,
        expected_old: *mut Leaf<K, V>,
        second: *mut Leaf<K, V>,
    },
}

impl<K, V> Clone for Intent<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for Intent<K, V> {}

impl<K, V, H, const P: usize, const MAX_THREADS: usize> SinkTree<K, V, H, P, MAX_THREADS>
where
    K: Hash + Eq,
    H: SegmentHasher,
{
    /// Insert `key -> value` if `key` is not already present. Returns `true`
    /// if inserted, `false` if `key` was already present (the existing
    /// mapping is left untouched).
    pub fn put(&self, key: K, value: V) -> bool {
        let thread_slot = self.thread_slot();
        let leaf_ptr: *mut Leaf<K, V> = Box::into_raw(Box::new(Leaf { key, value }));
        // Safe: we still own `leaf_ptr` outright, so borrowing its key for
        // the traversal cursor is fine even though `key` itself was moved.
        let key_ref: &K = unsafe { &(*leaf_ptr).key };
        let mut cursor = Cursor::new(key_ref, &self.hasher);
        self.put_inner(thread_slot, leaf_ptr, &mut cursor)
    }

    fn put_inner(
        &self,
        thread_slot: usize,
        leaf_ptr: *mut Leaf<K, V>,
        cursor: &mut Cursor<'_, K, H>,
    ) -> bool {
        let root = self.root();
        let mut slot: &AtomicUsize = &root.slots[cursor.advance(root.bit_count) as usize];
        let mut intent = Intent::Leaf(leaf_ptr);

        loop {
            match intent {
                Intent::Cell {
                    cell,
                    expected_old,
                    second,
                } => {
                    let desired = node::tag_cell(cell);
                    match slot.compare_exchange(
                        expected_old as usize,
                        desired,
                        Ordering::Release,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            // linking CAS succeeded: this cell now sits at
                            // the depth the cursor had consumed *before*
                            // descending into it
                            self.note_cell_linked(cursor.bits_consumed());
                            let cell_ref = unsafe { &*cell };
                            let bit = cursor.advance(1);
                            slot = &cell_ref.children[bit as usize];
                            intent = Intent::Leaf(second);
                        }
                        Err(_actual) => {
                            // lost the race: discard the unpublished cell,
                            // the evicted leaf inside it was never retired
                            drop(unsafe { Box::from_raw(cell) });
                            intent = Intent::Leaf(second);
                        }
                    }
                }
                Intent::Leaf(want) => {
                    let raw = slot.load(Ordering::Acquire);
                    if raw == 0 {
                        match slot.compare_exchange(
                            0,
                            node::leaf_word(want),
                            Ordering::Release,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => return true,
                            Err(_) => continue,
                        }
                    } else if node::is_cell(raw) {
                        let cell = unsafe { &*(node::cell_addr(raw) as *mut Cell<K, V>) };
                        let bit = cursor.advance(1);
                        slot = &cell.children[bit as usize];
                    } else {
                        let protected = self.domain.protect(thread_slot, 0, slot);
                        if protected == 0 {
                            self.domain.clear(thread_slot, 0);
                            continue;
                        }
                        if node::is_cell(protected) {
                            self.domain.clear(thread_slot, 0);
                            let cell =
                                unsafe { &*(node::cell_addr(protected) as *mut Cell<K, V>) };
                            let bit = cursor.advance(1);
                            slot = &cell.children[bit as usize];
                            continue;
                        }
                        let existing = protected as *mut Leaf<K, V>;
                        let existing_ref = unsafe { &*existing };
                        let want_ref = unsafe { &*want };
                        if existing_ref.key == want_ref.key {
                            self.domain.clear(thread_slot, 0);
                            drop(unsafe { Box::from_raw(want) });
                            return false;
                        }
                        let evicted_bit =
                            nth_bit(&self.hasher, &existing_ref.key, cursor.bits_consumed());
                        let mut new_cell = Box::new(Cell::empty());
                        new_cell.children[evicted_bit as usize] =
                            AtomicUsize::new(existing as usize);
                        let cell_ptr = Box::into_raw(new_cell);
                        self.domain.clear(thread_slot, 0);
                        intent = Intent::Cell {
                            cell: cell_ptr,
                            expected_old: existing,
                            second: want,
                        };
                    }
                }
            }
        }
    }

    /// Look up `key`, cloning its value out if present.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let thread_slot = self.thread_slot();
        let mut cursor = Cursor::new(key, &self.hasher);
        let root = self.root();
        let mut slot: &AtomicUsize = &root.slots[cursor.advance(root.bit_count) as usize];
        loop {
            let raw = slot.load(Ordering::Acquire);
            if raw == 0 {
                return None;
            }
            if node::is_cell(raw) {
                let cell = unsafe { &*(node::cell_addr(raw) as *mut Cell<K, V>) };
                let bit = cursor.advance(1);
                slot = &cell.children[bit as usize];
                continue;
            }
            let protected = self.domain.protect(thread_slot, 0, slot);
            if protected == 0 {
                self.domain.clear(thread_slot, 0);
                return None;
            }
            if node::is_cell(protected) {
                self.domain.clear(thread_slot, 0);
                let cell = unsafe { &*(node::cell_addr(protected) as *mut Cell<K, V>) };
                let bit = cursor.advance(1);
                slot = &cell.children[bit as usize];
                continue;
            }
            let leaf = unsafe { &*(protected as *const Leaf<K, V>) };
            let result = if &leaf.key == key {
                Some(leaf.value.clone())
            } else {
                None
            };
            self.domain.clear(thread_slot, 0);
            return result;
        }
    }

    /// Remove `key` if present. Returns whether anything was removed.
    pub fn erase(&self, key: &K) -> bool {
        let thread_slot = self.thread_slot();
        let mut cursor = Cursor::new(key, &self.hasher);
        let root = self.root();
        let mut slot: &AtomicUsize = &root.slots[cursor.advance(root.bit_count) as usize];
        loop {
            let raw = slot.load(Ordering::Acquire);
            if raw == 0 {
                return false;
            }
            if node::is_cell(raw) {
                let cell = unsafe { &*(node::cell_addr(raw) as *mut Cell<K, V>) };
                let bit = cursor.advance(1);
                slot = &cell.children[bit as usize];
                continue;
            }
            let protected = self.domain.protect(thread_slot, 0, slot);
            if protected == 0 {
                self.domain.clear(thread_slot, 0);
                return false;
            }
            if node::is_cell(protected) {
                self.domain.clear(thread_slot, 0);
                let cell = unsafe { &*(node::cell_addr(protected) as *mut Cell<K, V>) };
                let bit = cursor.advance(1);
                slot = &cell.children[bit as usize];
                continue;
            }
            let leaf_ptr = protected as *mut Leaf<K, V>;
            let leaf = unsafe { &*leaf_ptr };
            if &leaf.key != key {
                self.domain.clear(thread_slot, 0);
                return false;
            }
            match slot.compare_exchange(protected, 0, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => {
                    self.domain.clear(thread_slot, 0);
                    self.domain
                        .retire(thread_slot, leaf_ptr as usize, drop_leaf::<K, V>);
                    return true;
                }
                Err(_) => {
                    self.domain.clear(thread_slot, 0);
                    continue;
                }
            }
        }
    }
}
