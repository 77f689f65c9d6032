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

pub(crate) mod cursor;
pub(crate) mod node;
mod ops;

use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::HazardResult;
use crate::hash::DefaultSegmentHasher;
use crate::hazard::HazardDomain;
use node::RootData;

/// Absolute bit-depth ceiling for the per-depth cell-population counters
/// used to trigger `sink`. Sized generously (four 64-bit hash segments'
/// worth) so that pathological collision chains degrade gracefully instead
/// of panicking on an out-of-bounds index; real keys never come close.
const MAX_TRIE_DEPTH: usize = 256;

thread_local! {
    /// Maps a domain's address (`&HazardDomain as usize`, unique per live
    /// `SinkTree`) to the calling thread's registered slot index. Plain
    /// `usize` keys/values sidestep having to make a generic thread-local
    /// per `SinkTree<K, V, H, P, MAX_THREADS>` monomorphization.
    static SLOT_CACHE: RefCell<HashMap<usize, usize>> = RefCell::new(HashMap::new());
}

/// A concurrent, lock-free, unordered key -> value map.
///
/// `Put` is insert-or-no-op, `Get` and `Erase` behave as their names
/// suggest. None of the three ever take a lock on their hot path; memory
/// safety for concurrently-read pointers comes from the hazard-pointer
/// engine in [`crate::hazard`], not from epochs or a global GC.
pub struct SinkTree<
    K,
    V,
    H = DefaultSegmentHasher,
    const P: usize = 1,
    const MAX_THREADS: usize = 64,
> {
    root: AtomicPtr<RootData>,
    hasher: H,
    pub(crate) domain: HazardDomain<P, MAX_THREADS>,
    old_roots: Mutex<Vec<Box<RootData>>>,
    cell_count: Box<[AtomicUsize]>,
    _kv: PhantomData<(K, V)>,
}

unsafe impl<K: Send, V: Send, H: Send, const P: usize, const MAX_THREADS: usize> Send
    for SinkTree<K, V, H, P, MAX_THREADS>
{
}
// Leaves allocated on one thread are read through `&K`/`&V` by any thread
// that later walks the trie (e.g. two concurrent `get`s on the same key), so
// both need to be `Sync`, not merely `Send` — the reachability is invisible
// to auto-trait derivation because slots are opaque `AtomicUsize` words.
unsafe impl<K: Send + Sync, V: Send + Sync, H: Sync, const P: usize, const MAX_THREADS: usize> Sync
    for SinkTree<K, V, H, P, MAX_THREADS>
{
}

fn bits_for_capacity(capacity: usize) -> u32 {
    let capacity = capacity.max(2);
    let mut bit_count = 1u32;
    while (1usize << bit_count) < capacity {
        bit_count += 1;
    }
    bit_count
}

impl<K, V> SinkTree<K, V, DefaultSegmentHasher> {
    pub fn new(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, DefaultSegmentHasher::default())
    }
}

impl<K, V, H, const P: usize, const MAX_THREADS: usize> SinkTree<K, V, H, P, MAX_THREADS> {
    pub fn with_capacity_and_hasher(capacity: usize, hasher: H) -> Self {
        let bit_count = bits_for_capacity(capacity);
        let root = Box::into_raw(Box::new(RootData::new(bit_count)));
        let cell_count = (0..MAX_TRIE_DEPTH).map(|_| AtomicUsize::new(0)).collect();
        Self {
            root: AtomicPtr::new(root),
            hasher,
            domain: HazardDomain::new(),
            old_roots: Mutex::new(Vec::new()),
            cell_count,
            _kv: PhantomData,
        }
    }

    fn domain_id(&self) -> usize {
        &self.domain as *const _ as usize
    }

    /// Explicitly register the calling thread before it issues any map
    /// operation. Calling this is optional: the first `put`/`get`/`erase`
    /// from an unregistered thread registers lazily (and panics if the
    /// engine is already at `MaxThreads` registrants).
    pub fn register_current_thread(&self) -> HazardResult<()> {
        let id = self.domain_id();
        let already = SLOT_CACHE.with(|c| c.borrow().contains_key(&id));
        if already {
            return Err(crate::error::HazardError::AlreadyRegistered);
        }
        let slot = self.domain.register()?;
        SLOT_CACHE.with(|c| c.borrow_mut().insert(id, slot));
        Ok(())
    }

    /// Release this thread's registration against this map. A thread that
    /// never calls this (e.g. it exits instead) just leaves its batch to be
    /// drained at map destruction; that's safe, just not prompt.
    pub fn unregister_current_thread(&self) {
        let id = self.domain_id();
        if let Some(slot) = SLOT_CACHE.with(|c| c.borrow_mut().remove(&id)) {
            self.domain.unregister(slot);
        }
    }

    /// Return this thread's registered slot, registering lazily if needed.
    pub(crate) fn thread_slot(&self) -> usize {
        let id = self.domain_id();
        if let Some(slot) = SLOT_CACHE.with(|c| c.borrow().get(&id).copied()) {
            return slot;
        }
        let slot = self
            .domain
            .register()
            .expect("sinktree: exceeded MaxThreads concurrent registrants");
        SLOT_CACHE.with(|c| c.borrow_mut().insert(id, slot));
        slot
    }

    pub(crate) fn root(&self) -> &RootData {
        unsafe { &*self.root.load(Ordering::Acquire) }
    }

    /// Called after a writer's linking CAS installs a brand-new cell at
    /// absolute hash-bit `depth`. Once every possible cell at that depth has
    /// been created (`2^depth` of them) *and* that depth is at least two
    /// bits below the current root, the layer immediately below the root is
    /// necessarily saturated with cells too, and it's safe to absorb it.
    pub(crate) fn note_cell_linked(&self, depth: u64) {
        let idx = (depth as usize).min(self.cell_count.len() - 1);
        let new_count = self.cell_count[idx].fetch_add(1, Ordering::AcqRel) + 1;
        let full = 1usize.checked_shl(depth as u32).unwrap_or(usize::MAX);
        let root_bits = self.root().bit_count as u64;
        if new_count == full && depth > root_bits + 1 {
            self.sink(depth);
        }
    }

    /// Double the root's fan-out by absorbing the layer of cells
    /// immediately below it. `target_depth` is the absolute hash-bit depth
    /// that was just observed fully populated with cells; the precondition
    /// is that the current root's `bit_count == target_depth - 2`.
    fn sink(&self, target_depth: u64) {
        let root_ptr = loop {
            let p = self.root.load(Ordering::Acquire);
            let bits = unsafe { &*p }.bit_count as u64;
            if bits == target_depth - 2 {
                break p;
            }
            if bits > target_depth - 2 {
                // someone already expanded past this point
                return;
            }
            std::hint::spin_loop();
        };
        let root = unsafe { &*root_ptr };
        let old_bits = root.bit_count;
        let new_bits = old_bits + 1;
        let old_len = 1usize << old_bits;
        let new_slots: Box<[AtomicUsize]> = (0..(old_len * 2)).map(|_| AtomicUsize::new(0)).collect();
        for i in 0..old_len {
            let w = root.slots[i].load(Ordering::Acquire);
            debug_assert!(node::is_cell(w), "sink: layer below root must be all cells");
            if node::is_cell(w) {
                let cell = unsafe { &*(node::cell_addr(w) as *mut node::Cell<K, V>) };
                new_slots[i].store(cell.children[0].load(Ordering::Acquire), Ordering::Relaxed);
                new_slots[i + old_len].store(cell.children[1].load(Ordering::Acquire), Ordering::Relaxed);
            } else {
                new_slots[i].store(w, Ordering::Relaxed);
            }
        }
        let new_root = Box::into_raw(Box::new(RootData {
            bit_count: new_bits,
            slots: new_slots,
        }));
        match self
            .root
            .compare_exchange(root_ptr, new_root, Ordering::Release, Ordering::Relaxed)
        {
            Ok(_) => {
                log::debug!("sinktree: sunk root from bit_count={old_bits} to {new_bits}");
                let old_box = unsafe { Box::from_raw(root_ptr) };
                self.old_roots.lock().push(old_box);
            }
            Err(_) => {
                // lost the race; our root was never published, safe to free directly
                drop(unsafe { Box::from_raw(new_root) });
            }
        }
    }
}

impl<K, V, H, const P: usize, const MAX_THREADS: usize> Drop for SinkTree<K, V, H, P, MAX_THREADS> {
    fn drop(&mut self) {
        for old in self.old_roots.get_mut().drain(..) {
            for slot in old.slots.iter() {
                let w = slot.load(Ordering::Relaxed);
                if node::is_cell(w) {
                    // free just the cell itself: its children were already
                    // copied into a newer root and are freed from there.
                    drop(unsafe { Box::from_raw(node::cell_addr(w) as *mut node::Cell<K, V>) });
                }
            }
            // `old` (Box<RootData>) drops here, freeing only the slots array.
        }
        let root = unsafe { Box::from_raw(*self.root.get_mut()) };
        for slot in root.slots.iter() {
            unsafe { node::free_subtree::<K, V>(slot.load(Ordering::Relaxed)) };
        }
    }
}
