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

//! A hand-rolled hazard-pointer safe-memory-reclamation engine.
//!
//! This is deliberately *not* an epoch: there is no global clock and no
//! "grace period". A thread publishes the exact addresses it is about to
//! dereference (`protect`), and a reclaimer only frees a retired address
//! once it has observed that no published slot, across any registered
//! thread, still names it.
//!
//! The domain is owned by whoever needs reclamation (here, a [`crate::SinkTree`])
//! rather than being global or thread-local state: per-thread bookkeeping is
//! reached through an explicit registration slot index instead of an
//! implicit `thread_local!`, so teardown is tied to the owner's lifetime.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{HazardError, HazardResult};

/// One retired address plus the glue needed to actually drop it later,
/// since the domain itself is not generic over the pointee type.
struct Retired {
    addr: usize,
    drop_fn: unsafe fn(usize),
}

// SAFETY: `drop_fn` is only ever invoked on `addr` once, from whichever
// thread ends up running `scan`; the pointee itself must be `Send` for
// that to be sound, which callers guarantee (leaves are `Send` whenever
// `K: Send` and `V: Send`, matching the map's own bounds).
unsafe impl Send for Retired {}

struct ThreadSlot<const P: usize> {
    active: AtomicBool,
    protected: [AtomicUsize; P],
    retired: Mutex<Vec<Retired>>,
}

impl<const P: usize> ThreadSlot<P> {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            protected: std::array::from_fn(|_| AtomicUsize::new(0)),
            retired: Mutex::new(Vec::new()),
        }
    }
}

/// The reclamation domain. Owns one fixed-size registration table; every
/// registered thread gets exactly one [`ThreadSlot`].
pub struct HazardDomain<const P: usize = 1, const MAX_THREADS: usize = 64> {
    threads: Box<[ThreadSlot<P>]>,
    scan_lock: Mutex<()>,
    /// Retired addresses left behind by threads that unregistered (or died)
    /// while some of their batch was still possibly-hazardous; reclaimed
    /// opportunistically by whichever thread next runs a successful scan,
    /// and unconditionally at domain teardown.
    orphaned: Mutex<Vec<Retired>>,
}

impl<const P: usize, const MAX_THREADS: usize> HazardDomain<P, MAX_THREADS> {
    /// Retired-batch capacity per thread. Kept comfortably above
    /// `P * MaxThreads` so a full scan always has a chance to make progress.
    pub const RETIRE_CAP: usize = 2 * MAX_THREADS * P;

    pub fn new() -> Self {
        let threads = (0..MAX_THREADS).map(|_| ThreadSlot::new()).collect();
        Self {
            threads,
            scan_lock: Mutex::new(()),
            orphaned: Mutex::new(Vec::new()),
        }
    }

    /// Claim a free registration slot. Threads must register before calling
    /// [`protect`](Self::protect) / [`retire`](Self::retire).
    pub fn register(&self) -> HazardResult<usize> {
        for (i, t) in self.threads.iter().enumerate() {
            if t.active
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                log::trace!("sinktree: thread registered at slot {i}");
                return Ok(i);
            }
        }
        Err(HazardError::TooManyThreads)
    }

    /// Release a registration slot. Clears any protected pointers, makes a
    /// best-effort scan to drain the thread's own retired batch, and parks
    /// whatever remains in `orphaned` for a later scan (or domain teardown)
    /// to clean up.
    pub fn unregister(&self, slot: usize) {
        for i in 0..P {
            self.clear(slot, i);
        }
        self.scan(slot);
        let remainder = {
            let mut r = self.threads[slot].retired.lock();
            std::mem::take(&mut *r)
        };
        if !remainder.is_empty() {
            self.orphaned.lock().extend(remainder);
        }
        self.threads[slot].active.store(false, Ordering::Release);
        log::trace!("sinktree: thread unregistered from slot {slot}");
    }

    /// Publish intent to dereference the current value of `atomic_slot`,
    /// re-verify it hasn't already been retired-and-changed out from under
    /// us, and return the verified value. Retries until publish and re-load
    /// agree.
    pub fn protect(&self, slot: usize, index: usize, atomic_slot: &AtomicUsize) -> usize {
        loop {
            let v = atomic_slot.load(Ordering::Acquire);
            self.threads[slot].protected[index].store(v, Ordering::Release);
            let v2 = atomic_slot.load(Ordering::Acquire);
            if v == v2 {
                return v;
            }
        }
    }

    /// Clear a previously-protected slot. Every operation must call this on
    /// every exit path before returning.
    pub fn clear(&self, slot: usize, index: usize) {
        self.threads[slot].protected[index].store(0, Ordering::Release);
    }

    /// Hand an address to the engine for deferred deletion. `drop_fn` is
    /// called with `addr` once it is safe to do so.
    pub fn retire(&self, slot: usize, addr: usize, drop_fn: unsafe fn(usize)) {
        let len = {
            let mut r = self.threads[slot].retired.lock();
            r.push(Retired { addr, drop_fn });
            r.len()
        };
        if len >= Self::RETIRE_CAP {
            self.scan(slot);
        }
    }

    /// Gather every currently-published protected pointer across all
    /// registered threads and free whatever in `slot`'s retired batch is no
    /// longer among them. At most one thread reclaims at a time: others
    /// bypass the scan entirely if the guard is already held, matching the
    /// "no operation blocks on the hot path" policy.
    fn scan(&self, slot: usize) {
        let guard = match self.scan_lock.try_lock() {
            Some(g) => g,
            None => return,
        };
        let mut live = Vec::new();
        for t in self.threads.iter() {
            if t.active.load(Ordering::Acquire) {
                for p in t.protected.iter() {
                    let v = p.load(Ordering::Acquire);
                    if v != 0 {
                        live.push(v);
                    }
                }
            }
        }
        live.sort_unstable();

        let mut batch = {
            let mut r = self.threads[slot].retired.lock();
            std::mem::take(&mut *r)
        };
        let mut dismissed = Vec::with_capacity(batch.len());
        let mut approved = Vec::new();
        for r in batch.drain(..) {
            if live.binary_search(&r.addr).is_ok() {
                dismissed.push(r);
            } else {
                approved.push(r);
            }
        }
        *self.threads[slot].retired.lock() = dismissed;
        drop(guard);

        let freed = approved.len();
        for r in approved {
            unsafe { (r.drop_fn)(r.addr) };
        }
        if freed > 0 {
            log::trace!("sinktree: scan reclaimed {freed} pointer(s)");
        }
    }
}

impl<const P: usize, const MAX_THREADS: usize> Drop for HazardDomain<P, MAX_THREADS> {
    fn drop(&mut self) {
        for t in self.threads.iter_mut() {
            for r in t.retired.get_mut().drain(..) {
                unsafe { (r.drop_fn)(r.addr) };
            }
        }
        for r in self.orphaned.get_mut().drain(..) {
            unsafe { (r.drop_fn)(r.addr) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as AU;

    #[test]
    fn register_and_unregister_recycles_slots() {
        let domain: HazardDomain<1, 2> = HazardDomain::new();
        let a = domain.register().unwrap();
        let b = domain.register().unwrap();
        assert!(domain.register().is_err());
        domain.unregister(a);
        let c = domain.register().unwrap();
        assert_eq!(a, c);
        domain.unregister(b);
        domain.unregister(c);
    }

    #[test]
    fn protect_returns_current_value() {
        let domain: HazardDomain<1, 4> = HazardDomain::new();
        let slot = domain.register().unwrap();
        let atomic = AU::new(0x1234);
        let v = domain.protect(slot, 0, &atomic);
        assert_eq!(v, 0x1234);
        domain.clear(slot, 0);
    }

    #[test]
    fn retire_below_cap_does_not_free_protected() {
        let domain: HazardDomain<1, 4> = HazardDomain::new();
        let slot = domain.register().unwrap();
        let leaked: Box<AtomicUsize> = Box::new(AtomicUsize::new(7));
        let addr = Box::into_raw(leaked) as usize;
        let atomic = AU::new(addr);
        let _p = domain.protect(slot, 0, &atomic);

        unsafe fn drop_box(addr: usize) {
            drop(Box::from_raw(addr as *mut AtomicUsize));
        }
        domain.retire(slot, addr, drop_box);
        // force a scan despite being below the cap, to exercise the "still protected" path
        domain.scan(slot);
        // the address must still be readable: it was protected, so scan must not have freed it
        let still_there = unsafe { &*(addr as *const AtomicUsize) };
        assert_eq!(still_there.load(Ordering::Relaxed), 7);

        domain.clear(slot, 0);
        domain.scan(slot);
        domain.unregister(slot);
    }
}
