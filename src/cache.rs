//! Per-thread state that needs no locking: the zone cache (an MRU
//! hint of recently touched zones) and the chunk quarantine (deferred
//! frees). When `thread_support` is disabled both collapse to a
//! single global instance instead of thread-local storage, since the
//! caller has already promised there is only ever one thread.
use std::cell::RefCell;

use crate::config::{CHUNK_QUARANTINE_SZ, ZONE_CACHE_SZ};

/// One MRU entry: which zone, and the chunk size it was created for
/// (cheaper to compare than dereferencing the zone on every lookup).
#[derive(Clone, Copy)]
pub struct ZoneCacheEntry {
    pub zone_index: usize,
    pub chunk_size: usize,
}

/// Fixed-capacity ring of the most recently touched *internal* zones.
/// The newest entry always overwrites the oldest when full.
pub struct ZoneCache {
    entries: Vec<ZoneCacheEntry>,
    next_write: usize,
}

impl ZoneCache {
    fn new() -> Self {
        Self {
            entries: Vec::with_capacity(ZONE_CACHE_SZ),
            next_write: 0,
        }
    }

    const fn new_const() -> Self {
        Self {
            entries: Vec::new(),
            next_write: 0,
        }
    }

    pub fn record(&mut self, zone_index: usize, chunk_size: usize) {
        let entry = ZoneCacheEntry {
            zone_index,
            chunk_size,
        };

        if self.entries.len() < ZONE_CACHE_SZ {
            self.entries.push(entry);
        } else {
            self.entries[self.next_write] = entry;
        }

        self.next_write = (self.next_write + 1) % ZONE_CACHE_SZ;
    }

    /// Iterates entries newest-first, since the hot path wants the
    /// most recently used zone that fits, not just any fitting zone.
    pub fn iter_newest_first(&self) -> impl Iterator<Item = ZoneCacheEntry> + '_ {
        let len = self.entries.len();
        (0..len).map(move |i| self.entries[(self.next_write + len - 1 - i) % len])
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_write = 0;
    }
}

/// Per-thread deferred-free ring. Frees are appended here and only
/// handed to the internal free routine once the ring is full, so a
/// use-after-free has to survive `CHUNK_QUARANTINE_SZ` other frees
/// before the slot is reused.
pub struct Quarantine {
    pending: Vec<(usize, bool)>,
}

impl Quarantine {
    fn new() -> Self {
        Self {
            pending: Vec::with_capacity(CHUNK_QUARANTINE_SZ),
        }
    }

    const fn new_const() -> Self {
        Self { pending: Vec::new() }
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= CHUNK_QUARANTINE_SZ
    }

    pub fn push(&mut self, addr: usize, permanent: bool) {
        self.pending.push((addr, permanent));
    }

    /// Drains the quarantine in FIFO order, matching insertion order.
    pub fn drain(&mut self) -> Vec<(usize, bool)> {
        std::mem::take(&mut self.pending)
    }
}

// Two interchangeable backings for the same `with_zone_cache`/
// `with_quarantine` surface: real thread-local storage when multiple
// threads may call into the allocator concurrently, or one process-wide
// instance when `thread_support` is off and the caller has already
// promised there is only ever one thread.
#[cfg(feature = "thread_support")]
mod imp {
    use super::*;

    thread_local! {
        static ZONE_CACHE: RefCell<ZoneCache> = RefCell::new(ZoneCache::new());
        static QUARANTINE: RefCell<Quarantine> = RefCell::new(Quarantine::new());
    }

    pub fn with_zone_cache<R>(f: impl FnOnce(&mut ZoneCache) -> R) -> R {
        ZONE_CACHE.with(|cache| f(&mut cache.borrow_mut()))
    }

    pub fn with_quarantine<R>(f: impl FnOnce(&mut Quarantine) -> R) -> R {
        QUARANTINE.with(|q| f(&mut q.borrow_mut()))
    }
}

#[cfg(not(feature = "thread_support"))]
mod imp {
    use super::*;

    // Safe only because `thread_support` being off is the caller's
    // promise that the allocator is never touched by more than one
    // thread, same contract `lock.rs`'s single-threaded `Lock`
    // implementation relies on.
    struct SingleThreaded<T>(RefCell<T>);
    unsafe impl<T> Sync for SingleThreaded<T> {}

    static ZONE_CACHE: SingleThreaded<ZoneCache> = SingleThreaded(RefCell::new(ZoneCache::new_const()));
    static QUARANTINE: SingleThreaded<Quarantine> = SingleThreaded(RefCell::new(Quarantine::new_const()));

    pub fn with_zone_cache<R>(f: impl FnOnce(&mut ZoneCache) -> R) -> R {
        f(&mut ZONE_CACHE.0.borrow_mut())
    }

    pub fn with_quarantine<R>(f: impl FnOnce(&mut Quarantine) -> R) -> R {
        f(&mut QUARANTINE.0.borrow_mut())
    }
}

pub use imp::{with_quarantine, with_zone_cache};

/// Clears this thread's zone cache, independent of its quarantine.
pub fn clear_zone_cache() {
    with_zone_cache(|cache| cache.clear());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_cache_wraps_around() {
        let mut cache = ZoneCache::new();
        for i in 0..ZONE_CACHE_SZ + 3 {
            cache.record(i, 64);
        }

        let newest: Vec<_> = cache.iter_newest_first().map(|e| e.zone_index).collect();
        assert_eq!(newest.len(), ZONE_CACHE_SZ);
        assert_eq!(newest[0], ZONE_CACHE_SZ + 2);
    }

    #[test]
    fn quarantine_fills_and_drains_fifo() {
        let mut q = Quarantine::new();
        for i in 0..CHUNK_QUARANTINE_SZ {
            assert!(!q.is_full());
            q.push(i, false);
        }
        assert!(q.is_full());

        let drained = q.drain();
        assert_eq!(drained.len(), CHUNK_QUARANTINE_SZ);
        assert_eq!(drained[0].0, 0);
        assert_eq!(drained[CHUNK_QUARANTINE_SZ - 1].0, CHUNK_QUARANTINE_SZ - 1);
        assert!(!q.is_full());
    }
}
