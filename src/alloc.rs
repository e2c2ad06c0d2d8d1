//! The public allocate/free/size surface, dispatching into the zone
//! engine (`zone.rs`, `root.rs`), the big-allocation engine
//! (`big.rs`), and the per-thread caches (`cache.rs`).
use crate::abort::fatal;
use crate::cache;
use crate::config::MAX_DEFAULT_ZONE_SZ;
use crate::root::{RootState, ROOT};

fn allocation_failed(what: &str) -> *mut u8 {
    if cfg!(feature = "abort_on_null") {
        fatal!("allocation failed: {}", what);
    }
    std::ptr::null_mut()
}

/// Tries every internal zone that could fit `size`, creating one if
/// none exists yet, retrying if the first candidate turns out to be
/// full by the time it's examined.
fn allocate_in_zone(size: usize, private: Option<usize>) -> Result<Option<usize>, &'static str> {
    ROOT.with_state(|state| {
        let attempts = state.zones.len() + 2;

        for _ in 0..attempts {
            let zone_index = match private {
                Some(idx) => idx,
                None => match state.find_fitting_zone(size) {
                    Some(idx) => idx,
                    None => state.create_zone(RootState::pick_chunk_size(size), true)?,
                },
            };

            match state.zones[zone_index].allocate_chunk()? {
                Some(ptr) => {
                    let chunk_size = state.zones[zone_index].chunk_size;
                    let internal = state.zones[zone_index].internal;
                    if internal {
                        cache::with_zone_cache(|c| c.record(zone_index, chunk_size));
                    }
                    return Ok(Some(ptr));
                }
                None if private.is_some() => return Ok(None),
                None => continue,
            }
        }

        Ok(None)
    })
}

fn allocate_big(size: usize) -> Result<usize, &'static str> {
    let populate = cfg!(feature = "prepopulate");
    ROOT.with_big(|big| big.allocate(size, ROOT.big_zone_canary_secret, populate))
}

/// `alloc(size) -> pointer`.
pub fn alloc(size: usize) -> *mut u8 {
    if ROOT.is_protected() {
        fatal!("allocation attempted while the allocator is protected");
    }

    if size == 0 {
        if cfg!(feature = "no_zero_allocations") {
            return allocation_failed("zero-size allocations are disabled");
        }
        return ROOT.zero_alloc_sentinel() as *mut u8;
    }

    if size > MAX_DEFAULT_ZONE_SZ {
        return match allocate_big(size) {
            Ok(ptr) => ptr as *mut u8,
            Err(e) => allocation_failed(e),
        };
    }

    match allocate_in_zone(size, None) {
        Ok(Some(ptr)) => ptr as *mut u8,
        Ok(None) => allocation_failed("no free chunk available"),
        Err(e) => fatal!("integrity violation during allocation: {}", e),
    }
}

/// `calloc(n, size) -> pointer`: overflow-checked
/// multiplication, zero-initialised memory. Reused chunks may carry
/// poison bytes or a stale canary left over from a previous
/// occupant, so the whole buffer is always explicitly zeroed rather
/// than relying on a freshly mapped page already being zero.
pub fn calloc(count: usize, size: usize) -> *mut u8 {
    let total = match count.checked_mul(size) {
        Some(total) => total,
        None => fatal!("calloc overflow: {} * {}", count, size),
    };

    let ptr = alloc(total);
    if !ptr.is_null() && total > 0 {
        unsafe {
            std::ptr::write_bytes(ptr, 0, total);
        }
    }
    ptr
}

/// Internal free routine shared by `free`, `free_permanent`, and the
/// quarantine drain.
fn internal_free(addr: usize, permanent: bool) -> Result<(), &'static str> {
    let found = ROOT.with_state(|state| -> Result<bool, &'static str> {
        if let Some(idx) = state.find_owning_zone(addr) {
            state.zones[idx].free_chunk(addr, permanent)?;

            let chunk_size = state.zones[idx].chunk_size;
            let internal = state.zones[idx].internal;
            if internal {
                cache::with_zone_cache(|c| c.record(idx, chunk_size));
            }

            state.retire_if_eligible(idx)?;
            return Ok(true);
        }
        Ok(false)
    })?;

    if found {
        return Ok(());
    }

    ROOT.with_big(|big| {
        if permanent {
            big.free_permanent(addr, ROOT.big_zone_canary_secret)
        } else {
            big.free(addr, ROOT.big_zone_canary_secret)
        }
    })
}

fn drain_quarantine_then(addr: usize, permanent: bool) {
    let pending = cache::with_quarantine(|q| {
        if q.is_full() {
            Some(q.drain())
        } else {
            q.push(addr, permanent);
            None
        }
    });

    if let Some(pending) = pending {
        for (queued_addr, queued_permanent) in pending {
            if let Err(e) = internal_free(queued_addr, queued_permanent) {
                fatal!("integrity violation during quarantine drain: {}", e);
            }
        }
        cache::with_quarantine(|q| q.push(addr, permanent));
    }
}

/// `free(pointer)`: no-op on null/the zero-alloc sentinel, otherwise
/// enqueued into the per-thread quarantine.
pub fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }

    let addr = ptr as usize;
    if ROOT.is_zero_alloc_sentinel(addr) {
        return;
    }

    drain_quarantine_then(addr, false);
}

/// `free_permanent(pointer)`: bypasses the quarantine.
pub fn free_permanent(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }

    let addr = ptr as usize;
    if ROOT.is_zero_alloc_sentinel(addr) {
        return;
    }

    if let Err(e) = internal_free(addr, true) {
        fatal!("integrity violation during permanent free: {}", e);
    }
}

/// `free_with_size(pointer, size)`: validates the owning allocation
/// is at least `size` bytes before deferring to the normal free path.
pub fn free_with_size(ptr: *mut u8, size: usize) {
    if ptr.is_null() {
        return;
    }

    let addr = ptr as usize;
    if ROOT.is_zero_alloc_sentinel(addr) {
        return;
    }

    let owned_size = ROOT.with_state(|state| {
        state
            .find_owning_zone(addr)
            .map(|idx| state.zones[idx].chunk_size)
    });

    let owned_size = match owned_size {
        Some(sz) => sz,
        None => match ROOT.with_big(|big| big.size_of(addr)) {
            Some(sz) => sz,
            None => fatal!("free_with_size: pointer 0x{:x} is not a known allocation", addr),
        },
    };

    if owned_size < size {
        fatal!(
            "free_with_size: owning allocation is {} bytes, smaller than {}",
            owned_size, size
        );
    }

    drain_quarantine_then(addr, false);
}

/// `chunk_size(pointer) -> size`.
pub fn chunk_size(ptr: *mut u8) -> usize {
    if ptr.is_null() {
        fatal!("chunk_size: null pointer");
    }

    let addr = ptr as usize;

    if let Some(size) = ROOT.with_state(|state| {
        state
            .find_owning_zone(addr)
            .map(|idx| state.zones[idx].chunk_size)
    }) {
        return size;
    }

    if let Some(size) = ROOT.with_big(|big| big.size_of(addr)) {
        return size;
    }

    fatal!("chunk_size: pointer 0x{:x} is not owned by this allocator", addr);
}

/// `realloc`: a higher-level composition of allocate/copy/free,
/// built on top of (and bound by) the same contracts as the
/// primitives it calls.
pub fn realloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
        return alloc(new_size);
    }

    if new_size == 0 {
        free(ptr);
        return ROOT.zero_alloc_sentinel() as *mut u8;
    }

    let old_size = chunk_size(ptr);
    if new_size <= old_size {
        return ptr;
    }

    let new_ptr = alloc(new_size);
    if new_ptr.is_null() {
        return new_ptr;
    }

    unsafe {
        std::ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size));
    }
    free(ptr);
    new_ptr
}

/// An opaque handle to a zone `alloc`/`free` will never pick on their
/// own.
pub struct PrivateZone {
    index: usize,
    chunk_size: usize,
}

/// `new_private_zone(size) -> zone_handle`.
pub fn new_private_zone(size: usize) -> PrivateZone {
    let chunk_size = RootState::pick_chunk_size(size);
    let index = ROOT
        .with_state(|state| state.create_zone(chunk_size, false))
        .unwrap_or_else(|e| fatal!("failed to create private zone: {}", e));

    PrivateZone { index, chunk_size }
}

impl PrivateZone {
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn alloc(&self) -> *mut u8 {
        match allocate_in_zone(self.chunk_size, Some(self.index)) {
            Ok(Some(ptr)) => ptr as *mut u8,
            Ok(None) => allocation_failed("private zone exhausted"),
            Err(e) => fatal!("integrity violation during private allocation: {}", e),
        }
    }

    pub fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        if let Err(e) = internal_free(ptr as usize, false) {
            fatal!("integrity violation during private free: {}", e);
        }
    }

    /// Verifies just this private zone's canaries.
    pub fn verify(&self) -> Result<(), String> {
        ROOT.with_state(|state| state.zones[self.index].verify())
    }
}

impl Drop for PrivateZone {
    fn drop(&mut self) {
        let never_reuse = cfg!(feature = "never_reuse_zones");
        ROOT.with_state(|state| {
            if let Err(e) = state.zones[self.index].destroy_private(never_reuse) {
                fatal!("failed to tear down private zone: {}", e);
            }
        });
    }
}

/// Checks every zone's and big allocation's canaries.
pub fn verify_all_zones() -> Result<(), String> {
    ROOT.with_state(|state| state.verify_all_zones())?;
    ROOT.with_big(|big| big.verify_all(ROOT.big_zone_canary_secret))
}

/// Verifies just the zone that owns `ptr`, rather than the whole
/// process. Used for spot-checks on a hot allocation without paying
/// for a full `verify_all_zones` sweep.
pub fn verify_zone(ptr: *mut u8) -> Result<(), String> {
    let addr = ptr as usize;

    let found = ROOT.with_state(|state| {
        state
            .find_owning_zone(addr)
            .map(|idx| state.zones[idx].verify())
    });

    match found {
        Some(result) => result,
        None => {
            if ROOT.with_big(|big| big.owns(addr)) {
                ROOT.with_big(|big| big.verify_all(ROOT.big_zone_canary_secret))
            } else {
                Err(format!("verify_zone: pointer 0x{:x} is not owned by this allocator", addr))
            }
        }
    }
}

/// Total bytes currently handed out across every zone and big
/// allocation. Diagnostics only.
pub fn mem_usage() -> usize {
    let zone_usage = ROOT.with_state(|state| state.mem_usage());
    let big_usage = ROOT.with_big(|big| big.mem_usage());
    zone_usage + big_usage
}

/// `protect_root` / `unprotect_root`.
pub fn protect_root() {
    ROOT.protect();
}

pub fn unprotect_root() {
    ROOT.unprotect();
}

/// `flush_caches`: drains this thread's quarantine through the
/// internal free path, then clears its zone cache.
pub fn flush_caches() {
    let pending = cache::with_quarantine(|q| q.drain());
    for (addr, permanent) in pending {
        if let Err(e) = internal_free(addr, permanent) {
            fatal!("integrity violation during flush_caches: {}", e);
        }
    }
    cache::clear_zone_cache();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_roundtrip() {
        let ptr = alloc(48);
        assert!(!ptr.is_null());
        assert!(chunk_size(ptr) >= 48);
        free(ptr);
        flush_caches();
    }

    #[test]
    fn calloc_zeroes_memory() {
        let ptr = calloc(16, 8);
        assert!(!ptr.is_null());
        unsafe {
            for i in 0..128 {
                assert_eq!(*ptr.add(i), 0);
            }
        }
        free(ptr);
        flush_caches();
    }

    #[test]
    fn zero_size_alloc_returns_sentinel() {
        let ptr = alloc(0);
        assert_eq!(ptr as usize, ROOT.zero_alloc_sentinel());
        // Freeing the sentinel is always a no-op.
        free(ptr);
    }

    #[test]
    fn big_allocation_reuses_freed_entry() {
        let big_size = MAX_DEFAULT_ZONE_SZ * 4;
        let p1 = alloc(big_size);
        assert!(!p1.is_null());
        free(p1);
        flush_caches();

        // A non-permanent free just marks the entry free; the next
        // request of a size that fits reuses the same mapping instead
        // of growing the big-zone list.
        let p2 = alloc(big_size);
        assert_eq!(p1, p2);
        free_permanent(p2);
    }

    #[test]
    fn private_zone_is_invisible_to_general_alloc() {
        let private = new_private_zone(256);
        let ptr = private.alloc();
        assert!(!ptr.is_null());

        for _ in 0..64 {
            let p = alloc(256);
            assert_ne!(p as usize, ptr as usize);
            free(p);
            flush_caches();
        }

        private.free(ptr);
    }

    #[test]
    fn mem_usage_reflects_live_allocations() {
        let before = mem_usage();
        let ptr = alloc(64);
        assert!(mem_usage() >= before + 64);
        free(ptr);
        flush_caches();
    }

    #[test]
    fn verify_zone_accepts_live_allocation_and_rejects_foreign_pointer() {
        let ptr = alloc(64);
        assert!(verify_zone(ptr).is_ok());
        free(ptr);
        flush_caches();

        let stack_var = 0u8;
        assert!(verify_zone(&stack_var as *const u8 as *mut u8).is_err());
    }

    #[test]
    fn realloc_grows_and_preserves_contents() {
        let ptr = alloc(16);
        unsafe {
            std::ptr::write_bytes(ptr, 0x7a, 16);
        }

        let grown = realloc(ptr, 256);
        assert!(!grown.is_null());
        unsafe {
            for i in 0..16 {
                assert_eq!(*grown.add(i), 0x7a);
            }
        }

        free(grown);
        flush_caches();
    }
}
