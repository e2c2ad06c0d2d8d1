//! The root's two lookup tables: a size→zone table giving near-O(1)
//! access to the head of a size class's `next_sz_index` chain, and an
//! address→zone table giving near-O(1) resolution from a user pointer
//! back to the zone that owns it. Both live behind the root lock, so
//! no separate synchronization is needed here; this module only owns
//! the shape of the tables and their hash/index functions.
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::config::{MAX_DEFAULT_ZONE_SZ, SMALLEST_CHUNK_SZ, ZONE_USER_SIZE};
use crate::map;

/// Number of distinct default-sized chunk size classes
/// (`SMALLEST_CHUNK_SZ`, `2*SMALLEST_CHUNK_SZ`, ..., `MAX_DEFAULT_ZONE_SZ`).
const SIZE_CLASS_COUNT: usize = {
    let mut n = 0;
    let mut sz = SMALLEST_CHUNK_SZ;
    while sz <= MAX_DEFAULT_ZONE_SZ {
        n += 1;
        sz *= 2;
    }
    n
};

fn size_class_index(size: usize) -> Option<usize> {
    if size == 0 || size > MAX_DEFAULT_ZONE_SZ {
        return None;
    }

    let rounded = size.next_power_of_two().max(SMALLEST_CHUNK_SZ);
    if rounded > MAX_DEFAULT_ZONE_SZ {
        return None;
    }

    Some((rounded.trailing_zeros() - SMALLEST_CHUNK_SZ.trailing_zeros()) as usize)
}

/// Size→zone table: `table[size_class_index(n)]` is `Some(zone_index)`
/// for the first zone of that class, or `None` if no zone of that
/// exact rounded size has been created yet.
pub struct SizeTable {
    entries: [Option<usize>; SIZE_CLASS_COUNT],
}

impl SizeTable {
    /// A handful of `usize` entries embedded directly in `RootState`;
    /// small enough that it never takes a soft fault worth guarding
    /// against, unlike the much larger `AddrTable` below.
    pub fn new() -> Self {
        Self {
            entries: [None; SIZE_CLASS_COUNT],
        }
    }

    pub fn lookup(&self, size: usize) -> Option<usize> {
        size_class_index(size).and_then(|i| self.entries[i])
    }

    /// Registers `zone_index` as the head of the chain for `size`'s
    /// class, but only if the class had no head yet. New zones link
    /// onto the *tail* of an existing chain via `next_sz_index`; only
    /// the very first zone of a class becomes the table entry.
    pub fn register_head_if_absent(&mut self, size: usize, zone_index: usize) {
        if let Some(i) = size_class_index(size) {
            self.entries[i].get_or_insert(zone_index);
        }
    }
}

/// Number of buckets in the address→zone table. Sized generously
/// relative to `MAX_ZONES` since collisions only degrade the lookup
/// to "fall through to the zone cache / full scan", never correctness.
const ADDR_TABLE_BUCKETS: usize = 1 << 16;

fn addr_bucket(addr: usize) -> usize {
    // Zones are `ZONE_USER_SIZE`-ish apart in practice (each mapping
    // carries its own guard pages), so the interesting entropy is in
    // the high bits of the address; fold them down with a cheap
    // multiplicative hash.
    let key = (addr / ZONE_USER_SIZE) as u64;
    ((key.wrapping_mul(0x9E37_79B9_7F4A_7C15)) >> 48) as usize % ADDR_TABLE_BUCKETS
}

/// Sentinel bucket value meaning "no zone registered here".
const EMPTY_BUCKET: u64 = u64::MAX;

/// Address→zone table: maps a hash of the high bits of a user address
/// to the zone index that was last registered for that bucket.
/// Lookups may miss (wrong bucket occupant, or never registered) and
/// must degrade gracefully to a zone-cache check or full scan.
///
/// Backed by its own `mmap`, `mlock`'d in place, rather than a
/// `Vec`: spec.md section 5 requires the lookup tables be
/// "memory-locked to avoid soft faults on the hot path", which only a
/// table with a stable, OS-visible address can honour. A `Vec`'s
/// backing allocation can in principle move (e.g. across a realloc)
/// and offers nothing for the allocator's own `mlock` wrapper to
/// target.
pub struct AddrTable {
    base: NonNull<c_void>,
    mapped_size: usize,
}

// `NonNull` opts the struct out of `Send`/`Sync` by default; every
// access is already serialized by the root lock (`root.rs`), same as
// the raw bitmap pointers `zone.rs` reads/writes under that same lock.
unsafe impl Send for AddrTable {}
unsafe impl Sync for AddrTable {}

impl AddrTable {
    pub fn new() -> Self {
        let mapped_size = map::page_round_up(ADDR_TABLE_BUCKETS * std::mem::size_of::<u64>());
        let base = map::reserve(mapped_size)
            .and_then(|base| map::protect(base, mapped_size, true).map(|_| base))
            .expect("failed to map the address->zone lookup table");

        let _ = map::mlock(base, mapped_size);

        unsafe {
            std::ptr::write_bytes(base.as_ptr() as *mut u8, 0xff, mapped_size);
        }

        Self { base, mapped_size }
    }

    fn slot_ptr(&self, bucket: usize) -> *mut u64 {
        (self.base.as_ptr() as *mut u64).wrapping_add(bucket)
    }

    pub fn lookup(&self, addr: usize) -> Option<usize> {
        let value = unsafe { std::ptr::read(self.slot_ptr(addr_bucket(addr))) };
        if value == EMPTY_BUCKET {
            None
        } else {
            Some(value as usize)
        }
    }

    pub fn register(&mut self, addr: usize, zone_index: usize) {
        unsafe {
            std::ptr::write(self.slot_ptr(addr_bucket(addr)), zone_index as u64);
        }
    }

    pub fn clear_entry(&mut self, addr: usize) {
        unsafe {
            std::ptr::write(self.slot_ptr(addr_bucket(addr)), EMPTY_BUCKET);
        }
    }
}

impl Drop for AddrTable {
    fn drop(&mut self) {
        let _ = map::release(self.base, self.mapped_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_table_rounds_up_to_class() {
        let mut table = SizeTable::new();
        table.register_head_if_absent(13, 7);
        assert_eq!(table.lookup(16), Some(7));
        assert_eq!(table.lookup(13), Some(7));
        assert_eq!(table.lookup(17), None);
    }

    #[test]
    fn size_table_first_writer_wins() {
        let mut table = SizeTable::new();
        table.register_head_if_absent(64, 3);
        table.register_head_if_absent(64, 9);
        assert_eq!(table.lookup(64), Some(3));
    }

    #[test]
    fn size_table_rejects_oversized_requests() {
        let table = SizeTable::new();
        assert_eq!(table.lookup(MAX_DEFAULT_ZONE_SZ + 1), None);
    }

    #[test]
    fn addr_table_roundtrip() {
        let mut table = AddrTable::new();
        let addr = 0x7f00_0000_0000usize;
        table.register(addr, 42);
        assert_eq!(table.lookup(addr), Some(42));
        table.clear_entry(addr);
        assert_eq!(table.lookup(addr), None);
    }
}
