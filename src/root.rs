//! The process-wide `Root`: the zone array, the lookup tables, the
//! big-zone list, the three masking secrets, and the two coarse locks
//! that guard all of the above. Everything that isn't per-thread
//! state (`cache.rs`) funnels through here.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::sync::atomic::{AtomicBool, Ordering};

use crate::big::BigZoneList;
use crate::config::*;
use crate::lock::Lock;
use crate::lookup::{AddrTable, SizeTable};
use crate::map;
use crate::rng;
use crate::zone::Zone;

/// Everything the root lock protects: the zone array and both lookup
/// tables. Every mutation of zone, bitmap, or lookup-table state
/// occurs under this lock.
pub struct RootState {
    pub zones: Vec<Zone>,
    pub size_table: SizeTable,
    pub addr_table: AddrTable,
}

impl RootState {
    fn new() -> Self {
        Self {
            zones: Vec::new(),
            size_table: SizeTable::new(),
            addr_table: AddrTable::new(),
        }
    }

    /// Rounds a request up to a zone chunk size class, clamped to
    /// `[SMALLEST_CHUNK_SZ, MAX_DEFAULT_ZONE_SZ]`. Callers are
    /// responsible for routing anything above `MAX_DEFAULT_ZONE_SZ`
    /// to the big-allocation path instead.
    pub fn pick_chunk_size(requested: usize) -> usize {
        requested
            .max(1)
            .next_power_of_two()
            .clamp(SMALLEST_CHUNK_SZ, MAX_DEFAULT_ZONE_SZ)
    }

    /// Creates a new zone of `chunk_size`, registers it in both
    /// lookup tables (for internal zones), and returns its index.
    #[ensures(ret.map_or(true, |idx| idx == self.zones.len() - 1), "A newly created zone is always appended, never inserted.")]
    pub fn create_zone(&mut self, chunk_size: usize, internal: bool) -> Result<usize, &'static str> {
        if self.zones.len() >= MAX_ZONES {
            return Err("zones_used == MAX_ZONES");
        }

        let index = self.zones.len();
        let zone = Zone::create(chunk_size, index, internal)?;
        self.zones.push(zone);

        if internal {
            self.link_into_size_chain(chunk_size, index);
            let addr = self.zones[index].user_pages_start_for_registration();
            self.addr_table.register(addr, index);
        }

        Ok(index)
    }

    fn link_into_size_chain(&mut self, chunk_size: usize, new_index: usize) {
        match self.size_table.lookup(chunk_size) {
            None => self.size_table.register_head_if_absent(chunk_size, new_index),
            Some(head) => {
                let mut cur = head;
                while let Some(next) = self.zones[cur].next_sz_index {
                    cur = next;
                }
                self.zones[cur].next_sz_index = Some(new_index);
            }
        }
    }

    /// Finds an internal zone able to serve `requested` bytes,
    /// preferring (in order) the thread's zone cache, the size→zone
    /// chain, and finally a full linear scan.
    pub fn find_fitting_zone(&self, requested: usize) -> Option<usize> {
        let mut hint = None;

        crate::cache::with_zone_cache(|cache| {
            for entry in cache.iter_newest_first() {
                if entry.chunk_size >= requested {
                    if let Some(zone) = self.zones.get(entry.zone_index) {
                        if zone.does_zone_fit(requested) && zone.fits_current_cpu() {
                            hint = Some(entry.zone_index);
                            return;
                        }
                    }
                }
            }
        });

        if hint.is_some() {
            return hint;
        }

        let chunk_size = Self::pick_chunk_size(requested);
        if let Some(head) = self.size_table.lookup(chunk_size) {
            let mut cur = Some(head);
            while let Some(idx) = cur {
                let zone = &self.zones[idx];
                if zone.does_zone_fit(requested) && zone.fits_current_cpu() {
                    return Some(idx);
                }
                cur = zone.next_sz_index;
            }
        }

        self.zones
            .iter()
            .position(|z| z.does_zone_fit(requested) && z.fits_current_cpu())
    }

    /// Locates the zone owning `addr`, trying the address table, then
    /// the thread's zone cache, then a full scan.
    pub fn find_owning_zone(&self, addr: usize) -> Option<usize> {
        if let Some(idx) = self.addr_table.lookup(addr) {
            if self.zones.get(idx).map_or(false, |z| z.contains(addr)) {
                return Some(idx);
            }
        }

        let mut hint = None;
        crate::cache::with_zone_cache(|cache| {
            for entry in cache.iter_newest_first() {
                if self.zones.get(entry.zone_index).map_or(false, |z| z.contains(addr)) {
                    hint = Some(entry.zone_index);
                    return;
                }
            }
        });
        if hint.is_some() {
            return hint;
        }

        self.zones.iter().position(|z| z.contains(addr))
    }

    /// Replaces a retirement-eligible zone in place.
    pub fn retire_if_eligible(&mut self, index: usize) -> Result<(), &'static str> {
        if self.zones[index].is_retirement_eligible() {
            self.addr_table
                .clear_entry(self.zones[index].user_pages_start_for_registration());
            self.zones[index].rebuild()?;
            let addr = self.zones[index].user_pages_start_for_registration();
            self.addr_table.register(addr, index);
        }
        Ok(())
    }

    /// Checks every zone's canaries.
    pub fn verify_all_zones(&self) -> Result<(), String> {
        for zone in &self.zones {
            zone.verify()?;
        }
        Ok(())
    }

    /// Sum of `Zone::mem_usage` across every zone. Diagnostics only,
    /// not load-bearing for any allocator invariant.
    pub fn mem_usage(&self) -> usize {
        self.zones.iter().map(|z| z.mem_usage()).sum()
    }
}

/// The process-wide control record. Owns the root lock (zone array +
/// lookup tables), the big-zone lock (big-zone list), the three
/// random secrets, and the "zero allocation" sentinel page.
pub struct Root {
    state: Lock<RootState>,
    big: Lock<BigZoneList>,
    pub zone_handle_mask: u64,
    pub big_zone_canary_secret: u64,
    zero_page: usize,
    protected: AtomicBool,
}

impl Root {
    fn new() -> Self {
        let zone_handle_mask = rng::next_u64();
        let big_zone_next_mask = rng::next_u64();
        let big_zone_canary_secret = rng::next_u64();

        let zero_page = map::reserve(map::page_size())
            .map(|p| p.as_ptr() as usize)
            .expect("failed to map the zero-size allocation sentinel page");

        let mut state = RootState::new();
        for &chunk_size in DEFAULT_ZONE_CLASSES {
            state
                .create_zone(chunk_size, true)
                .expect("failed to create a default zone at startup");
        }

        Root {
            state: Lock::new(state),
            big: Lock::new(BigZoneList::new(big_zone_next_mask)),
            zone_handle_mask,
            big_zone_canary_secret,
            zero_page,
            protected: AtomicBool::new(false),
        }
    }

    /// The sentinel address returned for zero-byte allocations and
    /// (if `no_zero_allocations` is set) rejected zero-byte
    /// allocations, a `PROT_NONE` page so any dereference segfaults
    /// rather than corrupting unrelated memory.
    pub fn zero_alloc_sentinel(&self) -> usize {
        self.zero_page
    }

    pub fn is_zero_alloc_sentinel(&self, addr: usize) -> bool {
        addr == self.zero_page
    }

    /// Disables the allocator process-wide. Implemented as a flag
    /// every public entry point checks first, the memory-safe-language
    /// equivalent of `mprotect`-ing the root record itself unreadable
    /// (see DESIGN.md).
    pub fn protect(&self) {
        self.protected.store(true, Ordering::SeqCst);
    }

    pub fn unprotect(&self) {
        self.protected.store(false, Ordering::SeqCst);
    }

    pub fn is_protected(&self) -> bool {
        self.protected.load(Ordering::SeqCst)
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut RootState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn with_big<R>(&self, f: impl FnOnce(&mut BigZoneList) -> R) -> R {
        f(&mut self.big.lock())
    }
}

lazy_static::lazy_static! {
    pub static ref ROOT: Root = Root::new();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_chunk_size_clamps_and_rounds() {
        assert_eq!(RootState::pick_chunk_size(1), SMALLEST_CHUNK_SZ);
        assert_eq!(RootState::pick_chunk_size(13), 16);
        assert_eq!(RootState::pick_chunk_size(MAX_DEFAULT_ZONE_SZ), MAX_DEFAULT_ZONE_SZ);
        assert_eq!(RootState::pick_chunk_size(MAX_DEFAULT_ZONE_SZ * 4), MAX_DEFAULT_ZONE_SZ);
    }

    #[test]
    fn default_zones_are_created_and_findable() {
        ROOT.with_state(|state| {
            for &size in DEFAULT_ZONE_CLASSES {
                assert!(state.size_table.lookup(size).is_some());
            }
        });
    }
}
