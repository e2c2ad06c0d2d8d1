//! A `Zone` owns one power-of-two chunk size: a guard-bracketed user
//! region, a guard-bracketed bitmap tracking two bits per chunk, a
//! free-slot cache, and the per-zone canary secret and pointer mask.
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

use std::collections::VecDeque;

use crate::canary;
use crate::config::*;
use crate::map;
use crate::rng;

/// Chunk never allocated: bitmap pair `00`.
const FREE_NEVER_USED: u64 = 0b00;
/// Chunk freed at least once, canary present: bitmap pair `01`.
const FREE_PREV_USED: u64 = 0b01;
/// Chunk currently handed out: bitmap pair `10`.
const IN_USE: u64 = 0b10;
/// Permanent tripwire chunk, never handed out: bitmap pair `11`.
const CANARY_CHUNK: u64 = 0b11;

#[inline]
fn pair_at(word: u64, bit_in_word: usize) -> u64 {
    (word >> bit_in_word) & 0b11
}

#[inline]
fn set_pair(word: u64, bit_in_word: usize, pair: u64) -> u64 {
    (word & !(0b11u64 << bit_in_word)) | (pair << bit_in_word)
}

/// One size-class zone. All pointer-valued fields are stored XOR'd
/// with `pointer_mask` so a stray read of the struct (e.g. through a
/// corrupted adjacent allocation) does not disclose mapping
/// addresses; every access goes through an unmask accessor first.
pub struct Zone {
    pub chunk_size: usize,
    chunk_count: usize,
    bitmap_words: usize,

    user_region_base_masked: u64,
    user_region_size: usize,
    user_pages_start_masked: u64,

    bitmap_region_base_masked: u64,
    bitmap_region_size: usize,
    bitmap_start_masked: u64,

    pub index: usize,
    /// Next zone in this chunk size's chain, or `None` at the end.
    /// The original design uses array index `0` as its end-of-chain
    /// sentinel; this crate uses `Option` instead since Rust has no
    /// reason to reserve zone-array slot `0` as unusable.
    pub next_sz_index: Option<usize>,
    pub internal: bool,
    is_full: bool,

    next_free_bit_slot: Option<u64>,
    free_bit_slot_cache: VecDeque<u64>,

    af_count: u64,
    alloc_count: u64,

    canary_secret: u64,
    pointer_mask: u64,

    cpu_core: Option<i32>,
}

fn map_guarded(body_size: usize) -> Result<map::GuardedRegion, &'static str> {
    map::reserve_guarded(body_size).map_err(|_| "failed to map guarded region")
}

impl Zone {
    /// Creates a new zone for `chunk_size` at array position `index`.
    /// `chunk_size` must already be a power of two clamped to
    /// `[SMALLEST_CHUNK_SZ, MAX_DEFAULT_ZONE_SZ]`, enforced by the
    /// caller, `root::pick_chunk_size`.
    #[requires(chunk_size.is_power_of_two())]
    #[requires(chunk_size >= SMALLEST_CHUNK_SZ && chunk_size <= MAX_DEFAULT_ZONE_SZ)]
    pub fn create(chunk_size: usize, index: usize, internal: bool) -> Result<Zone, &'static str> {
        let chunk_count = ZONE_USER_SIZE / chunk_size;
        let bitmap_bytes = (chunk_count * 2 / 8).max(8);
        let bitmap_words = bitmap_bytes / 8;

        let bitmap_region = map_guarded(bitmap_bytes)?;
        let user_region = map_guarded(ZONE_USER_SIZE)?;

        #[cfg(feature = "prepopulate")]
        map::advise_willneed(user_region.body, user_region.body_size);

        let pointer_mask = rng::next_u64();
        let canary_secret = rng::next_u64();

        let mut zone = Zone {
            chunk_size,
            chunk_count,
            bitmap_words,
            user_region_base_masked: (user_region.region_base.as_ptr() as u64) ^ pointer_mask,
            user_region_size: user_region.region_size,
            user_pages_start_masked: (user_region.body.as_ptr() as u64) ^ pointer_mask,
            bitmap_region_base_masked: (bitmap_region.region_base.as_ptr() as u64) ^ pointer_mask,
            bitmap_region_size: bitmap_region.region_size,
            bitmap_start_masked: (bitmap_region.body.as_ptr() as u64) ^ pointer_mask,
            index,
            next_sz_index: None,
            internal,
            is_full: false,
            next_free_bit_slot: None,
            free_bit_slot_cache: VecDeque::with_capacity(BIT_SLOT_CACHE_SZ),
            af_count: 0,
            alloc_count: 0,
            canary_secret,
            pointer_mask,
            cpu_core: map::current_cpu(),
        };

        zone.place_canary_chunks();
        zone.refill_cache();

        Ok(zone)
    }

    fn user_pages_start(&self) -> usize {
        (self.user_pages_start_masked ^ self.pointer_mask) as usize
    }

    /// Exposes the (unmasked) base address so the root can register
    /// it in the address→zone lookup table.
    pub(crate) fn user_pages_start_for_registration(&self) -> usize {
        self.user_pages_start()
    }

    fn bitmap_start(&self) -> usize {
        (self.bitmap_start_masked ^ self.pointer_mask) as usize
    }

    fn user_region_base(&self) -> usize {
        (self.user_region_base_masked ^ self.pointer_mask) as usize
    }

    fn bitmap_region_base(&self) -> usize {
        (self.bitmap_region_base_masked ^ self.pointer_mask) as usize
    }

    /// True if `addr` lies within this zone's user region: every
    /// returned pointer `p` satisfies
    /// `user_pages_start <= p < user_pages_start + ZONE_USER_SIZE`.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.user_pages_start();
        addr >= start && addr < start + ZONE_USER_SIZE
    }

    fn word_ptr(&self, word_idx: usize) -> *mut u64 {
        debug_assert!(word_idx < self.bitmap_words);
        (self.bitmap_start() as *mut u64).wrapping_add(word_idx)
    }

    fn read_word(&self, word_idx: usize) -> u64 {
        unsafe { std::ptr::read(self.word_ptr(word_idx)) }
    }

    fn write_word(&self, word_idx: usize, value: u64) {
        unsafe { std::ptr::write(self.word_ptr(word_idx), value) }
    }

    fn chunk_ptr(&self, bit_slot: u64) -> usize {
        let chunk_index = (bit_slot >> 1) as usize;
        self.user_pages_start() + chunk_index * self.chunk_size
    }

    /// Translates a user address back to its bit-slot, validating
    /// alignment and zone membership.
    pub fn bit_slot_for_addr(&self, addr: usize) -> Option<u64> {
        if !self.contains(addr) {
            return None;
        }

        let offset = addr - self.user_pages_start();
        if offset % self.chunk_size != 0 {
            return None;
        }

        let chunk_index = offset / self.chunk_size;
        if chunk_index >= self.chunk_count {
            return None;
        }

        Some((chunk_index as u64) << 1)
    }

    fn pair_for(&self, bit_slot: u64) -> u64 {
        let word_idx = (bit_slot as usize) / 64;
        let bit_in_word = (bit_slot as usize) % 64;
        pair_at(self.read_word(word_idx), bit_in_word)
    }

    fn set_pair_for(&self, bit_slot: u64, pair: u64) {
        let word_idx = (bit_slot as usize) / 64;
        let bit_in_word = (bit_slot as usize) % 64;
        let word = self.read_word(word_idx);
        self.write_word(word_idx, set_pair(word, bit_in_word, pair));
    }

    /// Marks `chunk_count / CANARY_COUNT_DIV` random chunks as
    /// permanent canary chunks at zone-creation time. Collisions
    /// (re-picking an already-canary chunk) are tolerated; the actual
    /// canary count may come in under target.
    fn place_canary_chunks(&mut self) {
        let target = (self.chunk_count as u64 / CANARY_COUNT_DIV).max(1);

        for _ in 0..target {
            let chunk_index = rng::next_below(self.chunk_count as u64);
            let bit_slot = chunk_index << 1;

            if self.pair_for(bit_slot) == CANARY_CHUNK {
                continue;
            }

            self.set_pair_for(bit_slot, CANARY_CHUNK);
            let ptr = self.chunk_ptr(bit_slot) as *mut u8;
            let canary = canary::compute(self.canary_secret, ptr as usize);
            unsafe {
                canary::write(ptr, self.chunk_size, canary);
            }
        }
    }

    /// Refills the free-slot cache by scanning the bitmap starting at
    /// a random word, wrapping once, and stopping once
    /// `BIT_SLOT_CACHE_SZ + 1` free slots have been found or the scan
    /// has covered every chunk. A zero word is a fast path: every
    /// chunk it covers is free-never-used.
    fn refill_cache(&mut self) {
        let mut found: Vec<u64> = Vec::with_capacity(BIT_SLOT_CACHE_SZ + 1);
        let start_word = rng::next_below(self.bitmap_words as u64) as usize;

        'scan: for step in 0..self.bitmap_words {
            let word_idx = (start_word + step) % self.bitmap_words;
            let word = self.read_word(word_idx);

            if word == FREE_NEVER_USED {
                for sub in 0..32 {
                    let chunk_index = word_idx * 32 + sub;
                    if chunk_index >= self.chunk_count {
                        break;
                    }
                    found.push((chunk_index as u64) << 1);
                    if found.len() > BIT_SLOT_CACHE_SZ {
                        break 'scan;
                    }
                }
                continue;
            }

            for sub in 0..32 {
                let chunk_index = word_idx * 32 + sub;
                if chunk_index >= self.chunk_count {
                    break;
                }
                let pair = pair_at(word, sub * 2);
                if pair == FREE_NEVER_USED || pair == FREE_PREV_USED {
                    found.push((chunk_index as u64) << 1);
                    if found.len() > BIT_SLOT_CACHE_SZ {
                        break 'scan;
                    }
                }
            }
        }

        #[cfg(feature = "shuffle_bit_slot_cache")]
        {
            // Fisher-Yates.
            for i in (1..found.len()).rev() {
                let j = rng::next_below((i + 1) as u64) as usize;
                found.swap(i, j);
            }
        }

        #[cfg(feature = "verify_bit_slot_cache")]
        {
            let mut sorted = found.clone();
            sorted.sort_unstable();
            sorted.dedup();
            debug_assert_eq!(sorted.len(), found.len(), "duplicate bit-slot in refill");
        }

        self.next_free_bit_slot = found.first().copied();
        self.free_bit_slot_cache = found.into_iter().skip(1).collect();
    }

    fn consume_free_bit_slot(&mut self) -> Option<u64> {
        let slot = self.next_free_bit_slot.take()?;
        self.next_free_bit_slot = self.free_bit_slot_cache.pop_front();
        Some(slot)
    }

    fn push_free_bit_slot(&mut self, slot: u64) {
        if self.next_free_bit_slot.is_none() {
            self.next_free_bit_slot = Some(slot);
            return;
        }

        if self.free_bit_slot_cache.len() < BIT_SLOT_CACHE_SZ {
            self.free_bit_slot_cache.push_back(slot);
        }
        // Full: the slot is dropped and will be rediscovered the next
        // time the cache is refilled.
    }

    /// Whether this zone currently has no cached free slot and a scan
    /// found none either. Sticky until the next free.
    pub fn is_full(&self) -> bool {
        self.is_full
    }

    pub fn af_count(&self) -> u64 {
        self.af_count
    }

    pub fn alloc_count(&self) -> u64 {
        self.alloc_count
    }

    /// Bytes currently handed out by this zone.
    pub fn mem_usage(&self) -> usize {
        self.af_count as usize * self.chunk_size
    }

    /// Bytes this zone's mappings occupy in the address space
    /// (user region + bitmap region, guard pages included).
    pub fn mapped_bytes(&self) -> usize {
        self.user_region_size + self.bitmap_region_size
    }

    /// Whether this zone may serve a request of `requested` bytes.
    /// CPU pinning is checked separately by the caller, which has
    /// access to the calling thread's core.
    pub fn does_zone_fit(&self, requested: usize) -> bool {
        if !self.internal {
            return false;
        }

        if self.is_full {
            return false;
        }

        if self.chunk_size < requested {
            return false;
        }

        // Anti-waste: a zone this large is not worth using for a
        // tiny request.
        if self.chunk_size >= ZONE_1024 && requested <= 128 {
            return false;
        }

        if requested > ZONE_1024
            && self.chunk_size >= (requested << WASTED_SZ_MULTIPLIER_SHIFT)
        {
            return false;
        }

        true
    }

    #[cfg(feature = "cpu_pinning")]
    pub fn fits_current_cpu(&self) -> bool {
        match (self.cpu_core, map::current_cpu()) {
            (Some(zone_cpu), Some(current)) => zone_cpu == current,
            _ => true,
        }
    }

    #[cfg(not(feature = "cpu_pinning"))]
    pub fn fits_current_cpu(&self) -> bool {
        true
    }

    /// Allocates a chunk. Returns `Ok(None)` if the zone has no free
    /// slot (caller marks it full and tries the next zone); `Err` on
    /// bitmap/canary corruption, which is fatal.
    #[ensures(ret.as_ref().ok().and_then(|o| *o).map_or(true, |p| self.contains(p)), "A returned chunk always lies within this zone's user region.")]
    pub fn allocate_chunk(&mut self) -> Result<Option<usize>, &'static str> {
        let bit_slot = match self.consume_free_bit_slot() {
            Some(slot) => slot,
            None => {
                self.refill_cache();
                match self.consume_free_bit_slot() {
                    Some(slot) => slot,
                    None => {
                        self.is_full = true;
                        return Ok(None);
                    }
                }
            }
        };

        let pair = self.pair_for(bit_slot);
        if pair == IN_USE || pair == CANARY_CHUNK {
            return Err("free-slot cache handed out an already-allocated bit-slot");
        }

        let ptr = self.chunk_ptr(bit_slot);

        if pair == FREE_PREV_USED {
            unsafe {
                canary::verify(self.canary_secret, ptr as *const u8, self.chunk_size)?;
            }
        }

        self.set_pair_for(bit_slot, IN_USE);
        self.af_count += 1;
        self.alloc_count += 1;

        Ok(Some(ptr))
    }

    fn verify_neighbours(&self, bit_slot: u64) -> Result<(), &'static str> {
        let chunk_index = (bit_slot >> 1) as i64;

        for neighbour in [chunk_index - 1, chunk_index + 1] {
            if neighbour < 0 || neighbour as usize >= self.chunk_count {
                continue;
            }

            let neighbour_slot = (neighbour as u64) << 1;
            let pair = self.pair_for(neighbour_slot);

            if pair == FREE_PREV_USED || pair == CANARY_CHUNK {
                let ptr = self.chunk_ptr(neighbour_slot) as *const u8;
                unsafe {
                    canary::verify(self.canary_secret, ptr, self.chunk_size)?;
                }
            }
        }

        Ok(())
    }

    /// Frees a chunk at `addr`. `permanent` leaves the history bit set
    /// so the slot behaves as a canary chunk forever.
    #[requires(addr != 0, "Callers must filter out null before reaching the zone engine.")]
    pub fn free_chunk(&mut self, addr: usize, permanent: bool) -> Result<(), &'static str> {
        let bit_slot = self
            .bit_slot_for_addr(addr)
            .ok_or("pointer is misaligned or outside the zone's user region")?;

        let pair = self.pair_for(bit_slot);
        if pair == FREE_NEVER_USED || pair == FREE_PREV_USED {
            return Err("double free");
        }
        if pair == CANARY_CHUNK {
            return Err("free of a canary chunk");
        }

        self.set_pair_for(bit_slot, if permanent { CANARY_CHUNK } else { FREE_PREV_USED });

        let ptr = self.chunk_ptr(bit_slot) as *mut u8;

        // Permanent frees always sanitize; a regular free only does so
        // when `sanitize_on_free` is enabled.
        if permanent || cfg!(feature = "sanitize_on_free") {
            unsafe {
                std::ptr::write_bytes(ptr, POISON_BYTE, self.chunk_size);
            }
        }

        let canary = canary::compute(self.canary_secret, ptr as usize);
        unsafe {
            canary::write(ptr, self.chunk_size, canary);
        }

        self.af_count = self.af_count.saturating_sub(1);

        if !permanent {
            self.push_free_bit_slot(bit_slot);
            self.is_full = false;
        }

        self.verify_neighbours(bit_slot)?;

        Ok(())
    }

    /// Preserves the literal `chunk_size < 2 * MAX_DEFAULT_ZONE_SZ`
    /// comparison; see DESIGN.md for the reasoning.
    pub fn is_retirement_eligible(&self) -> bool {
        self.af_count == 0
            && self.alloc_count > (self.chunk_count as u64) * ZONE_ALLOC_RETIRE
            && self.internal
            && self.chunk_size < 2 * MAX_DEFAULT_ZONE_SZ
    }

    /// Unmaps and remaps this zone's regions fresh, at the same array
    /// index and chunk size.
    pub fn rebuild(&mut self) -> Result<(), &'static str> {
        let fresh = Zone::create(self.chunk_size, self.index, self.internal)?;
        // Assignment drops the old zone (and so unmaps its regions)
        // before the fresh one takes its place.
        *self = fresh;
        Ok(())
    }

    fn unmap_regions(&self) {
        let user_base = self.user_region_base();
        let bitmap_base = self.bitmap_region_base();

        if let Some(base) = std::ptr::NonNull::new(user_base as *mut std::ffi::c_void) {
            map::advise_dontneed(base, self.user_region_size);
            let _ = map::release(base, self.user_region_size);
        }
        if let Some(base) = std::ptr::NonNull::new(bitmap_base as *mut std::ffi::c_void) {
            map::advise_dontneed(base, self.bitmap_region_size);
            let _ = map::release(base, self.bitmap_region_size);
        }
    }

    /// Destroys a private zone without replacing it: zero the bitmap
    /// and user pages, rebuild canaries and the free-slot cache, and
    /// (optionally, via `never_reuse_zones`) render both ranges
    /// permanently inaccessible.
    pub fn destroy_private(&mut self, never_reuse: bool) -> Result<(), &'static str> {
        unsafe {
            std::ptr::write_bytes(self.user_pages_start() as *mut u8, 0, ZONE_USER_SIZE);
            std::ptr::write_bytes(
                self.bitmap_start() as *mut u8,
                0,
                self.bitmap_words * 8,
            );
        }

        self.af_count = 0;
        self.alloc_count = 0;
        self.is_full = false;
        self.next_free_bit_slot = None;
        self.free_bit_slot_cache.clear();

        self.place_canary_chunks();
        self.refill_cache();

        if never_reuse {
            if let Some(base) = std::ptr::NonNull::new(self.user_pages_start() as *mut std::ffi::c_void) {
                let _ = map::protect(base, ZONE_USER_SIZE, false);
            }
            if let Some(base) = std::ptr::NonNull::new(self.bitmap_start() as *mut std::ffi::c_void) {
                let _ = map::protect(base, self.bitmap_words * 8, false);
            }
        }

        Ok(())
    }

    /// Verifies every canary-bearing chunk's integrity. Returns the
    /// first mismatch found.
    pub fn verify(&self) -> Result<(), String> {
        for chunk_index in 0..self.chunk_count {
            let bit_slot = (chunk_index as u64) << 1;
            let pair = self.pair_for(bit_slot);

            if pair == FREE_PREV_USED || pair == CANARY_CHUNK {
                let ptr = self.chunk_ptr(bit_slot) as *const u8;
                unsafe {
                    canary::verify(self.canary_secret, ptr, self.chunk_size).map_err(|e| {
                        format!(
                            "zone index={} chunk_size={} chunk_index={}: {}",
                            self.index, self.chunk_size, chunk_index, e
                        )
                    })?;
                }
            }
        }

        Ok(())
    }
}

impl Drop for Zone {
    fn drop(&mut self) {
        self.unmap_regions();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_alloc_free_cycle() {
        let mut zone = Zone::create(64, 1, true).expect("zone should map");
        assert_eq!(zone.chunk_size, 64);

        let ptr = zone.allocate_chunk().unwrap().expect("should have free slots");
        assert!(zone.contains(ptr));
        assert_eq!(zone.af_count(), 1);

        zone.free_chunk(ptr, false).expect("free should succeed");
        assert_eq!(zone.af_count(), 0);

        // Re-allocating should succeed and must verify/erase the
        // canary left behind by the free.
        let ptr2 = zone.allocate_chunk().unwrap().expect("slot should be reusable");
        assert_eq!(ptr, ptr2);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut zone = Zone::create(64, 1, true).expect("zone should map");
        let ptr = zone.allocate_chunk().unwrap().unwrap();
        zone.free_chunk(ptr, false).unwrap();
        assert!(zone.free_chunk(ptr, false).is_err());
    }

    #[test]
    fn out_of_range_pointer_is_rejected() {
        let zone = Zone::create(64, 1, true).expect("zone should map");
        assert_eq!(zone.bit_slot_for_addr(zone.user_pages_start() - 8), None);
        assert_eq!(zone.bit_slot_for_addr(zone.user_pages_start() + 3), None);
    }

    #[test]
    fn canary_corruption_is_detected_on_verify() {
        let mut zone = Zone::create(64, 1, true).expect("zone should map");
        let ptr = zone.allocate_chunk().unwrap().unwrap();
        zone.free_chunk(ptr, false).unwrap();

        unsafe {
            *(ptr as *mut u8) ^= 0xff;
        }

        assert!(zone.verify().is_err());
    }

    #[test]
    fn does_zone_fit_rejects_tiny_requests_in_big_zones() {
        let zone = Zone::create(4096, 1, true).expect("zone should map");
        assert!(!zone.does_zone_fit(32));
        assert!(zone.does_zone_fit(4096));
    }

    // Alloc/free the same slot in strict alternation until the
    // lifetime allocation count crosses `chunk_count * ZONE_ALLOC_RETIRE`
    // while af_count is back at 0, then rebuild should reset both
    // counters and hand out a fresh zone at the same index and chunk
    // size.
    #[test]
    fn zone_becomes_retirement_eligible_after_many_cycles() {
        let mut zone = Zone::create(MAX_DEFAULT_ZONE_SZ, 3, true).expect("zone should map");
        let chunk_count = ZONE_USER_SIZE / MAX_DEFAULT_ZONE_SZ;
        let cycles = chunk_count as u64 * ZONE_ALLOC_RETIRE + 1;

        for _ in 0..cycles {
            let ptr = zone.allocate_chunk().unwrap().expect("slot should be reusable");
            zone.free_chunk(ptr, false).unwrap();
        }

        assert_eq!(zone.af_count(), 0);
        assert!(zone.is_retirement_eligible());

        zone.rebuild().expect("rebuild should succeed");
        assert_eq!(zone.af_count(), 0);
        assert_eq!(zone.alloc_count(), 0);
        assert_eq!(zone.index, 3);
        assert_eq!(zone.chunk_size, MAX_DEFAULT_ZONE_SZ);
        assert!(!zone.is_retirement_eligible());
    }

    use proptest::prelude::*;

    proptest! {
        // Bulk allocate, then release and re-allocate in a
        // pseudo-random order, checking that every live pointer stays
        // unique and that the chunk count never exceeds the zone's
        // capacity.
        #[test]
        fn random_order_alloc_free_never_aliases(
            indices in proptest::collection::vec(0..16usize, 1..80)
        ) {
            let mut zone = Zone::create(128, 5, true).expect("zone should map");
            let mut slots: Vec<Option<usize>> = Vec::new();
            slots.resize_with(16, || zone.allocate_chunk().unwrap());

            for index in indices {
                match slots[index].take() {
                    Some(ptr) => zone.free_chunk(ptr, false).unwrap(),
                    None => {
                        let ptr = zone.allocate_chunk().unwrap();
                        if let Some(p) = ptr {
                            prop_assert!(slots.iter().all(|s| *s != Some(p)));
                        }
                        slots[index] = ptr;
                    }
                }
            }

            for slot in slots.into_iter().flatten() {
                zone.free_chunk(slot, false).unwrap();
            }
        }
    }
}
