//! The big-allocation engine: allocations above `MAX_DEFAULT_ZONE_SZ`
//! are served individually, each from its own guard-bracketed mapping,
//! linked into a singly-linked list that is walked (and every entry's
//! canaries re-verified) on every allocation and on
//! `verify_all_zones`.
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::canary;
use crate::config::{BIG_SZ_MAX, POISON_BYTE};
use crate::map;

/// One big allocation's metadata. Kept in a `Box` so its address is
/// stable across the owning list's reallocations (see DESIGN.md for
/// the tradeoff against a separately-mapped metadata record).
struct BigZone {
    size: usize,
    free: bool,
    next_masked: u64,
    user_region_base: usize,
    user_region_size: usize,
    user_pages_start: usize,
    canary_a: u64,
    canary_b: u64,
}

impl BigZone {
    fn meta_addr(&self) -> usize {
        self as *const BigZone as usize
    }
}

/// The big-zone list plus the secret used to mask every `next` link,
/// and the (separate) secret used to compute canaries. Both secrets
/// live on the root and are passed in by the caller.
pub struct BigZoneList {
    entries: Vec<Box<BigZone>>,
    head_masked: u64,
    tail_masked: u64,
    next_mask: u64,
}

fn encode_link(idx: Option<usize>, mask: u64) -> u64 {
    let v = match idx {
        None => 0u64,
        Some(i) => (i as u64) + 1,
    };
    v ^ mask
}

fn decode_link(masked: u64, mask: u64) -> Option<usize> {
    let v = masked ^ mask;
    if v == 0 {
        None
    } else {
        Some((v - 1) as usize)
    }
}

impl BigZoneList {
    pub fn new(next_mask: u64) -> Self {
        Self {
            entries: Vec::new(),
            head_masked: encode_link(None, next_mask),
            tail_masked: encode_link(None, next_mask),
            next_mask,
        }
    }

    fn head(&self) -> Option<usize> {
        decode_link(self.head_masked, self.next_mask)
    }

    fn tail(&self) -> Option<usize> {
        decode_link(self.tail_masked, self.next_mask)
    }

    fn next_of(&self, idx: usize) -> Option<usize> {
        decode_link(self.entries[idx].next_masked, self.next_mask)
    }

    fn set_next(&mut self, idx: usize, next: Option<usize>) {
        self.entries[idx].next_masked = encode_link(next, self.next_mask);
    }

    fn verify_entry(&self, idx: usize, canary_secret: u64) -> Result<(), String> {
        let entry = &self.entries[idx];
        let expected = canary::compute_big(entry.meta_addr(), entry.user_pages_start, canary_secret);

        if entry.canary_a != expected || entry.canary_b != expected {
            return Err(format!(
                "big zone at 0x{:x} (size={}): canary corrupted",
                entry.user_pages_start, entry.size
            ));
        }

        Ok(())
    }

    /// Walks the whole list verifying every entry's canaries. Used by
    /// `verify_all_zones` and, implicitly, by every call to
    /// [`allocate`](Self::allocate).
    pub fn verify_all(&self, canary_secret: u64) -> Result<(), String> {
        let mut cur = self.head();
        while let Some(idx) = cur {
            self.verify_entry(idx, canary_secret)?;
            cur = self.next_of(idx);
        }
        Ok(())
    }

    /// Serves a big allocation request: reuse the first free entry
    /// whose size fits, else map a fresh user region and splice a new
    /// entry at the tail.
    pub fn allocate(
        &mut self,
        requested: usize,
        canary_secret: u64,
        populate: bool,
    ) -> Result<usize, &'static str> {
        if requested == 0 || requested > BIG_SZ_MAX {
            return Err("requested size is out of range for the big-allocation path");
        }

        let mut cur = self.head();
        while let Some(idx) = cur {
            self.verify_entry(idx, canary_secret)
                .map_err(|_| "big zone list canary mismatch")?;

            if self.entries[idx].free && self.entries[idx].size >= requested {
                self.entries[idx].free = false;
                return Ok(self.entries[idx].user_pages_start);
            }

            cur = self.next_of(idx);
        }

        let region = map::reserve_guarded(requested).map_err(|_| "failed to map big allocation")?;

        if populate {
            map::advise_willneed(region.body, region.body_size);
        }

        let idx = self.entries.len();
        let mut big = Box::new(BigZone {
            size: region.body_size,
            free: false,
            next_masked: encode_link(None, self.next_mask),
            user_region_base: region.region_base.as_ptr() as usize,
            user_region_size: region.region_size,
            user_pages_start: region.body.as_ptr() as usize,
            canary_a: 0,
            canary_b: 0,
        });

        let canary = canary::compute_big(big.meta_addr(), big.user_pages_start, canary_secret);
        big.canary_a = canary;
        big.canary_b = canary;

        let user_pages_start = big.user_pages_start;
        self.entries.push(big);

        match self.tail() {
            Some(tail) => self.set_next(tail, Some(idx)),
            None => self.head_masked = encode_link(Some(idx), self.next_mask),
        }
        self.tail_masked = encode_link(Some(idx), self.next_mask);

        map::advise_willneed(
            NonNull::new(user_pages_start as *mut c_void).expect("mmap never returns null"),
            self.entries[idx].size,
        );

        Ok(user_pages_start)
    }

    fn find_by_addr(&self, addr: usize) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.user_pages_start == addr)
    }

    /// Marks the entry owning `addr` free again so a future
    /// `allocate` can reuse it; the mapping itself is kept resident
    /// rather than returned to the OS.
    pub fn free(&mut self, addr: usize, canary_secret: u64) -> Result<(), &'static str> {
        let idx = self.find_by_addr(addr).ok_or("address not owned by any big zone")?;

        self.verify_entry(idx, canary_secret)
            .map_err(|_| "big zone canary mismatch on free")?;

        if self.entries[idx].free {
            return Err("double free of big allocation");
        }

        if cfg!(feature = "sanitize_on_free") {
            let entry = &self.entries[idx];
            unsafe {
                std::ptr::write_bytes(entry.user_pages_start as *mut u8, POISON_BYTE, entry.size);
            }
        }

        self.entries[idx].free = true;
        Ok(())
    }

    /// Unmaps a big allocation's user region entirely and removes it
    /// from reuse consideration, for `free_permanent`.
    pub fn free_permanent(&mut self, addr: usize, canary_secret: u64) -> Result<(), &'static str> {
        let idx = self.find_by_addr(addr).ok_or("address not owned by any big zone")?;
        self.verify_entry(idx, canary_secret)
            .map_err(|_| "big zone canary mismatch on free")?;

        let entry = &self.entries[idx];

        // Permanent free always sanitizes, unlike the regular free
        // path above which only does so under `sanitize_on_free`.
        unsafe {
            std::ptr::write_bytes(entry.user_pages_start as *mut u8, POISON_BYTE, entry.size);
        }

        if let Some(base) = NonNull::new(entry.user_region_base as *mut c_void) {
            let _ = map::protect(base, entry.user_region_size, false);
        }

        self.entries[idx].free = true;
        self.entries[idx].size = 0;
        Ok(())
    }

    pub fn size_of(&self, addr: usize) -> Option<usize> {
        let idx = self.find_by_addr(addr)?;
        if self.entries[idx].free {
            None
        } else {
            Some(self.entries[idx].size)
        }
    }

    pub fn owns(&self, addr: usize) -> bool {
        self.find_by_addr(addr).map_or(false, |i| !self.entries[i].free)
    }

    /// Bytes currently held by non-free big allocations.
    pub fn mem_usage(&self) -> usize {
        self.entries.iter().filter(|e| !e.free).map(|e| e.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_reuse() {
        let mut list = BigZoneList::new(0xabcd_ef01_2345_6789);
        let secret = 0x1111_2222_3333_4444;

        let p1 = list.allocate(9000, secret, false).expect("should allocate");
        list.free(p1, secret).expect("should free");

        let p2 = list.allocate(9000, secret, false).expect("should reuse");
        assert_eq!(p1, p2);
        assert_eq!(list.entries.len(), 1);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut list = BigZoneList::new(0xaaaa);
        let secret = 0xbbbb;

        let p = list.allocate(8192, secret, false).unwrap();
        list.free(p, secret).unwrap();
        assert!(list.free(p, secret).is_err());
    }

    #[test]
    fn canary_corruption_detected() {
        let mut list = BigZoneList::new(0xaaaa);
        let secret = 0xbbbb;

        let p = list.allocate(8192, secret, false).unwrap();
        list.entries[0].canary_a ^= 1;
        assert!(list.free(p, secret).is_err());
    }
}
