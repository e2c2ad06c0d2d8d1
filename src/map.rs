//! Thin wrappers around the OS paging primitives the allocator needs:
//! reserve/release address space, fault pages in, change protection,
//! and give the kernel usage hints. Everything here talks to `libc`
//! directly instead of shelling out to a C helper, since this crate
//! has no companion C sources.
use std::ffi::c_void;
use std::io;
use std::ptr::NonNull;

use crate::rng;

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("Unable to find page_size: errno={}", io::Error::last_os_error());
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Rounds `size` up to the next multiple of the page size.
#[inline]
pub fn page_round_up(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Draws a randomized, page-aligned address hint for `mmap`. Without
/// `MAP_FIXED` the kernel is free to ignore it and pick any other
/// address, so this only ever nudges placement, never dictates it.
/// Masked the same way as the original's `mmap_pages()` hint, which
/// keeps the hint within user space on every supported architecture
/// while leaving its low 12 bits (the page offset) zero.
fn random_mmap_hint() -> *mut c_void {
    (rng::next_u64() & 0x0000_3fff_ffff_f000) as usize as *mut c_void
}

/// Reserves an *address space* region of `size` bytes with no
/// read/write access (`PROT_NONE`). The size must be a multiple of
/// the page size. The returned region is later carved up with
/// [`protect`] calls to fault in the parts that are actually used,
/// so that guard pages on either side stay permanently inaccessible.
pub fn reserve(size: usize) -> Result<NonNull<c_void>, i32> {
    assert!(
        size > 0 && (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let ret = unsafe {
        libc::mmap(
            random_mmap_hint(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if ret == libc::MAP_FAILED {
        Err(errno())
    } else {
        NonNull::new(ret).ok_or(libc::EINVAL)
    }
}

/// Releases a region of `size` bytes starting at `base`, returning
/// the address space to the OS. The size must be a multiple of the
/// page size.
pub fn release(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let ret = unsafe { libc::munmap(base.as_ptr(), size) };

    if ret == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Changes the protection of a region of `size` bytes starting at
/// `base`. `writable` also implies readable; otherwise the region is
/// left entirely inaccessible (`PROT_NONE`), which is how guard pages
/// and retired zones are represented.
pub fn protect(base: NonNull<c_void>, size: usize, writable: bool) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let prot = if writable {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_NONE
    };

    let ret = unsafe { libc::mprotect(base.as_ptr(), size, prot) };

    if ret == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Tells the kernel this region will be used soon (`MADV_WILLNEED`).
/// Used to eagerly populate a zone's user pages when the
/// `prepopulate` feature is enabled.
pub fn advise_willneed(base: NonNull<c_void>, size: usize) {
    if size == 0 {
        return;
    }

    unsafe {
        libc::madvise(base.as_ptr(), size, libc::MADV_WILLNEED);
    }
}

/// Tells the kernel the contents of this region no longer matter
/// (`MADV_DONTNEED`), letting it reclaim the physical pages without
/// releasing the address space. Used when sanitizing/retiring a zone.
pub fn advise_dontneed(base: NonNull<c_void>, size: usize) {
    if size == 0 {
        return;
    }

    unsafe {
        libc::madvise(base.as_ptr(), size, libc::MADV_DONTNEED);
    }
}

/// Locks a region into physical memory (`mlock`), best-effort: a
/// failure here (e.g. `RLIMIT_MEMLOCK`) is not fatal to the caller.
pub fn mlock(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    let ret = unsafe { libc::mlock(base.as_ptr(), size) };

    if ret == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// A region reserved with a guard page immediately before and after
/// a read/write "body" in the middle, the shape every zone's user and
/// bitmap regions (and every big allocation's user and metadata
/// regions) are built from.
pub struct GuardedRegion {
    pub region_base: NonNull<c_void>,
    pub region_size: usize,
    pub body: NonNull<c_void>,
    pub body_size: usize,
}

/// Reserves `body_size` bytes of read/write memory bracketed by one
/// guard page on each side. `body_size` is rounded up to the page
/// size.
pub fn reserve_guarded(body_size: usize) -> Result<GuardedRegion, i32> {
    let page = page_size();
    let body_size = page_round_up(body_size.max(1));
    let region_size = body_size + 2 * page;

    let region_base = reserve(region_size)?;
    let body = NonNull::new((region_base.as_ptr() as usize + page) as *mut c_void)
        .ok_or(libc::EINVAL)?;

    if let Err(errno) = protect(body, body_size, true) {
        let _ = release(region_base, region_size);
        return Err(errno);
    }

    Ok(GuardedRegion {
        region_base,
        region_size,
        body,
        body_size,
    })
}

/// Releases a region previously returned by [`reserve_guarded`].
pub fn release_guarded(region: &GuardedRegion) -> Result<(), i32> {
    release(region.region_base, region.region_size)
}

#[cfg(all(target_os = "linux", feature = "cpu_pinning"))]
pub fn current_cpu() -> Option<i32> {
    let ret = unsafe { libc::sched_getcpu() };

    if ret < 0 {
        None
    } else {
        Some(ret)
    }
}

#[cfg(not(all(target_os = "linux", feature = "cpu_pinning")))]
pub fn current_cpu() -> Option<i32> {
    None
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);
    assert_eq!(page_size(), 4096);
}

#[test]
fn test_page_round_up() {
    let page = page_size();
    assert_eq!(page_round_up(1), page);
    assert_eq!(page_round_up(page), page);
    assert_eq!(page_round_up(page + 1), 2 * page);
}

// Simulate a reserve / guard-page / commit workflow: reserve a region
// three pages wide, leave the first and last pages as inaccessible
// guards, and fault in the middle page.
#[test]
fn smoke_test() {
    let page = page_size();
    let region_size = 3 * page;

    let base = reserve(region_size).expect("reserve should succeed");

    let middle = NonNull::new((base.as_ptr() as usize + page) as *mut c_void)
        .expect("should be non-null");

    protect(middle, page, true).expect("should be able to commit the middle page");

    unsafe {
        std::ptr::write_bytes(middle.as_ptr() as *mut u8, 0x41, page);
    }

    protect(middle, page, false).expect("should be able to decommit the middle page");
    release(base, region_size).expect("should release everything");
}

#[test]
fn test_reserve_guarded_body_is_writable() {
    let region = reserve_guarded(17).expect("reserve_guarded should succeed");
    assert_eq!(region.body_size, page_size());

    unsafe {
        std::ptr::write_bytes(region.body.as_ptr() as *mut u8, 0x5a, region.body_size);
    }

    release_guarded(&region).expect("should release");
}
