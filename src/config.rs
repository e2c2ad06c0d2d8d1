//! Compile-time knobs for the allocator, gathered in one place. The
//! `test_only_small_constants` feature shrinks a handful of them so
//! property tests can exhaust more of the state space without mapping
//! hundreds of megabytes per run.

/// Bytes held by every zone's user region before guard pages.
#[cfg(not(feature = "test_only_small_constants"))]
pub const ZONE_USER_SIZE: usize = 4 * 1024 * 1024;
#[cfg(feature = "test_only_small_constants")]
pub const ZONE_USER_SIZE: usize = 64 * 1024;

/// Smallest chunk size a default zone is created for.
pub const SMALLEST_CHUNK_SZ: usize = 16;

/// Largest chunk size a *default* zone is created for. Requests above
/// this go through the big-allocation path unless a private zone of a
/// larger class is created explicitly.
pub const MAX_DEFAULT_ZONE_SZ: usize = 8192;

/// All chunk pointers and chunk sizes are multiples of this.
pub const ALIGNMENT: usize = 16;

/// Default zone size classes created at startup.
#[cfg(not(feature = "small_mem_startup"))]
pub const DEFAULT_ZONE_CLASSES: &[usize] = &[
    16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192,
];
#[cfg(feature = "small_mem_startup")]
pub const DEFAULT_ZONE_CLASSES: &[usize] = &[64, 256, 512, 1024];

/// Maximum number of zones (default + private) the root can track.
#[cfg(not(feature = "test_only_small_constants"))]
pub const MAX_ZONES: usize = 8192;
#[cfg(feature = "test_only_small_constants")]
pub const MAX_ZONES: usize = 64;

/// One in `CANARY_COUNT_DIV` chunks in a zone is reserved as a canary
/// chunk.
pub const CANARY_COUNT_DIV: u64 = 100;

/// A zone is eligible for retirement once its lifetime allocation
/// count reaches `chunk_count * ZONE_ALLOC_RETIRE` and every chunk is
/// currently free.
pub const ZONE_ALLOC_RETIRE: u64 = 32;

/// Per-thread free-slot cache capacity.
pub const BIT_SLOT_CACHE_SZ: usize = 255;

/// Sentinel meaning "no cached slot" / "scan failed".
pub const BAD_BIT_SLOT: u64 = u64::MAX;

/// Per-thread zone-cache (MRU hint) capacity.
pub const ZONE_CACHE_SZ: usize = 8;

/// Per-thread quarantine capacity before a chunk is handed back to
/// its zone.
#[cfg(not(feature = "test_only_small_constants"))]
pub const CHUNK_QUARANTINE_SZ: usize = 64;
#[cfg(feature = "test_only_small_constants")]
pub const CHUNK_QUARANTINE_SZ: usize = 4;

/// Byte written over freed chunk contents when `sanitize_on_free` is
/// enabled.
pub const POISON_BYTE: u8 = 0xde;

/// Masks off the top byte of a computed canary value so canaries
/// written as adjacent bytes never straddle a pointer-tag bit some
/// platforms reserve there.
pub const CANARY_VALIDATE_MASK: u64 = 0x00ff_ffff_ffff_ffff;

/// `is_zone_usable`'s proportional-waste rule: a zone
/// above `ZONE_1024` chunk size is only considered for a request if
/// `chunk_size <= request_size << WASTED_SZ_MULTIPLIER_SHIFT` would
/// not be satisfied, i.e. the zone must not waste more than a
/// `2^WASTED_SZ_MULTIPLIER_SHIFT` factor of memory.
pub const WASTED_SZ_MULTIPLIER_SHIFT: u32 = 4;

/// Threshold above which `is_zone_usable`'s proportional-waste rule
/// kicks in; below it, any zone whose chunk size fits is acceptable.
pub const ZONE_1024: usize = 1024;

/// Sanity ceiling on a single big allocation, to keep size arithmetic
/// from silently wrapping. Chosen generously (1 TiB) since the
/// big-allocation path is otherwise unbounded except by address space
/// and `mmap` itself.
pub const BIG_SZ_MAX: usize = 1usize << 40;

/// Extra page count (on top of `size`) `mmap`'d for a big allocation's
/// user region: one leading and one trailing guard page.
pub const BIG_ZONE_USER_PAGE_COUNT_SHIFT: u32 = 1;

/// Page count `mmap`'d for a big allocation's metadata: one guard
/// page, the metadata page itself, and one more guard page.
pub const BIG_ZONE_META_DATA_PAGE_COUNT: usize = 3;

/// One-in-N odds used by the `uaf_ptr_page` sentinel sweep. Inert
/// unless that feature is enabled.
pub const UAF_PTR_PAGE_ODDS: u64 = 1_000_000;

static_assertions::const_assert!(SMALLEST_CHUNK_SZ.is_power_of_two());
static_assertions::const_assert!(MAX_DEFAULT_ZONE_SZ.is_power_of_two());
static_assertions::const_assert!(SMALLEST_CHUNK_SZ <= MAX_DEFAULT_ZONE_SZ);
static_assertions::const_assert!(ALIGNMENT.is_power_of_two());
static_assertions::const_assert!(BIT_SLOT_CACHE_SZ > 0);
static_assertions::const_assert!(ZONE_CACHE_SZ > 0);
static_assertions::const_assert!(MAX_ZONES > 0);
