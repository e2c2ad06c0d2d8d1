//! A hardened, zone-isolated general-purpose allocator.
//!
//! Requests are served from size-class **zones**: fixed chunk sizes
//! from 16 bytes up to a configurable maximum (8192 bytes by
//! default), each zone a guard-page-bracketed region tracked by an
//! explicit bitmap rather than in-band metadata. Requests above that
//! maximum go through a separate big-allocation path, one mapping per
//! request. Every chunk that has ever been freed carries a per-zone
//! canary at both ends, checked on reuse and on every free of a
//! neighbouring chunk, so a linear overflow is caught instead of
//! silently corrupting the next allocation.
//!
//! See `alloc::alloc`/`free`/`calloc`/`realloc` for the general
//! surface, and `alloc::new_private_zone` for allocations that should
//! never be satisfied by (or visible to) anyone else's `alloc` calls.
mod abort;
mod big;
mod cache;
mod canary;
pub mod config;
mod lock;
mod lookup;
mod map;
mod rng;
mod root;
mod zone;

pub mod alloc;

pub use alloc::{
    alloc as allocate, calloc, chunk_size, flush_caches, free, free_permanent, free_with_size,
    mem_usage, new_private_zone, protect_root, realloc, unprotect_root, verify_all_zones,
    verify_zone, PrivateZone,
};

/// Deterministic init entry point, in addition to the lazy
/// initialization guard every other entry point falls back on.
/// Calling this is optional — the root initialises lazily on first
/// use — but embedders that want to pay the startup cost (mapping the
/// default zones) at a known point may call it explicitly.
pub fn init() {
    lazy_static::initialize(&root::ROOT);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }
}
