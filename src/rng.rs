//! A small, fast, non-cryptographic 64-bit PRNG used for canary
//! secrets, zone pointer masks, mapping hints, and free-slot cache
//! shuffling. One `next_u64()` leaf that every other module calls,
//! seeded from OS entropy at process start.
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

fn os_entropy_u64() -> u64 {
    let mut buf = [0u8; 8];
    let ret = unsafe { libc::getrandom(buf.as_mut_ptr() as *mut _, buf.len(), 0) };

    if ret == buf.len() as isize {
        u64::from_ne_bytes(buf)
    } else {
        // getrandom is unavailable (e.g. sandboxed/old kernel): fall
        // back to address-space layout and the clock as a seed. This
        // is not used for anything except making the generator's
        // initial state unpredictable across runs.
        let stack_addr = &buf as *const _ as u64;
        let time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        stack_addr ^ time ^ 0x9e37_79b9_7f4a_7c15
    }
}

/// xorshift64* — small state, good enough statistical quality for
/// canary/mask values, and fast enough to call on every allocation.
#[inline]
fn xorshift64star(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    *state = x;
    x.wrapping_mul(0x2545_f491_4f6c_dd1d)
}

static GLOBAL_SEED: AtomicU64 = AtomicU64::new(0);

fn global_seed() -> u64 {
    loop {
        let current = GLOBAL_SEED.load(Ordering::Relaxed);
        if current != 0 {
            return current;
        }

        let seed = os_entropy_u64() | 1;
        if GLOBAL_SEED
            .compare_exchange(0, seed, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return seed;
        }
    }
}

thread_local! {
    static STATE: Cell<u64> = Cell::new(0);
}

/// Returns the next pseudo-random 64-bit value from a per-thread
/// generator, lazily seeded from a process-wide seed mixed with the
/// thread's own address so sibling threads don't share a stream.
pub fn next_u64() -> u64 {
    STATE.with(|cell| {
        let mut state = cell.get();

        if state == 0 {
            state = global_seed() ^ (&cell as *const _ as u64);
            if state == 0 {
                state = 1;
            }
        }

        let value = xorshift64star(&mut state);
        cell.set(state);
        value
    })
}

/// Returns a pseudo-random value in `[0, bound)`. `bound` must be
/// nonzero.
pub fn next_below(bound: u64) -> u64 {
    debug_assert!(bound > 0);
    next_u64() % bound
}

#[test]
fn test_next_u64_varies() {
    let a = next_u64();
    let b = next_u64();
    assert_ne!(a, b);
}

#[test]
fn test_next_below_in_range() {
    for _ in 0..1000 {
        let v = next_below(37);
        assert!(v < 37);
    }
}
