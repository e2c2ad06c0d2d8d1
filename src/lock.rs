//! The root lock and big-zone lock are modeled as a
//! small `Lock<T>` abstraction so the `spinlock` feature can swap a
//! `std::sync::Mutex` for a hand-rolled spinlock without the rest of
//! the crate caring which one it got. With `thread_support` disabled
//! there is only ever one thread touching the allocator, so the lock
//! degenerates to a `RefCell`-style unchecked cell.
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

#[cfg(all(feature = "thread_support", not(feature = "spinlock")))]
mod imp {
    use super::*;

    pub struct Lock<T>(std::sync::Mutex<T>);

    pub struct Guard<'a, T>(std::sync::MutexGuard<'a, T>);

    impl<T> Lock<T> {
        pub const fn new(value: T) -> Self {
            Lock(std::sync::Mutex::new(value))
        }

        pub fn lock(&self) -> Guard<'_, T> {
            Guard(self.0.lock().unwrap_or_else(|poison| poison.into_inner()))
        }
    }

    impl<'a, T> Deref for Guard<'a, T> {
        type Target = T;
        fn deref(&self) -> &T {
            &self.0
        }
    }

    impl<'a, T> DerefMut for Guard<'a, T> {
        fn deref_mut(&mut self) -> &mut T {
            &mut self.0
        }
    }
}

#[cfg(all(feature = "thread_support", feature = "spinlock"))]
mod imp {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub struct Lock<T> {
        busy: AtomicBool,
        value: UnsafeCell<T>,
    }

    pub struct Guard<'a, T> {
        lock: &'a Lock<T>,
    }

    unsafe impl<T: Send> Sync for Lock<T> {}

    impl<T> Lock<T> {
        pub const fn new(value: T) -> Self {
            Lock {
                busy: AtomicBool::new(false),
                value: UnsafeCell::new(value),
            }
        }

        pub fn lock(&self) -> Guard<'_, T> {
            while self
                .busy
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                std::hint::spin_loop();
            }

            Guard { lock: self }
        }
    }

    impl<'a, T> Drop for Guard<'a, T> {
        fn drop(&mut self) {
            self.lock.busy.store(false, Ordering::Release);
        }
    }

    impl<'a, T> Deref for Guard<'a, T> {
        type Target = T;
        fn deref(&self) -> &T {
            unsafe { &*self.lock.value.get() }
        }
    }

    impl<'a, T> DerefMut for Guard<'a, T> {
        fn deref_mut(&mut self) -> &mut T {
            unsafe { &mut *self.lock.value.get() }
        }
    }
}

#[cfg(not(feature = "thread_support"))]
mod imp {
    use super::*;

    pub struct Lock<T>(UnsafeCell<T>);

    unsafe impl<T> Sync for Lock<T> {}

    pub struct Guard<'a, T>(&'a UnsafeCell<T>);

    impl<T> Lock<T> {
        pub const fn new(value: T) -> Self {
            Lock(UnsafeCell::new(value))
        }

        pub fn lock(&self) -> Guard<'_, T> {
            Guard(&self.0)
        }
    }

    impl<'a, T> Deref for Guard<'a, T> {
        type Target = T;
        fn deref(&self) -> &T {
            unsafe { &*self.0.get() }
        }
    }

    impl<'a, T> DerefMut for Guard<'a, T> {
        fn deref_mut(&mut self) -> &mut T {
            unsafe { &mut *self.0.get() }
        }
    }
}

pub use imp::Lock;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_round_trips_value() {
        let lock = Lock::new(41);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 42);
    }
}
