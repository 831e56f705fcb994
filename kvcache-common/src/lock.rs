//! # Tier lock primitive
//!
//! A non-reentrant mutual-exclusion wrapper with a bounded try-lock
//! variant. Trim loops use `try_lock_for` so each iteration acquires and
//! releases the lock rather than spinning under one held guard — this
//! keeps client reads/writes from being starved while a trim runs.

use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

/// Scoped mutual exclusion around `T`.
///
/// Thin wrapper over `parking_lot::Mutex` so tiers share one locking
/// vocabulary (`lock()` / `try_lock_for()`) instead of reaching for the
/// underlying primitive directly.
pub struct TierLock<T> {
    inner: Mutex<T>,
}

impl<T> TierLock<T> {
    pub fn new(value: T) -> Self {
        TierLock {
            inner: Mutex::new(value),
        }
    }

    /// Blocking acquisition; released on guard drop.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// Bounded acquisition for trim-loop iterations.
    ///
    /// Intended for short, bounded critical sections inside eviction loops
    /// so contending readers/writers get a chance to interleave between
    /// iterations rather than waiting out an entire trim pass.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock_for(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_roundtrip() {
        let lock = TierLock::new(5);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn try_lock_for_times_out_under_contention() {
        let lock = TierLock::new(0);
        let guard = lock.lock();
        assert!(lock.try_lock_for(Duration::from_millis(5)).is_none());
        drop(guard);
        assert!(lock.try_lock_for(Duration::from_millis(5)).is_some());
    }
}
