//! Counting semaphores.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{Result, SyncError};
use crate::wait::{self, WaitGuard, WaitHandle, Waitable};

/// Counting semaphore with a fixed maximum.
///
/// Invariant: `0 <= count <= maximum` at every observable point. Each
/// successful wait takes exactly one unit.
#[derive(Debug)]
pub struct Semaphore {
    count: AtomicI32,
    maximum: i32,
}

impl Semaphore {
    /// Create a semaphore holding `initial_count` of `maximum_count` units.
    pub fn create(initial_count: i32, maximum_count: i32) -> Result<Self> {
        if maximum_count < 1 {
            return Err(SyncError::InvalidParameter("semaphore maximum must be positive"));
        }
        if !(0..=maximum_count).contains(&initial_count) {
            return Err(SyncError::InvalidParameter(
                "semaphore initial count outside 0..=maximum",
            ));
        }
        Ok(Self {
            count: AtomicI32::new(initial_count),
            maximum: maximum_count,
        })
    }

    #[must_use]
    pub const fn maximum_count(&self) -> i32 {
        self.maximum
    }

    /// Current count. Racy by nature; for diagnostics and tests.
    #[must_use]
    pub fn count(&self) -> i32 {
        let _guard = wait::lock();
        self.count.load(Ordering::Relaxed)
    }

    /// Add `release_count` units and return the count before the release.
    ///
    /// Fails without changing the count when `release_count < 1` or the
    /// result would exceed the maximum.
    pub fn release(&self, release_count: i32) -> Result<i32> {
        if release_count < 1 {
            return Err(SyncError::InvalidParameter("semaphore release count must be positive"));
        }
        let guard = wait::lock();
        let previous = self.count.load(Ordering::Relaxed);
        match previous.checked_add(release_count) {
            Some(next) if next <= self.maximum => {
                self.count.store(next, Ordering::Relaxed);
                guard.notify_all();
                Ok(previous)
            }
            _ => Err(SyncError::SemaphoreLimit {
                count: previous,
                release: release_count,
                maximum: self.maximum,
            }),
        }
    }
}

impl Waitable for Semaphore {
    fn signaled(&self, _guard: &WaitGuard<'_>) -> bool {
        self.count.load(Ordering::Relaxed) > 0
    }

    fn post_wait(&self, _guard: &WaitGuard<'_>) {
        let previous = self.count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "semaphore consumed while empty");
    }

    fn signal(&self) -> bool {
        self.release(1).is_ok()
    }
}

impl WaitHandle for Semaphore {
    fn waitable(&self) -> Option<&dyn Waitable> {
        Some(self)
    }
}
