//! Recursive, owner-tracked mutual exclusion.
//!
//! Ownership is a thread identity token plus a recursion depth, both
//! guarded by the wait lock, so a release from a thread that is not the owner
//! is rejected instead of corrupting a host lock.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Result, SyncError};
use crate::ident::{self, NO_THREAD};
use crate::wait::{self, WaitGuard, WaitHandle, Waitable};

#[derive(Debug)]
pub struct Mutant {
    count: AtomicU32,
    owner: AtomicU64,
}

impl Mutant {
    /// Create a mutant, optionally already owned once by the calling thread.
    #[must_use]
    pub fn create(initial_owner: bool) -> Self {
        if initial_owner {
            Self {
                count: AtomicU32::new(1),
                owner: AtomicU64::new(ident::current_thread_token()),
            }
        } else {
            Self {
                count: AtomicU32::new(0),
                owner: AtomicU64::new(NO_THREAD),
            }
        }
    }

    /// Drop one level of ownership held by the calling thread.
    ///
    /// When the depth reaches zero the mutant becomes unowned and waiters are
    /// woken.
    pub fn release(&self) -> Result<()> {
        let me = ident::current_thread_token();
        let guard = wait::lock();
        let depth = self.count.load(Ordering::Relaxed);
        if depth == 0 || self.owner.load(Ordering::Relaxed) != me {
            return Err(SyncError::NotOwner);
        }
        self.count.store(depth - 1, Ordering::Relaxed);
        if depth == 1 {
            self.owner.store(NO_THREAD, Ordering::Relaxed);
            guard.notify_all();
        }
        Ok(())
    }

    /// Whether the calling thread currently owns the mutant.
    #[must_use]
    pub fn is_owned_by_current_thread(&self) -> bool {
        let me = ident::current_thread_token();
        let _guard = wait::lock();
        self.count.load(Ordering::Relaxed) > 0 && self.owner.load(Ordering::Relaxed) == me
    }

    /// Recursion depth. Racy by nature; for diagnostics and tests.
    #[must_use]
    pub fn depth(&self) -> u32 {
        let _guard = wait::lock();
        self.count.load(Ordering::Relaxed)
    }
}

impl Waitable for Mutant {
    fn signaled(&self, _guard: &WaitGuard<'_>) -> bool {
        self.count.load(Ordering::Relaxed) == 0
            || self.owner.load(Ordering::Relaxed) == ident::current_thread_token()
    }

    fn post_wait(&self, _guard: &WaitGuard<'_>) {
        let depth = self.count.load(Ordering::Relaxed);
        if depth == 0 {
            self.owner
                .store(ident::current_thread_token(), Ordering::Relaxed);
        }
        self.count.store(depth + 1, Ordering::Relaxed);
    }

    fn signal(&self) -> bool {
        self.release().is_ok()
    }
}

impl WaitHandle for Mutant {
    fn waitable(&self) -> Option<&dyn Waitable> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::{Timeout, WaitResult, wait_one};
    use std::sync::Arc;

    #[test]
    fn nested_acquire_needs_matching_releases() {
        let mutant = Mutant::create(false);
        for _ in 0..3 {
            assert_eq!(wait_one(&mutant, Timeout::ZERO), WaitResult::Success);
        }
        assert_eq!(mutant.depth(), 3);
        for _ in 0..3 {
            assert!(mutant.release().is_ok());
        }
        assert_eq!(mutant.depth(), 0);
        assert_eq!(mutant.release(), Err(SyncError::NotOwner));
    }

    #[test]
    fn initial_owner_holds_one_level() {
        let mutant = Mutant::create(true);
        assert!(mutant.is_owned_by_current_thread());
        assert!(mutant.signal());
        assert!(!mutant.is_owned_by_current_thread());
        assert!(!mutant.signal());
    }

    #[test]
    fn other_thread_cannot_release_or_acquire() {
        let mutant = Arc::new(Mutant::create(true));
        let remote = Arc::clone(&mutant);
        let (released, waited) = std::thread::spawn(move || {
            (remote.release(), wait_one(&*remote, Timeout::ZERO))
        })
        .join()
        .unwrap();
        assert_eq!(released, Err(SyncError::NotOwner));
        assert_eq!(waited, WaitResult::Timeout);
        assert_eq!(mutant.depth(), 1);
        assert!(mutant.release().is_ok());
    }

    #[test]
    fn release_hands_off_to_blocked_waiter() {
        let mutant = Arc::new(Mutant::create(true));
        let remote = Arc::clone(&mutant);
        let waiter = std::thread::spawn(move || {
            let result = wait_one(&*remote, Timeout::from_millis(5_000));
            let owned = remote.is_owned_by_current_thread();
            let released = remote.release();
            (result, owned, released)
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(mutant.release().is_ok());
        let (result, owned, released) = waiter.join().unwrap();
        assert_eq!(result, WaitResult::Success);
        assert!(owned);
        assert!(released.is_ok());
    }
}
