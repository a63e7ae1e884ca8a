//! Thread control block.
//!
//! [`ThreadControl`] holds the platform-independent half of a thread object:
//! lifecycle state, suspend count, exit code, termination request and the
//! pending user callback. It is the waitable part of a thread; waits on it
//! succeed once the thread has finished.
//!
//! State machine:
//!
//! ```text
//! Uninitialized --start--> Running <--suspend/resume--> Suspended
//!        \                    |                            |
//!         +-------------------+------> Finished <----------+
//! ```
//!
//! `Finished` is entered exactly once, by whichever of natural return,
//! [`ThreadControl::terminate`] or self exit gets there first.
//!
//! The target thread parks itself in [`ThreadControl::park_while_suspended`].
//! When that is called from a signal handler the platform layer must keep the
//! suspend signal blocked for the duration, and must block it around any other
//! acquisition of this block's park lock made by the target thread itself.
//!
//! The park lock and condition variable are the std futex-backed ones. The
//! interrupted thread may itself be parked on the wait engine's `parking_lot`
//! condition variable, and `parking_lot` keeps a single queue record per
//! thread; parking again through it from the handler would relink that record
//! and corrupt the engine's waiter queue.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, Ordering};
use std::sync::{Condvar, MutexGuard, PoisonError};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{Result, SyncError};
use crate::wait::{self, WaitGuard, WaitHandle, Waitable};

/// Lifecycle state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    Uninitialized,
    Running,
    Suspended,
    Finished,
}

impl ThreadState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Uninitialized => 0,
            Self::Running => 1,
            Self::Suspended => 2,
            Self::Finished => 3,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Uninitialized,
            1 => Self::Running,
            2 => Self::Suspended,
            _ => Self::Finished,
        }
    }
}

/// Callback queued for delivery at the target's next alertable point.
pub type UserCallback = Box<dyn FnOnce() + Send + 'static>;

pub struct ThreadControl {
    state: AtomicU8,
    suspend_count: AtomicU32,
    // Wait predicate; written under the wait lock.
    finished: AtomicBool,
    exit_code: AtomicI32,
    terminate_requested: AtomicBool,
    park: std::sync::Mutex<()>,
    state_changed: Condvar,
    callback: Mutex<Option<UserCallback>>,
    callback_delivered: AtomicBool,
}

impl std::fmt::Debug for ThreadControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadControl")
            .field("state", &self.state())
            .field("suspend_count", &self.suspend_count())
            .field("exit_code", &self.exit_code())
            .finish_non_exhaustive()
    }
}

impl ThreadControl {
    /// New control block in `Uninitialized`. A suspended-at-creation thread
    /// starts with a suspend count of one.
    #[must_use]
    pub fn new(create_suspended: bool) -> Self {
        Self {
            state: AtomicU8::new(ThreadState::Uninitialized.to_u8()),
            suspend_count: AtomicU32::new(u32::from(create_suspended)),
            finished: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
            terminate_requested: AtomicBool::new(false),
            park: std::sync::Mutex::new(()),
            state_changed: Condvar::new(),
            callback: Mutex::new(None),
            callback_delivered: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn suspend_count(&self) -> u32 {
        self.suspend_count.load(Ordering::Acquire)
    }

    /// Exit code, once the thread has finished.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        (self.state() == ThreadState::Finished).then(|| self.exit_code.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state() == ThreadState::Finished
    }

    fn lock_park(&self) -> MutexGuard<'_, ()> {
        self.park.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_state_change<'a>(&self, park: MutexGuard<'a, ()>) -> MutexGuard<'a, ()> {
        self.state_changed
            .wait(park)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Move between live states. `Finished` is never left.
    fn transition(&self, from: ThreadState, to: ThreadState) -> bool {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // -----------------------------------------------------------------------
    // Start-up
    // -----------------------------------------------------------------------

    /// Called on the new thread before its start routine runs.
    pub fn mark_started(&self) {
        let _park = self.lock_park();
        let next = if self.suspend_count() > 0 {
            ThreadState::Suspended
        } else {
            ThreadState::Running
        };
        self.transition(ThreadState::Uninitialized, next);
        self.state_changed.notify_all();
    }

    /// Block until the thread has left `Uninitialized`.
    pub fn wait_started(&self) {
        let mut park = self.lock_park();
        while self.state() == ThreadState::Uninitialized {
            park = self.wait_state_change(park);
        }
    }

    // -----------------------------------------------------------------------
    // Suspend / resume
    // -----------------------------------------------------------------------

    /// Increment the suspend count; returns the previous count.
    ///
    /// The caller delivers the suspend signal when the previous count was 0.
    pub fn request_suspend(&self) -> Result<u32> {
        if self.is_finished() {
            return Err(SyncError::ThreadFinished);
        }
        let previous = self.suspend_count.fetch_add(1, Ordering::AcqRel);
        if previous == 0 {
            self.transition(ThreadState::Running, ThreadState::Suspended);
        }
        Ok(previous)
    }

    /// Decrement the suspend count; returns the previous count. At zero the
    /// parked thread wakes and becomes `Running`.
    pub fn resume(&self) -> Result<u32> {
        let previous = self
            .suspend_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .map_err(|_| SyncError::NotSuspended)?;
        if previous == 1 {
            let _park = self.lock_park();
            self.transition(ThreadState::Suspended, ThreadState::Running);
            self.state_changed.notify_all();
        }
        Ok(previous)
    }

    /// Park the calling (target) thread while its suspend count is non-zero.
    /// Returns early when termination has been requested.
    pub fn park_while_suspended(&self) {
        let mut park = self.lock_park();
        while self.suspend_count() > 0 && !self.terminate_requested.load(Ordering::Acquire) {
            self.transition(ThreadState::Running, ThreadState::Suspended);
            park = self.wait_state_change(park);
        }
        self.transition(ThreadState::Suspended, ThreadState::Running);
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    /// Enter `Finished` with `exit_code` and wake every waiter on the thread.
    /// Returns false if the thread had already finished.
    pub fn finish(&self, exit_code: i32) -> bool {
        let guard = wait::lock();
        if self.finished.load(Ordering::Relaxed) {
            return false;
        }
        self.exit_code.store(exit_code, Ordering::Release);
        self.state
            .store(ThreadState::Finished.to_u8(), Ordering::Release);
        self.finished.store(true, Ordering::Relaxed);
        guard.notify_all();
        true
    }

    /// Finish the thread and ask it to unwind at its next termination point.
    /// Returns false on every call after the thread has finished.
    pub fn terminate(&self, exit_code: i32) -> bool {
        if !self.finish(exit_code) {
            return false;
        }
        self.terminate_requested.store(true, Ordering::Release);
        let _park = self.lock_park();
        self.state_changed.notify_all();
        true
    }

    /// Exit code to unwind with, if termination was requested.
    #[must_use]
    pub fn pending_termination(&self) -> Option<i32> {
        self.terminate_requested
            .load(Ordering::Acquire)
            .then(|| self.exit_code.load(Ordering::Acquire))
    }

    // -----------------------------------------------------------------------
    // User callbacks
    // -----------------------------------------------------------------------

    /// Replace the pending callback. A replaced callback is dropped unrun.
    pub fn store_callback(&self, callback: UserCallback) {
        let previous = {
            let mut slot = self.callback.lock();
            self.callback_delivered.store(false, Ordering::Release);
            slot.replace(callback)
        };
        drop(previous);
    }

    /// Signal-handler side: the target was alertable when the callback signal
    /// arrived. Only touches an atomic.
    pub fn mark_callback_delivered(&self) {
        self.callback_delivered.store(true, Ordering::Release);
    }

    /// Whether a delivered callback is waiting to run.
    #[must_use]
    pub fn has_delivered_callback(&self) -> bool {
        self.callback_delivered.load(Ordering::Acquire)
    }

    /// Take the pending callback if it was delivered to an alertable region.
    #[must_use]
    pub fn take_delivered_callback(&self) -> Option<UserCallback> {
        if !self.callback_delivered.swap(false, Ordering::AcqRel) {
            return None;
        }
        self.callback.lock().take()
    }

    /// Whether a callback is stored, delivered or not.
    #[must_use]
    pub fn has_pending_callback(&self) -> bool {
        self.callback.lock().is_some()
    }
}

impl Waitable for ThreadControl {
    fn signaled(&self, _guard: &WaitGuard<'_>) -> bool {
        self.finished.load(Ordering::Relaxed)
    }

    fn post_wait(&self, _guard: &WaitGuard<'_>) {}

    /// Threads are signaled by finishing only.
    fn signal(&self) -> bool {
        false
    }
}

impl WaitHandle for ThreadControl {
    fn waitable(&self) -> Option<&dyn Waitable> {
        Some(self)
    }
}
