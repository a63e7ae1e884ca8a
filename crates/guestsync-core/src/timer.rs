//! Waitable state of a timer.
//!
//! [`TimerCore`] is the half of a waitable timer that participates in waits.
//! The platform layer owns the OS timer and calls [`TimerCore::complete`] from
//! ordinary thread context on every expiry.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::json;

use crate::log;
use crate::wait::{self, WaitGuard, Waitable};

/// Completion routine run on timer expiry.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Default)]
struct Schedule {
    armed: bool,
    periodic: bool,
    callback: Option<TimerCallback>,
}

/// One expiry taken from the schedule, not yet signaled.
struct Expiry {
    generation: u64,
    callback: Option<TimerCallback>,
}

pub struct TimerCore {
    signal: AtomicBool,
    manual_reset: bool,
    schedule: Mutex<Schedule>,
    // Bumped by every arm and cancel. Written holding both the schedule lock
    // and the wait lock, so either lock gives a stable read.
    generation: AtomicU64,
}

impl std::fmt::Debug for TimerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerCore")
            .field("signal", &self.signal.load(Ordering::Relaxed))
            .field("manual_reset", &self.manual_reset)
            .finish_non_exhaustive()
    }
}

impl TimerCore {
    #[must_use]
    pub fn new(manual_reset: bool) -> Self {
        Self {
            signal: AtomicBool::new(false),
            manual_reset,
            schedule: Mutex::new(Schedule::default()),
            generation: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn is_manual_reset(&self) -> bool {
        self.manual_reset
    }

    /// Start a new schedule generation and clear the signal. Expiries taken
    /// from an older generation no longer signal. Lock order: schedule, then
    /// wait.
    fn reset_signal(&self) {
        let _guard = wait::lock();
        self.generation.fetch_add(1, Ordering::Relaxed);
        self.signal.store(false, Ordering::Relaxed);
    }

    /// Prepare for a new schedule: clear the signal and install `callback`.
    /// Must precede programming the OS timer.
    pub fn arm(&self, periodic: bool, callback: Option<TimerCallback>) {
        let previous = {
            let mut schedule = self.schedule.lock();
            self.reset_signal();
            schedule.armed = true;
            schedule.periodic = periodic;
            std::mem::replace(&mut schedule.callback, callback)
        };
        drop(previous);
    }

    /// Forget the schedule: clear the signal and drop the callback. Late
    /// expirations of the old schedule are ignored.
    pub fn cancel(&self) {
        let callback = {
            let mut schedule = self.schedule.lock();
            self.reset_signal();
            schedule.armed = false;
            schedule.callback.take()
        };
        drop(callback);
    }

    /// Whether a schedule is active.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.schedule.lock().armed
    }

    /// Expiry routine.
    ///
    /// Takes the callback under the private lock (one-shot schedules consume
    /// it, periodic ones keep it), signals waiters, then runs the callback
    /// with no lock held. Panics in the callback are logged and swallowed.
    ///
    /// An expiry that raced with [`TimerCore::arm`] or [`TimerCore::cancel`]
    /// neither signals nor runs its callback.
    pub fn complete(&self) {
        if let Some(expiry) = self.take_expiry() {
            self.deliver(expiry);
        }
    }

    fn take_expiry(&self) -> Option<Expiry> {
        let mut schedule = self.schedule.lock();
        if !schedule.armed {
            return None;
        }
        let callback = if schedule.periodic {
            schedule.callback.clone()
        } else {
            schedule.armed = false;
            schedule.callback.take()
        };
        Some(Expiry {
            generation: self.generation.load(Ordering::Relaxed),
            callback,
        })
    }

    fn deliver(&self, expiry: Expiry) {
        let current = {
            let guard = wait::lock();
            let current = self.generation.load(Ordering::Relaxed) == expiry.generation;
            if current {
                self.signal.store(true, Ordering::Relaxed);
                guard.notify_all();
            }
            current
        };
        if !current {
            log::trace("timer.expiry.stale", json!({ "generation": expiry.generation }));
            return;
        }

        if let Some(callback) = expiry.callback {
            if panic::catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                log::error("timer.callback.panic", json!({}));
            }
        }
    }

    /// Current signal state. Racy by nature; for diagnostics and tests.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        let guard = wait::lock();
        self.signaled(&guard)
    }
}

impl Waitable for TimerCore {
    fn signaled(&self, _guard: &WaitGuard<'_>) -> bool {
        self.signal.load(Ordering::Relaxed)
    }

    fn post_wait(&self, _guard: &WaitGuard<'_>) {
        if !self.manual_reset {
            self.signal.store(false, Ordering::Relaxed);
        }
    }

    /// Timers are signaled by expiry only.
    fn signal(&self) -> bool {
        false
    }
}
