//! Manual-reset and auto-reset events.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::config;
use crate::wait::{self, WaitGuard, WaitHandle, Waitable};

/// A boolean waitable flag.
///
/// Auto-reset events clear on every successful wait, so each `set` releases
/// exactly one waiter. Manual-reset events release every waiter and stay
/// signaled until [`Event::reset`].
#[derive(Debug)]
pub struct Event {
    signal: AtomicBool,
    manual_reset: bool,
}

impl Event {
    #[must_use]
    pub const fn new(manual_reset: bool, initial_state: bool) -> Self {
        Self {
            signal: AtomicBool::new(initial_state),
            manual_reset,
        }
    }

    #[must_use]
    pub const fn create_manual_reset(initial_state: bool) -> Self {
        Self::new(true, initial_state)
    }

    #[must_use]
    pub const fn create_auto_reset(initial_state: bool) -> Self {
        Self::new(false, initial_state)
    }

    #[must_use]
    pub const fn is_manual_reset(&self) -> bool {
        self.manual_reset
    }

    /// Signal the event and wake waiters.
    pub fn set(&self) {
        let guard = wait::lock();
        self.signal.store(true, Ordering::Relaxed);
        guard.notify_all();
    }

    /// Clear the event. Idempotent.
    pub fn reset(&self) {
        let _guard = wait::lock();
        self.signal.store(false, Ordering::Relaxed);
    }

    /// Set, give waiters a short window to run, then reset.
    ///
    /// Waiters that have not been scheduled within the window may miss the
    /// pulse, and a waiter that arrives inside the window consumes it. Callers
    /// depend on exactly this loose behavior.
    pub fn pulse(&self) {
        self.set();
        std::thread::yield_now();
        std::thread::sleep(config::pulse_window());
        self.reset();
    }

    /// Current signal state. Racy by nature; for diagnostics and tests.
    #[must_use]
    pub fn is_set(&self) -> bool {
        let guard = wait::lock();
        self.signaled(&guard)
    }
}

impl Waitable for Event {
    fn signaled(&self, _guard: &WaitGuard<'_>) -> bool {
        self.signal.load(Ordering::Relaxed)
    }

    fn post_wait(&self, _guard: &WaitGuard<'_>) {
        if !self.manual_reset {
            self.signal.store(false, Ordering::Relaxed);
        }
    }

    fn signal(&self) -> bool {
        self.set();
        true
    }
}

impl WaitHandle for Event {
    fn waitable(&self) -> Option<&dyn Waitable> {
        Some(self)
    }
}
