//! Waitable timers.

use std::sync::Arc;
use std::time::Duration;

use guestsync_core::error::Result;
use guestsync_core::timer::{TimerCallback, TimerCore};
use guestsync_core::wait::{WaitHandle, Waitable};
use parking_lot::Mutex;

use crate::os_timer::OsTimer;
use crate::signals::SignalKind;

/// Waitable timer backed by a POSIX interval timer.
///
/// Manual-reset timers stay signaled from expiry until re-armed or
/// cancelled; synchronization timers clear on each successful wait. The OS
/// timer is created on the first `set` and deleted by `cancel` or drop.
pub struct Timer {
    core: Arc<TimerCore>,
    os: Mutex<Option<OsTimer>>,
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer").field("core", &self.core).finish_non_exhaustive()
    }
}

impl Timer {
    #[must_use]
    pub fn new(manual_reset: bool) -> Self {
        Self {
            core: Arc::new(TimerCore::new(manual_reset)),
            os: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn create_manual_reset() -> Self {
        Self::new(true)
    }

    #[must_use]
    pub fn create_synchronization() -> Self {
        Self::new(false)
    }

    /// The waitable half, for passing to wait functions directly.
    #[must_use]
    pub fn core(&self) -> &TimerCore {
        &self.core
    }

    /// Clear the signal and (re)arm: first expiry after `due`, then every
    /// `period` if given. `callback` runs on every expiry, after waiters are
    /// signaled. A zero `period` means one-shot.
    pub fn set(
        &self,
        due: Duration,
        period: Option<Duration>,
        callback: Option<TimerCallback>,
    ) -> Result<()> {
        let period = period.filter(|p| !p.is_zero());
        let mut os = self.os.lock();
        self.core.arm(period.is_some(), callback);
        if os.is_none() {
            let target = Arc::downgrade(&self.core);
            match OsTimer::create(SignalKind::Timer, target) {
                Ok(timer) => *os = Some(timer),
                Err(err) => {
                    self.core.cancel();
                    return Err(err);
                }
            }
        }
        if let Some(timer) = os.as_ref() {
            if let Err(err) = timer.arm(due, period) {
                self.core.cancel();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Fire once after `due`.
    pub fn set_once(&self, due: Duration, callback: Option<TimerCallback>) -> Result<()> {
        self.set(due, None, callback)
    }

    /// Fire after `due` and then every `period`.
    pub fn set_repeating(
        &self,
        due: Duration,
        period: Duration,
        callback: Option<TimerCallback>,
    ) -> Result<()> {
        self.set(due, Some(period), callback)
    }

    /// Delete the OS timer, clear the signal and drop the callback. The timer
    /// can be set again afterwards.
    pub fn cancel(&self) -> bool {
        let mut os = self.os.lock();
        drop(os.take());
        self.core.cancel();
        true
    }
}

impl WaitHandle for Timer {
    fn waitable(&self) -> Option<&dyn Waitable> {
        Some(&*self.core)
    }
}
