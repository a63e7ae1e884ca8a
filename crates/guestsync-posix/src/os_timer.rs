//! POSIX interval timers aimed at the dispatch thread.

use std::ffi::c_void;
use std::sync::Weak;
use std::time::Duration;

use guestsync_core::error::{Result, SyncError};
use guestsync_core::log;
use serde_json::json;

use crate::dispatch::{self, Expiry};
use crate::signals::{self, SignalKind};

/// A `timer_create` timer on `CLOCK_MONOTONIC` whose expirations are routed
/// to one registered [`Expiry`]. Deleted on drop.
pub(crate) struct OsTimer {
    id: libc::timer_t,
    registry_id: u64,
}

// SAFETY: timer_t is an opaque kernel timer id; every timer_* call on it is
// thread-safe.
unsafe impl Send for OsTimer {}
// SAFETY: as above; `&OsTimer` only exposes timer_settime.
unsafe impl Sync for OsTimer {}

pub(crate) fn timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: libc::time_t::try_from(duration.as_secs()).unwrap_or(libc::time_t::MAX),
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    }
}

impl OsTimer {
    pub(crate) fn create(kind: SignalKind, target: Weak<dyn Expiry>) -> Result<Self> {
        signals::install_handler(kind)?;
        let tid = dispatch::target_tid()?;
        let registry_id = dispatch::register(target);

        // SAFETY: zeroed sigevent is a valid starting value; fields are set below.
        let mut event = unsafe { std::mem::zeroed::<libc::sigevent>() };
        event.sigev_notify = libc::SIGEV_THREAD_ID;
        event.sigev_signo = kind.system_signal();
        event.sigev_value = libc::sigval {
            sival_ptr: registry_id as usize as *mut c_void,
        };
        event.sigev_notify_thread_id = tid;

        // SAFETY: zeroed timer_t is a valid output slot.
        let mut id: libc::timer_t = unsafe { std::mem::zeroed() };
        // SAFETY: `event` is initialized and `id` is writable.
        let rc = unsafe { libc::timer_create(libc::CLOCK_MONOTONIC, &mut event, &mut id) };
        if rc != 0 {
            let err = SyncError::last_os_error("timer_create");
            dispatch::unregister(registry_id);
            log::error("os_timer.create", json!({ "error": err.to_string() }));
            return Err(err);
        }
        Ok(Self { id, registry_id })
    }

    /// Program the first expiry after `due` and then every `period`, if any.
    ///
    /// A zero `due` would disarm the timer, so it is rounded up to 1ns and
    /// the timer fires immediately.
    pub(crate) fn arm(&self, due: Duration, period: Option<Duration>) -> Result<()> {
        let due = if due.is_zero() { Duration::from_nanos(1) } else { due };
        let spec = libc::itimerspec {
            it_interval: timespec(period.unwrap_or(Duration::ZERO)),
            it_value: timespec(due),
        };
        // SAFETY: `self.id` is a live timer and `spec` is initialized.
        let rc = unsafe { libc::timer_settime(self.id, 0, &spec, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(SyncError::last_os_error("timer_settime"));
        }
        Ok(())
    }
}

impl Drop for OsTimer {
    fn drop(&mut self) {
        // SAFETY: `self.id` came from timer_create and is deleted exactly once.
        if unsafe { libc::timer_delete(self.id) } != 0 {
            log::warn(
                "os_timer.delete",
                json!({ "error": SyncError::last_os_error("timer_delete").to_string() }),
            );
        }
        dispatch::unregister(self.registry_id);
    }
}
