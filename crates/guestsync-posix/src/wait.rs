//! Public wait façade.
//!
//! Thin layer over the wait engine that resolves handles, applies the
//! alertable flag and provides the sleep primitives. Handles that do not
//! resolve to a waitable object, and empty handle lists, make a wait return
//! [`WaitResult::Failed`] without blocking.

use std::sync::atomic::{Ordering, fence};
use std::time::{Duration, Instant};

use guestsync_core::alert::{self, AlertableScope};
use guestsync_core::termination;
use guestsync_core::wait as engine;
pub use guestsync_core::wait::{Timeout, WaitHandle, WaitResult, Waitable};

use crate::os_timer::timespec;
use crate::signals::BlockedSignals;

/// Outcome of a sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SleepResult {
    /// The full duration elapsed.
    Success,
    /// A user callback ran and cut the sleep short.
    Alerted,
}

// ---------------------------------------------------------------------------
// Waits
// ---------------------------------------------------------------------------

/// Wait for one object. With `alertable`, user callbacks queued to the
/// calling thread run during the wait; the wait then carries on.
pub fn wait(handle: &dyn WaitHandle, alertable: bool, timeout: Timeout) -> WaitResult {
    let Some(object) = handle.waitable() else {
        return WaitResult::Failed;
    };
    let _scope = AlertableScope::enter_if(alertable);
    engine::wait_one(object, timeout)
}

/// Signal `to_signal`, then wait for `to_wait_on`. Fails without waiting if
/// the signal had no effect (e.g. releasing a mutant the caller does not own).
pub fn signal_and_wait(
    to_signal: &dyn WaitHandle,
    to_wait_on: &dyn WaitHandle,
    alertable: bool,
    timeout: Timeout,
) -> WaitResult {
    let (Some(signal), Some(_)) = (to_signal.waitable(), to_wait_on.waitable()) else {
        return WaitResult::Failed;
    };
    if !signal.signal() {
        return WaitResult::Failed;
    }
    wait(to_wait_on, alertable, timeout)
}

/// Wait for all or any of `handles`. On success the index is that of the
/// lowest-indexed signaled handle (always 0 for wait-all).
pub fn wait_multiple(
    handles: &[&dyn WaitHandle],
    wait_all: bool,
    alertable: bool,
    timeout: Timeout,
) -> (WaitResult, usize) {
    let objects: Option<Vec<&dyn Waitable>> = handles.iter().map(|h| h.waitable()).collect();
    let Some(objects) = objects else {
        return (WaitResult::Failed, 0);
    };
    let _scope = AlertableScope::enter_if(alertable);
    engine::wait_multiple(&objects, wait_all, timeout)
}

pub fn wait_any(
    handles: &[&dyn WaitHandle],
    alertable: bool,
    timeout: Timeout,
) -> (WaitResult, usize) {
    wait_multiple(handles, false, alertable, timeout)
}

pub fn wait_all(handles: &[&dyn WaitHandle], alertable: bool, timeout: Timeout) -> WaitResult {
    wait_multiple(handles, true, alertable, timeout).0
}

// ---------------------------------------------------------------------------
// Sleeps
// ---------------------------------------------------------------------------

/// Sleep with the thread-control signals deliverable only inside the kernel
/// wait, so a callback or termination request cannot slip in between the
/// last check and going to sleep.
fn sleep_for(duration: Duration, alertable: bool) -> SleepResult {
    let deadline = Instant::now().checked_add(duration);
    loop {
        termination::checkpoint();
        if alertable && alert::run_delivered_callback() {
            return SleepResult::Alerted;
        }

        // Without the mask this degrades to a plain timed sleep.
        let blocked = BlockedSignals::thread_control().ok();
        termination::checkpoint();
        if alertable && alert::delivered_callback_pending() {
            continue;
        }
        let remaining = match deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::from_secs(u32::MAX.into()),
        };
        if remaining.is_zero() {
            return SleepResult::Success;
        }
        let request = timespec(remaining);
        let mask: *const libc::sigset_t = blocked
            .as_ref()
            .map_or(std::ptr::null(), |b| std::ptr::from_ref(b.previous()));
        // SAFETY: no descriptors are polled; `request` and `mask` outlive the call.
        unsafe { libc::ppoll(std::ptr::null_mut(), 0, &request, mask) };
        // Timeout, EINTR and spurious returns all re-check the deadline.
        drop(blocked);
    }
}

/// Sleep for `duration`. User callbacks do not run; a termination request
/// ends the sleep by unwinding the thread.
pub fn sleep(duration: Duration) {
    let _ = sleep_for(duration, false);
}

/// Sleep for `duration` as an alertable region. Returns
/// [`SleepResult::Alerted`] as soon as a user callback queued to this thread
/// has run.
pub fn alertable_sleep(duration: Duration) -> SleepResult {
    let _scope = AlertableScope::enter();
    sleep_for(duration, true)
}

/// Give other threads a chance to run, then fence memory.
pub fn maybe_yield() {
    std::thread::yield_now();
    fence(Ordering::SeqCst);
}

/// Full memory barrier.
pub fn sync_memory() {
    fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestsync_core::{Event, Mutant};

    struct Foreign;

    impl WaitHandle for Foreign {
        fn waitable(&self) -> Option<&dyn Waitable> {
            None
        }
    }

    #[test]
    fn foreign_handles_fail() {
        let event = Event::create_manual_reset(true);
        assert_eq!(wait(&Foreign, false, Timeout::ZERO), WaitResult::Failed);
        assert_eq!(wait_any(&[&event, &Foreign], false, Timeout::ZERO).0, WaitResult::Failed);
        assert_eq!(wait_all(&[], false, Timeout::ZERO), WaitResult::Failed);
        assert_eq!(
            signal_and_wait(&event, &Foreign, false, Timeout::ZERO),
            WaitResult::Failed
        );
    }

    #[test]
    fn signal_and_wait_requires_an_effective_signal() {
        let unowned = Mutant::create(false);
        let target = Event::create_manual_reset(true);
        assert_eq!(
            signal_and_wait(&unowned, &target, false, Timeout::ZERO),
            WaitResult::Failed
        );
        let event = Event::create_auto_reset(false);
        assert_eq!(
            signal_and_wait(&event, &event, false, Timeout::ZERO),
            WaitResult::Success
        );
        assert!(!event.is_set());
    }

    #[test]
    fn sleep_lasts_at_least_the_duration() {
        let start = Instant::now();
        sleep(Duration::from_millis(15));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn alertable_sleep_without_callback_completes() {
        let start = Instant::now();
        assert_eq!(alertable_sleep(Duration::from_millis(10)), SleepResult::Success);
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn zero_sleep_returns() {
        sleep(Duration::ZERO);
        maybe_yield();
        sync_memory();
    }
}
