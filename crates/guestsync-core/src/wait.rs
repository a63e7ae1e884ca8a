//! The wait engine shared by every waitable object.
//!
//! All waitable state in the process sits behind one mutex and one condition
//! variable. A single lock makes the multi-object predicate ("all of these" or
//! "any of these") a plain boolean expression evaluated atomically, with no
//! per-object notification graph. Critical sections are O(1) predicate checks,
//! so the coarse lock is cheap in practice.
//!
//! Rules every [`Waitable`] follows:
//! - predicate fields are only read or written while holding a [`WaitGuard`];
//! - any change that can make `signaled()` true is followed by
//!   [`WaitGuard::notify_all`] before the guard is released.
//!
//! Because the condition variable is shared by unrelated objects, waking a
//! single thread could pick a waiter blocked on a different object. State
//! changes therefore always wake everyone; the "exactly one consumer" rule of
//! auto-reset objects is enforced by `post_wait` running under the lock.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{alert, termination};

// ---------------------------------------------------------------------------
// Shared lock
// ---------------------------------------------------------------------------

struct WaitEngine {
    lock: Mutex<()>,
    cond: Condvar,
}

// Process lifetime; no teardown before exit.
static ENGINE: WaitEngine = WaitEngine {
    lock: Mutex::new(()),
    cond: Condvar::new(),
};

/// Proof that the process-wide wait lock is held.
pub struct WaitGuard<'a> {
    inner: MutexGuard<'a, ()>,
}

impl WaitGuard<'_> {
    /// Wake every thread blocked in a wait so it re-evaluates its predicate.
    pub fn notify_all(&self) {
        ENGINE.cond.notify_all();
    }
}

/// Acquire the process-wide wait lock.
#[must_use]
pub fn lock() -> WaitGuard<'static> {
    WaitGuard {
        inner: ENGINE.lock.lock(),
    }
}

// ---------------------------------------------------------------------------
// Timeouts and results
// ---------------------------------------------------------------------------

/// How long a wait may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Timeout {
    /// Block until the predicate holds.
    #[default]
    Infinite,
    /// Block at most this long. `Duration::ZERO` polls without blocking.
    Finite(Duration),
}

impl Timeout {
    pub const ZERO: Self = Self::Finite(Duration::ZERO);

    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self::Finite(Duration::from_millis(millis))
    }

    #[must_use]
    pub const fn is_infinite(self) -> bool {
        matches!(self, Self::Infinite)
    }

    /// Absolute deadline, or `None` when the wait is unbounded. A finite
    /// timeout too large to represent is treated as infinite.
    #[must_use]
    pub fn deadline(self) -> Option<Instant> {
        match self {
            Self::Infinite => None,
            Self::Finite(duration) => Instant::now().checked_add(duration),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::Finite(duration)
    }
}

/// Outcome of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitResult {
    /// The object (or object set) was signaled and the wait consumed it.
    Success,
    /// The timeout elapsed while the predicate stayed false.
    Timeout,
    /// The wait could not be performed (invalid handle or handle set).
    Failed,
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// A primitive that participates in single and multi-object waits.
pub trait Waitable: Send + Sync {
    /// Whether a wait by the calling thread would be satisfied right now.
    fn signaled(&self, guard: &WaitGuard<'_>) -> bool;

    /// Side effect of a satisfied wait (auto-reset, decrement, take ownership).
    /// Runs exactly once per satisfied wait, under the same lock hold as the
    /// `signaled()` check that satisfied it.
    fn post_wait(&self, guard: &WaitGuard<'_>);

    /// Object-specific signal. Returns whether it had an effect.
    fn signal(&self) -> bool;
}

/// Anything the façade may be asked to wait on.
///
/// Kernel-emulation code wraps guest objects in its own handle types; only
/// those backed by a host primitive resolve to a [`Waitable`]. Everything else
/// makes the wait fail instead of blocking.
pub trait WaitHandle: Send + Sync {
    fn waitable(&self) -> Option<&dyn Waitable>;
}

// ---------------------------------------------------------------------------
// Waits
// ---------------------------------------------------------------------------

/// Block on `guard` until `ready` holds or the deadline passes.
///
/// Returns with the lock still held; the caller applies `post_wait` in the
/// same critical section. A termination request for the calling thread is
/// honored at every wakeup. Inside an alertable region a delivered user
/// callback runs with the lock released and the wait then continues. The
/// delivery flag is checked under the lock before every block, so the
/// platform layer only has to wake the engine after setting it.
fn block_until<F>(guard: &mut WaitGuard<'static>, timeout: Timeout, mut ready: F) -> bool
where
    F: FnMut(&WaitGuard<'_>) -> bool,
{
    let deadline = timeout.deadline();
    let alertable = alert::is_alertable();
    loop {
        if ready(guard) {
            return true;
        }
        if !(alertable && alert::delivered_callback_pending()) {
            match deadline {
                None => ENGINE.cond.wait(&mut guard.inner),
                Some(end) => {
                    if ENGINE.cond.wait_until(&mut guard.inner, end).timed_out() {
                        return ready(guard);
                    }
                }
            }
        }
        termination::checkpoint();
        if alertable {
            MutexGuard::unlocked(&mut guard.inner, || {
                alert::run_delivered_callback();
            });
        }
    }
}

/// Wait for a single object.
pub fn wait_one(object: &dyn Waitable, timeout: Timeout) -> WaitResult {
    termination::checkpoint();
    let mut guard = lock();
    if block_until(&mut guard, timeout, |g| object.signaled(g)) {
        object.post_wait(&guard);
        WaitResult::Success
    } else {
        WaitResult::Timeout
    }
}

/// Wait for all (`wait_all`) or any of `objects`.
///
/// On success returns the index of the lowest-indexed signaled object. For
/// wait-any only that object's `post_wait` runs; for wait-all every object's
/// does. Empty sets and wait-all sets naming the same object twice fail.
pub fn wait_multiple(
    objects: &[&dyn Waitable],
    wait_all: bool,
    timeout: Timeout,
) -> (WaitResult, usize) {
    if objects.is_empty() || (wait_all && has_duplicates(objects)) {
        return (WaitResult::Failed, 0);
    }

    termination::checkpoint();
    let mut guard = lock();
    let satisfied = block_until(&mut guard, timeout, |g| {
        if wait_all {
            objects.iter().all(|o| o.signaled(g))
        } else {
            objects.iter().any(|o| o.signaled(g))
        }
    });
    if !satisfied {
        return (WaitResult::Timeout, 0);
    }

    if wait_all {
        for object in objects {
            object.post_wait(&guard);
        }
        return (WaitResult::Success, 0);
    }

    match objects.iter().position(|o| o.signaled(&guard)) {
        Some(index) => {
            objects[index].post_wait(&guard);
            (WaitResult::Success, index)
        }
        None => {
            debug_assert!(false, "wait-any satisfied with no signaled object");
            (WaitResult::Timeout, 0)
        }
    }
}

fn has_duplicates(objects: &[&dyn Waitable]) -> bool {
    objects.iter().enumerate().any(|(i, a)| {
        objects[i + 1..]
            .iter()
            .any(|b| std::ptr::addr_eq(*a as *const dyn Waitable, *b as *const dyn Waitable))
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
