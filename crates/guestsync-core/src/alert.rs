//! Alertable regions.
//!
//! A thread is alertable while an [`AlertableScope`] is alive on it. The
//! user-callback signal handler samples that flag on the target thread: a
//! callback queued while the target is alertable is marked delivered and runs
//! when the wait or sleep next wakes; one queued outside an alertable region is
//! never run. After marking delivery the platform layer wakes the wait engine
//! from outside the handler.
//!
//! Callbacks always execute in ordinary thread context, never inside the
//! handler, so they may take the wait lock like any other code.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::json;

use crate::log;
use crate::termination;

thread_local! {
    // Read from signal context; atomics keep the access lock-free.
    static ALERTABLE: AtomicBool = const { AtomicBool::new(false) };
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Whether the calling thread is inside an alertable region.
#[must_use]
pub fn is_alertable() -> bool {
    ALERTABLE
        .try_with(|flag| flag.load(Ordering::Acquire))
        .unwrap_or(false)
}

/// Marks the calling thread alertable until dropped. Scopes nest.
pub struct AlertableScope {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl AlertableScope {
    #[must_use]
    pub fn enter() -> Self {
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        ALERTABLE.with(|flag| flag.store(true, Ordering::Release));
        Self {
            _not_send: std::marker::PhantomData,
        }
    }

    /// Scope that is alertable only when `alertable` is true.
    #[must_use]
    pub fn enter_if(alertable: bool) -> Option<Self> {
        alertable.then(Self::enter)
    }
}

impl Drop for AlertableScope {
    fn drop(&mut self) {
        let remaining = DEPTH.with(|depth| {
            let next = depth.get().saturating_sub(1);
            depth.set(next);
            next
        });
        if remaining == 0 {
            ALERTABLE.with(|flag| flag.store(false, Ordering::Release));
        }
    }
}

/// Whether a callback has been delivered to the calling thread and not yet run.
#[must_use]
pub fn delivered_callback_pending() -> bool {
    termination::current_control().is_some_and(|control| control.has_delivered_callback())
}

/// Run the callback delivered to the calling thread, if any.
///
/// Returns true when a callback ran. A panicking callback is logged and
/// swallowed.
pub fn run_delivered_callback() -> bool {
    let Some(control) = termination::current_control() else {
        return false;
    };
    let Some(callback) = control.take_delivered_callback() else {
        return false;
    };
    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        log::error("thread.user_callback.panic", json!({}));
    }
    true
}
