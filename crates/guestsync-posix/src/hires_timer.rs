//! Periodic high-resolution callback source.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use guestsync_core::error::{Result, SyncError};
use guestsync_core::log;
use parking_lot::Mutex;
use serde_json::json;

use crate::dispatch::{self, Expiry};
use crate::os_timer::OsTimer;
use crate::signals::SignalKind;

type RepeatingCallback = Box<dyn FnMut() + Send + 'static>;

struct Repeating {
    callback: Mutex<Option<RepeatingCallback>>,
    cancelled: AtomicBool,
}

impl Expiry for Repeating {
    fn expire(&self) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let mut callback = self.callback.lock();
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if let Some(callback) = callback.as_mut() {
            if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                log::error("hires_timer.callback.panic", json!({}));
            }
        }
    }
}

/// Invokes a callback every `period` on the timer dispatch thread. Not
/// waitable.
///
/// Dropping the timer disarms it and waits for an invocation in progress, so
/// no callback starts or runs after drop returns. Dropping it from inside its
/// own callback is allowed; the running invocation is then the last one.
pub struct HighResolutionTimer {
    os: Option<OsTimer>,
    shared: Arc<Repeating>,
}

impl HighResolutionTimer {
    pub fn create_repeating<F>(period: Duration, callback: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        if period.is_zero() {
            return Err(SyncError::InvalidParameter("timer period must be non-zero"));
        }
        let shared = Arc::new(Repeating {
            callback: Mutex::new(Some(Box::new(callback))),
            cancelled: AtomicBool::new(false),
        });
        let target = Arc::downgrade(&shared);
        let os = OsTimer::create(SignalKind::HighResolutionTimer, target)?;
        os.arm(period, Some(period))?;
        Ok(Self {
            os: Some(os),
            shared,
        })
    }
}

impl Drop for HighResolutionTimer {
    fn drop(&mut self) {
        drop(self.os.take());
        self.shared.cancelled.store(true, Ordering::Release);
        if !dispatch::on_dispatch_thread() {
            // Waits out an invocation in progress on the dispatch thread.
            drop(self.shared.callback.lock().take());
        }
    }
}
