//! Timer-signal dispatch thread.
//!
//! Every OS timer is created with `SIGEV_THREAD_ID` aimed at one dedicated
//! thread. That thread keeps both timer signals blocked and consumes them with
//! `sigwaitinfo`, so expiry routines run in ordinary thread context: they may
//! take locks and allocate, and all timer callbacks are serialized on it.
//!
//! The signal value carries a registry id, never a pointer. Destroyed timers
//! unregister their id, and late expirations for unknown ids are dropped.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{OnceLock, Weak};
use std::thread::ThreadId;

use guestsync_core::error::{Result, SyncError};
use guestsync_core::log;
use guestsync_core::timer::TimerCore;
use parking_lot::Mutex;
use serde_json::json;

use crate::signals::{self, BlockedSignals};
use crate::system;

/// Something that reacts to an OS timer expiry.
pub(crate) trait Expiry: Send + Sync {
    fn expire(&self);
}

impl Expiry for TimerCore {
    fn expire(&self) {
        self.complete();
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Registry {
    next_id: u64,
    targets: HashMap<u64, Weak<dyn Expiry>>,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            next_id: 1,
            targets: HashMap::new(),
        })
    })
}

pub(crate) fn register(target: Weak<dyn Expiry>) -> u64 {
    let mut registry = registry().lock();
    let id = registry.next_id;
    registry.next_id += 1;
    registry.targets.insert(id, target);
    id
}

pub(crate) fn unregister(id: u64) {
    registry().lock().targets.remove(&id);
}

fn dispatch(id: u64) {
    let target = registry().lock().targets.get(&id).and_then(Weak::upgrade);
    match target {
        Some(target) => target.expire(),
        None => log::trace("timer_dispatch.stale", json!({ "id": id })),
    }
}

// ---------------------------------------------------------------------------
// Dispatch thread
// ---------------------------------------------------------------------------

struct Dispatcher {
    tid: libc::pid_t,
    thread: ThreadId,
}

static DISPATCHER: OnceLock<Result<Dispatcher>> = OnceLock::new();

fn dispatcher() -> Result<&'static Dispatcher> {
    DISPATCHER
        .get_or_init(start)
        .as_ref()
        .map_err(Clone::clone)
}

fn start() -> Result<Dispatcher> {
    let (ready_tx, ready_rx) = mpsc::channel();
    let handle = std::thread::Builder::new()
        .name("guestsync-timer".to_owned())
        .spawn(move || run(&ready_tx))
        .map_err(|err| SyncError::Os {
            op: "spawn timer dispatch thread",
            errno: err.raw_os_error().unwrap_or(0),
        })?;
    let thread = handle.thread().id();
    let tid = ready_rx.recv().map_err(|_| SyncError::Os {
        op: "start timer dispatch thread",
        errno: 0,
    })??;
    Ok(Dispatcher { tid, thread })
}

fn run(ready: &mpsc::Sender<Result<libc::pid_t>>) {
    let set = signals::timer_set();
    let _blocked = match BlockedSignals::block(&set) {
        Ok(blocked) => blocked,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    let tid = system::current_thread_system_id() as libc::pid_t;
    let _ = ready.send(Ok(tid));
    log::debug("timer_dispatch.start", json!({ "tid": tid }));

    loop {
        // SAFETY: zeroed siginfo_t is a valid output buffer.
        let mut info = unsafe { std::mem::zeroed::<libc::siginfo_t>() };
        // SAFETY: `set` and `info` are valid for the duration of the call.
        let signo = unsafe { libc::sigwaitinfo(&set, &mut info) };
        if signo < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EINTR {
                log::error("timer_dispatch.wait", json!({ "op": "sigwaitinfo", "errno": errno }));
            }
            continue;
        }
        if info.si_code != libc::SI_TIMER {
            continue;
        }
        // SAFETY: SI_TIMER deliveries carry the sigval given to timer_create.
        let id = unsafe { info.si_value().sival_ptr } as usize as u64;
        dispatch(id);
    }
}

/// Kernel thread id that OS timers must target. Starts the dispatch thread on
/// first use.
pub(crate) fn target_tid() -> Result<libc::pid_t> {
    dispatcher().map(|d| d.tid)
}

/// Whether the caller is the dispatch thread (and therefore possibly inside a
/// timer callback).
pub(crate) fn on_dispatch_thread() -> bool {
    DISPATCHER
        .get()
        .and_then(|d| d.as_ref().ok())
        .is_some_and(|d| d.thread == std::thread::current().id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl Expiry for Counter {
        fn expire(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dispatch_reaches_live_targets_only() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let weak: Weak<Counter> = Arc::downgrade(&counter);
        let id = register(weak);
        dispatch(id);
        dispatch(id + 1_000_000);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        unregister(id);
        dispatch(id);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_target_is_skipped() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let weak: Weak<Counter> = Arc::downgrade(&counter);
        let id = register(weak);
        drop(counter);
        dispatch(id);
        unregister(id);
    }

    #[test]
    fn dispatch_thread_starts_once() {
        let first = target_tid().unwrap();
        assert_eq!(target_tid().unwrap(), first);
        assert!(first > 0);
        assert!(!on_dispatch_thread());
    }
}
