//! Cooperative thread termination.
//!
//! Host threads are never killed asynchronously. `Thread::terminate` marks the
//! target's control block; the target notices at its next termination point
//! (every wakeup inside a wait or sleep) and unwinds with a [`ThreadExit`]
//! payload, which the thread entry trampoline catches. Destructors on the
//! target's stack run during that unwind.

use std::cell::RefCell;
use std::sync::Arc;

use crate::thread::ThreadControl;

/// Unwind payload carrying the exit code of a terminated or exiting thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadExit {
    pub exit_code: i32,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadControl>>> = const { RefCell::new(None) };
}

/// Associate the calling thread with `control`.
pub fn bind_current(control: Arc<ThreadControl>) {
    CURRENT.with(|slot| *slot.borrow_mut() = Some(control));
}

/// Drop the association made by [`bind_current`].
pub fn unbind_current() {
    let _ = CURRENT.try_with(|slot| slot.borrow_mut().take());
}

/// Control block bound to the calling thread, if any.
#[must_use]
pub fn current_control() -> Option<Arc<ThreadControl>> {
    CURRENT
        .try_with(|slot| slot.borrow().clone())
        .ok()
        .flatten()
}

/// Unwind out of the calling thread with `exit_code`. Never returns.
pub fn unwind(exit_code: i32) -> ! {
    std::panic::resume_unwind(Box::new(ThreadExit { exit_code }))
}

/// Termination point: unwinds if termination of the calling thread has been
/// requested.
pub fn checkpoint() {
    let requested = CURRENT
        .try_with(|slot| {
            slot.borrow()
                .as_ref()
                .and_then(|control| control.pending_termination())
        })
        .ok()
        .flatten();
    if let Some(exit_code) = requested {
        unwind(exit_code);
    }
}

/// Extract the exit code from a panic payload produced by [`unwind`].
#[must_use]
pub fn exit_code_of(payload: &(dyn std::any::Any + Send)) -> Option<i32> {
    payload.downcast_ref::<ThreadExit>().map(|exit| exit.exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_thread_has_no_termination_point() {
        std::thread::spawn(|| {
            assert!(current_control().is_none());
            checkpoint();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn unwind_payload_round_trips_exit_code() {
        let caught = std::panic::catch_unwind::<_, ()>(|| unwind(17)).unwrap_err();
        assert_eq!(exit_code_of(caught.as_ref()), Some(17));
        let other = std::panic::catch_unwind::<_, ()>(|| panic!("boom")).unwrap_err();
        assert_eq!(exit_code_of(other.as_ref()), None);
    }

    #[test]
    fn requested_termination_unwinds_at_checkpoint() {
        let result = std::thread::spawn(|| {
            let control = Arc::new(ThreadControl::new(false));
            bind_current(Arc::clone(&control));
            control.mark_started();
            assert!(control.terminate(5));
            let caught = std::panic::catch_unwind(checkpoint).unwrap_err();
            unbind_current();
            exit_code_of(caught.as_ref())
        })
        .join()
        .unwrap();
        assert_eq!(result, Some(5));
    }
}
