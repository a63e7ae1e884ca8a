//! Real-time signal registry.
//!
//! Each [`SignalKind`] owns one real-time signal, `SIGRTMIN + index`, and
//! shares a single `SA_SIGINFO` handler installed at most once per process.
//!
//! Handlers stay small. Thread-control handlers only read a thread-local
//! pointer, touch atomics, write one byte to the wake pipe and, for
//! suspension, park on the thread's private futex-backed condition variable.
//! Nothing reachable from a handler uses `parking_lot`. Both thread-control signals are masked while either
//! handler runs so parking can never nest. Timer signals are consumed
//! synchronously by the dispatch thread; their handler is a no-op that only
//! exists so a stray delivery cannot terminate the process.

use std::ffi::{c_int, c_void};
use std::sync::OnceLock;

use guestsync_core::error::{Result, SyncError};

use crate::thread;

/// Purpose of a real-time signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    HighResolutionTimer,
    Timer,
    ThreadSuspend,
    ThreadUserCallback,
}

impl SignalKind {
    pub const ALL: [Self; 4] = [
        Self::HighResolutionTimer,
        Self::Timer,
        Self::ThreadSuspend,
        Self::ThreadUserCallback,
    ];

    const fn index(self) -> usize {
        match self {
            Self::HighResolutionTimer => 0,
            Self::Timer => 1,
            Self::ThreadSuspend => 2,
            Self::ThreadUserCallback => 3,
        }
    }

    /// Host signal number carrying this purpose.
    #[must_use]
    pub fn system_signal(self) -> c_int {
        libc::SIGRTMIN() + self.index() as c_int
    }

    /// Reverse of [`SignalKind::system_signal`].
    #[must_use]
    pub fn from_system_signal(signo: c_int) -> Option<Self> {
        let offset = signo.checked_sub(libc::SIGRTMIN())?;
        Self::ALL.into_iter().find(|kind| kind.index() as c_int == offset)
    }
}

// ---------------------------------------------------------------------------
// Signal sets and masks
// ---------------------------------------------------------------------------

fn signal_set(kinds: &[SignalKind]) -> libc::sigset_t {
    // SAFETY: sigset_t is plain data; sigemptyset fully initializes it.
    let mut set = unsafe { std::mem::zeroed::<libc::sigset_t>() };
    // SAFETY: `set` is a valid, writable sigset_t.
    unsafe { libc::sigemptyset(&mut set) };
    for kind in kinds {
        // SAFETY: `set` is initialized and the signal number is in range.
        unsafe { libc::sigaddset(&mut set, kind.system_signal()) };
    }
    set
}

/// Signals interrupting a thread for suspension or user callbacks.
#[must_use]
pub fn thread_control_set() -> libc::sigset_t {
    signal_set(&[SignalKind::ThreadSuspend, SignalKind::ThreadUserCallback])
}

/// Signals raised by OS timers.
#[must_use]
pub fn timer_set() -> libc::sigset_t {
    signal_set(&[SignalKind::HighResolutionTimer, SignalKind::Timer])
}

/// Blocks a signal set on the calling thread until dropped, then restores the
/// previous mask.
pub struct BlockedSignals {
    previous: libc::sigset_t,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl BlockedSignals {
    pub fn block(set: &libc::sigset_t) -> Result<Self> {
        // SAFETY: zeroed sigset_t is a valid output buffer for pthread_sigmask.
        let mut previous = unsafe { std::mem::zeroed::<libc::sigset_t>() };
        // SAFETY: both pointers reference live sigset_t values.
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, set, &mut previous) };
        if rc != 0 {
            return Err(SyncError::from_code("pthread_sigmask", rc));
        }
        Ok(Self {
            previous,
            _not_send: std::marker::PhantomData,
        })
    }

    pub fn thread_control() -> Result<Self> {
        Self::block(&thread_control_set())
    }

    /// The mask that was in effect before this guard.
    #[must_use]
    pub fn previous(&self) -> &libc::sigset_t {
        &self.previous
    }
}

impl Drop for BlockedSignals {
    fn drop(&mut self) {
        // SAFETY: restores the mask captured in `block` on the same thread.
        unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, std::ptr::null_mut()) };
    }
}

/// Unblock thread-control signals on the calling thread.
pub fn unblock_thread_control() -> Result<()> {
    let set = thread_control_set();
    // SAFETY: `set` is initialized; old mask output is not requested.
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(SyncError::from_code("pthread_sigmask", rc));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Handler installation
// ---------------------------------------------------------------------------

static INSTALLED: [OnceLock<Result<()>>; 4] = [const { OnceLock::new() }; 4];

/// Install the shared handler for `kind`. Later calls return the first
/// outcome without touching the disposition again.
pub fn install_handler(kind: SignalKind) -> Result<()> {
    INSTALLED[kind.index()]
        .get_or_init(|| {
            // SAFETY: zeroed sigaction is a valid starting value on Linux.
            let mut action = unsafe { std::mem::zeroed::<libc::sigaction>() };
            action.sa_sigaction = handle_signal as SigInfoHandler as libc::sighandler_t;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
            action.sa_mask = thread_control_set();
            // SAFETY: `action` is fully initialized; the old action is not requested.
            let rc = unsafe { libc::sigaction(kind.system_signal(), &action, std::ptr::null_mut()) };
            if rc != 0 {
                return Err(SyncError::last_os_error("sigaction"));
            }
            Ok(())
        })
        .clone()
}

type SigInfoHandler = extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void);

extern "C" fn handle_signal(signo: c_int, _info: *mut libc::siginfo_t, _context: *mut c_void) {
    // SAFETY: errno is thread-local; saved and restored around the handler body.
    let saved_errno = unsafe { *libc::__errno_location() };
    match SignalKind::from_system_signal(signo) {
        Some(SignalKind::ThreadSuspend) => thread::on_suspend_signal(),
        Some(SignalKind::ThreadUserCallback) => thread::on_user_callback_signal(),
        Some(SignalKind::HighResolutionTimer | SignalKind::Timer) | None => {}
    }
    // SAFETY: as above.
    unsafe { *libc::__errno_location() = saved_errno };
}

/// Send `kind` to the host thread `target`.
pub fn send(target: libc::pthread_t, kind: SignalKind) -> Result<()> {
    // SAFETY: `target` names a thread whose handle has not been released.
    let rc = unsafe { libc::pthread_kill(target, kind.system_signal()) };
    if rc != 0 {
        return Err(SyncError::from_code("pthread_kill", rc));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_numbers_are_distinct_realtime_signals() {
        let numbers: Vec<c_int> = SignalKind::ALL.iter().map(|k| k.system_signal()).collect();
        for (i, n) in numbers.iter().enumerate() {
            assert!(*n >= libc::SIGRTMIN() && *n <= libc::SIGRTMAX());
            assert!(!numbers[i + 1..].contains(n));
        }
    }

    #[test]
    fn reverse_mapping_matches() {
        for kind in SignalKind::ALL {
            assert_eq!(SignalKind::from_system_signal(kind.system_signal()), Some(kind));
        }
        assert_eq!(SignalKind::from_system_signal(libc::SIGINT), None);
        assert_eq!(SignalKind::from_system_signal(libc::SIGRTMIN() + 4), None);
    }

    #[test]
    fn install_is_idempotent() {
        assert!(install_handler(SignalKind::Timer).is_ok());
        assert!(install_handler(SignalKind::Timer).is_ok());
    }

    #[test]
    fn blocked_signals_restore_previous_mask() {
        let set = thread_control_set();
        let is_blocked = || {
            // SAFETY: query-only pthread_sigmask with a valid output buffer.
            let mut current = unsafe { std::mem::zeroed::<libc::sigset_t>() };
            unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), &mut current) };
            // SAFETY: `current` was filled in above.
            unsafe { libc::sigismember(&current, SignalKind::ThreadSuspend.system_signal()) == 1 }
        };
        std::thread::spawn(move || {
            assert!(!is_blocked());
            {
                let _blocked = BlockedSignals::block(&set).unwrap();
                assert!(is_blocked());
            }
            assert!(!is_blocked());
        })
        .join()
        .unwrap();
    }
}
