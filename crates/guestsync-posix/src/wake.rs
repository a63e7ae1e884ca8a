//! Wait-engine wakeups on behalf of signal handlers.
//!
//! A handler cannot take the wait lock, so it writes one byte to a
//! non-blocking pipe instead. The `guestsync-wake` thread drains the pipe and
//! broadcasts on the engine condition variable, which makes every blocked
//! wait re-check its predicate and any delivered user callback.

use std::ffi::c_int;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI32, Ordering};

use guestsync_core::error::{Result, SyncError};
use guestsync_core::log;
use guestsync_core::wait;
use serde_json::json;

use crate::signals::BlockedSignals;

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);
static STARTED: OnceLock<Result<()>> = OnceLock::new();

/// Create the pipe and start the wake thread. Later calls return the first
/// outcome.
pub(crate) fn start() -> Result<()> {
    STARTED.get_or_init(spawn).clone()
}

fn spawn() -> Result<()> {
    let mut fds: [c_int; 2] = [-1; 2];
    // SAFETY: `fds` is a writable array of two descriptors.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(SyncError::last_os_error("pipe2"));
    }
    let [read_fd, write_fd] = fds;
    if let Err(err) = set_nonblocking(write_fd) {
        close_pair(read_fd, write_fd);
        return Err(err);
    }

    let spawned = std::thread::Builder::new()
        .name("guestsync-wake".to_owned())
        .spawn(move || run(read_fd));
    if let Err(err) = spawned {
        close_pair(read_fd, write_fd);
        return Err(SyncError::Os {
            op: "spawn wake thread",
            errno: err.raw_os_error().unwrap_or(0),
        });
    }
    WRITE_FD.store(write_fd, Ordering::Release);
    log::debug("wake.start", json!({ "read_fd": read_fd, "write_fd": write_fd }));
    Ok(())
}

fn set_nonblocking(fd: c_int) -> Result<()> {
    // SAFETY: `fd` is an open descriptor owned by this module.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(SyncError::last_os_error("fcntl"));
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(SyncError::last_os_error("fcntl"));
    }
    Ok(())
}

fn close_pair(read_fd: c_int, write_fd: c_int) {
    // SAFETY: both descriptors were created by pipe2 and are closed once.
    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

fn run(read_fd: c_int) {
    let _blocked = BlockedSignals::thread_control().ok();
    let mut buf = [0u8; 64];
    loop {
        // SAFETY: `buf` is writable for its full length.
        let n = unsafe { libc::read(read_fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n > 0 {
            wait::lock().notify_all();
            continue;
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if n < 0 && errno == libc::EINTR {
            continue;
        }
        log::error("wake.read", json!({ "result": n, "errno": errno }));
        return;
    }
}

/// Ask the wake thread to broadcast on the wait engine. Async-signal-safe.
pub(crate) fn wake_waiters() {
    let fd = WRITE_FD.load(Ordering::Acquire);
    if fd < 0 {
        return;
    }
    let byte = 1u8;
    // SAFETY: write(2) is async-signal-safe and `byte` outlives the call. A
    // full pipe (EAGAIN) already has a wakeup pending.
    unsafe { libc::write(fd, std::ptr::from_ref(&byte).cast(), 1) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestsync_core::wait::{Timeout, WaitGuard, WaitResult, Waitable, wait_one};
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    /// Becomes signaled without broadcasting, like a flag set in a handler.
    struct QuietFlag(AtomicBool);

    impl Waitable for QuietFlag {
        fn signaled(&self, _guard: &WaitGuard<'_>) -> bool {
            self.0.load(Ordering::Relaxed)
        }
        fn post_wait(&self, _guard: &WaitGuard<'_>) {}
        fn signal(&self) -> bool {
            false
        }
    }

    #[test]
    fn start_is_idempotent() {
        assert!(start().is_ok());
        assert!(start().is_ok());
        assert!(WRITE_FD.load(Ordering::Acquire) >= 0);
    }

    #[test]
    fn wake_makes_blocked_waits_recheck() {
        start().unwrap();
        let flag = Arc::new(QuietFlag(AtomicBool::new(false)));
        let target = Arc::clone(&flag);
        let waiter = std::thread::spawn(move || {
            let started = Instant::now();
            let result = wait_one(&*target, Timeout::from_millis(5_000));
            (result, started.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        {
            let _guard = wait::lock();
            flag.0.store(true, Ordering::Relaxed);
        }
        wake_waiters();
        let (result, elapsed) = waiter.join().unwrap();
        assert_eq!(result, WaitResult::Success);
        assert!(elapsed < Duration::from_secs(4), "woke only at the deadline");
    }
}
