//! Host introspection: processor count, thread ids and thread names.

use std::cell::Cell;
use std::ffi::CString;

use guestsync_core::error::{Result, SyncError};

/// Longest name the kernel keeps for a thread, excluding the terminator.
pub const MAX_THREAD_NAME_LEN: usize = 15;

/// Number of logical processors on the host.
#[must_use]
pub fn logical_processor_count() -> u32 {
    u32::try_from(num_cpus::get()).unwrap_or(u32::MAX)
}

/// Kernel thread id of the calling thread.
#[must_use]
pub fn current_thread_system_id() -> u32 {
    // SAFETY: gettid takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

thread_local! {
    // 0 means "not overridden".
    static THREAD_ID_OVERRIDE: Cell<u32> = const { Cell::new(0) };
}

/// Guest-visible id of the calling thread. Defaults to the system id until
/// overridden with [`set_current_thread_id`].
#[must_use]
pub fn current_thread_id() -> u32 {
    match THREAD_ID_OVERRIDE.with(Cell::get) {
        0 => current_thread_system_id(),
        id => id,
    }
}

/// Override the calling thread's guest-visible id. 0 restores the default.
pub fn set_current_thread_id(id: u32) {
    THREAD_ID_OVERRIDE.with(|slot| slot.set(id));
}

/// Truncate `name` to what the kernel accepts: at most
/// [`MAX_THREAD_NAME_LEN`] bytes, cut on a character boundary, with interior
/// NULs ending the name.
#[must_use]
pub fn truncate_thread_name(name: &str) -> &str {
    let name = name.split('\0').next().unwrap_or_default();
    if name.len() <= MAX_THREAD_NAME_LEN {
        return name;
    }
    let mut end = MAX_THREAD_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Name the host thread `handle`.
pub fn set_host_thread_name(handle: libc::pthread_t, name: &str) -> Result<()> {
    let cname = CString::new(truncate_thread_name(name))
        .map_err(|_| SyncError::InvalidParameter("thread name"))?;
    // SAFETY: `cname` is NUL-terminated and within the kernel's length limit;
    // the caller guarantees `handle` is live.
    let rc = unsafe { libc::pthread_setname_np(handle, cname.as_ptr()) };
    if rc != 0 {
        return Err(SyncError::from_code("pthread_setname_np", rc));
    }
    Ok(())
}

/// Name the calling thread.
pub fn set_current_thread_name(name: &str) -> Result<()> {
    // SAFETY: pthread_self is always valid for the calling thread.
    set_host_thread_name(unsafe { libc::pthread_self() }, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processor_count_is_positive() {
        assert!(logical_processor_count() >= 1);
    }

    #[test]
    fn thread_id_override_is_per_thread() {
        std::thread::spawn(|| {
            let system = current_thread_system_id();
            assert_eq!(current_thread_id(), system);
            set_current_thread_id(0xF800_0010);
            assert_eq!(current_thread_id(), 0xF800_0010);
            let other = std::thread::spawn(current_thread_id).join().unwrap();
            assert_ne!(other, 0xF800_0010);
            set_current_thread_id(0);
            assert_eq!(current_thread_id(), system);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn system_ids_differ_across_threads() {
        let here = current_thread_system_id();
        let there = std::thread::spawn(current_thread_system_id).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn names_are_truncated_for_the_kernel() {
        assert_eq!(truncate_thread_name("short"), "short");
        assert_eq!(truncate_thread_name("exactly15bytes!"), "exactly15bytes!");
        assert_eq!(truncate_thread_name("a name that is far too long"), "a name that is ");
        assert_eq!(truncate_thread_name("nul\0tail"), "nul");
        assert_eq!(truncate_thread_name("ééééééééé").len(), 14);
    }

    #[test]
    fn current_thread_can_be_named() {
        std::thread::spawn(|| {
            set_current_thread_name("guestsync test thread").unwrap();
            let mut buf = [0 as libc::c_char; 32];
            // SAFETY: buffer is writable and its length is passed.
            let rc = unsafe { libc::pthread_getname_np(libc::pthread_self(), buf.as_mut_ptr(), buf.len()) };
            assert_eq!(rc, 0);
            // SAFETY: pthread_getname_np NUL-terminates on success.
            let name = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
            assert_eq!(name.to_str().unwrap(), "guestsync test ");
        })
        .join()
        .unwrap();
    }
}
