//! # guestsync-posix
//!
//! POSIX host layer for guestsync.
//!
//! Binds the wait objects from `guestsync-core` to the host: OS timers that
//! signal a dedicated dispatch thread, pthread-backed guest threads with
//! signal-driven suspend and user callbacks, and the public wait façade.
//!
//! # Signals
//!
//! Four real-time signals are reserved, starting at `SIGRTMIN`:
//!
//! ```text
//! SIGRTMIN+0  high-resolution timer expiry   (consumed by the dispatch thread)
//! SIGRTMIN+1  timer expiry                   (consumed by the dispatch thread)
//! SIGRTMIN+2  thread suspend                 (handler on the target thread)
//! SIGRTMIN+3  thread user callback           (handler on the target thread)
//! ```
//!
//! Host applications must not use these signals for anything else.

mod dispatch;
pub mod hires_timer;
mod os_timer;
pub mod signals;
pub mod system;
pub mod thread;
pub mod timer;
pub mod wait;
mod wake;

pub use guestsync_core::{
    Event, Fence, Mutant, Result, Semaphore, SyncError, ThreadState, TimerCallback, TlsHandle,
    allocate_tls_handle, free_tls_handle, get_tls_value, set_tls_value,
};
pub use hires_timer::HighResolutionTimer;
pub use system::{
    current_thread_id, current_thread_system_id, logical_processor_count, set_current_thread_id,
    set_current_thread_name,
};
pub use thread::{CreationParameters, Thread, ThreadPriority};
pub use timer::Timer;
pub use wait::{
    SleepResult, Timeout, WaitHandle, WaitResult, Waitable, alertable_sleep, maybe_yield,
    signal_and_wait, sleep, sync_memory, wait, wait_all, wait_any, wait_multiple,
};
