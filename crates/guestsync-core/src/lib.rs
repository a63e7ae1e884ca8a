//! # guestsync-core
//!
//! Win32-style wait objects for kernel emulation, in safe Rust.
//!
//! Every waitable object (events, semaphores, mutants, timers, threads) shares
//! one process-wide lock and condition variable owned by [`wait`]. That makes
//! "wait for all of these" and "wait for any of these" a single atomic
//! predicate check, at the cost of broadcast wakeups.
//!
//! This crate has no `unsafe` code and no host OS calls. The platform layer
//! (`guestsync-posix`) supplies OS timers, host threads, signal delivery and
//! the public wait façade on top of the types here.

#![deny(unsafe_code)]

pub mod alert;
pub mod config;
pub mod error;
pub mod event;
pub mod fence;
pub mod ident;
pub mod log;
pub mod mutant;
pub mod semaphore;
pub mod termination;
pub mod thread;
pub mod timer;
pub mod tls;
pub mod wait;

pub use error::{Result, SyncError};
pub use event::Event;
pub use fence::Fence;
pub use mutant::Mutant;
pub use semaphore::Semaphore;
pub use thread::{ThreadControl, ThreadState, UserCallback};
pub use timer::{TimerCallback, TimerCore};
pub use tls::{TlsHandle, allocate_tls_handle, free_tls_handle, get_tls_value, set_tls_value};
pub use wait::{Timeout, WaitHandle, WaitResult, Waitable};
