//! Error taxonomy for guestsync operations.
//!
//! Waits never produce errors: they report `Success`, `Timeout` or `Failed`
//! through [`crate::wait::WaitResult`]. Everything else that can fail without
//! side effects returns a [`SyncError`].

use thiserror::Error;

/// Failure of a synchronization or thread-control operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// A parameter was outside its documented range. Nothing was mutated.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// A semaphore release would push the count past its maximum.
    #[error("semaphore release of {release} exceeds maximum {maximum} (count {count})")]
    SemaphoreLimit { count: i32, release: i32, maximum: i32 },

    /// The calling thread does not own the mutant it tried to release.
    #[error("calling thread does not own the mutant")]
    NotOwner,

    /// Resume was requested for a thread whose suspend count is already zero.
    #[error("thread is not suspended")]
    NotSuspended,

    /// The thread has already reached its terminal state.
    #[error("thread has finished")]
    ThreadFinished,

    /// Every TLS slot is allocated.
    #[error("TLS handle table exhausted")]
    TlsExhausted,

    /// A host OS call failed.
    #[error("{op} failed with errno {errno}")]
    Os { op: &'static str, errno: i32 },
}

impl SyncError {
    /// Build an [`SyncError::Os`] from the calling thread's `errno`.
    #[must_use]
    pub fn last_os_error(op: &'static str) -> Self {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Self::Os { op, errno }
    }

    /// Build an [`SyncError::Os`] from a pthread-style return code.
    #[must_use]
    pub const fn from_code(op: &'static str, errno: i32) -> Self {
        Self::Os { op, errno }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SyncError>;
