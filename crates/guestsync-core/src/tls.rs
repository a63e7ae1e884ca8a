//! Thread-local storage handles.
//!
//! A process-wide table of `TLS_KEYS_MAX` slots hands out handles; each thread
//! keeps its own values per slot.
//!
//! ## Design
//!
//! - **Slot registry**: one atomic sequence number per slot. Odd means
//!   allocated. Allocation and free bump the sequence under a writer lock, so
//!   a freed handle can never be freed twice or alias a later allocation.
//! - **Handles**: carry both the slot index and the sequence observed at
//!   allocation. Every operation checks the sequence, so stale handles read as
//!   unallocated.
//! - **Per-thread values**: a lazily grown `Vec` in a `thread_local!`. Each
//!   entry records the sequence it was written under; a value written for a
//!   previous owner of the slot reads back as 0 for the new one.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, SyncError};

/// Number of TLS slots in the process.
pub const TLS_KEYS_MAX: usize = 1024;

/// Opaque TLS handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TlsHandle {
    index: u32,
    seq: u32,
}

impl TlsHandle {
    /// A handle that is never allocated.
    pub const INVALID: Self = Self {
        index: u32::MAX,
        seq: 0,
    };

    /// Packed form for handing to guest code.
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        ((self.seq as u64) << 32) | self.index as u64
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            seq: (raw >> 32) as u32,
        }
    }

    fn slot(self) -> Option<&'static AtomicU32> {
        SLOT_SEQ.get(self.index as usize)
    }

    /// Whether the handle names a currently allocated slot.
    fn is_live(self) -> bool {
        self.seq % 2 == 1
            && self
                .slot()
                .is_some_and(|seq| seq.load(Ordering::Acquire) == self.seq)
    }
}

// ---------------------------------------------------------------------------
// Slot registry
// ---------------------------------------------------------------------------

static SLOT_SEQ: [AtomicU32; TLS_KEYS_MAX] = [const { AtomicU32::new(0) }; TLS_KEYS_MAX];

/// Serializes allocate/free so "find free slot" and "claim it" are atomic.
static SLOT_WRITE_LOCK: Mutex<()> = Mutex::new(());

/// Allocate a TLS handle. Every thread's value for it starts at 0.
pub fn allocate_tls_handle() -> Result<TlsHandle> {
    let _writer = SLOT_WRITE_LOCK.lock();
    for (index, seq) in SLOT_SEQ.iter().enumerate() {
        let current = seq.load(Ordering::Acquire);
        if current % 2 == 0 {
            let next = current.wrapping_add(1);
            seq.store(next, Ordering::Release);
            return Ok(TlsHandle {
                index: index as u32,
                seq: next,
            });
        }
    }
    Err(SyncError::TlsExhausted)
}

/// Free a TLS handle. Returns false for unallocated or already freed handles.
pub fn free_tls_handle(handle: TlsHandle) -> bool {
    let _writer = SLOT_WRITE_LOCK.lock();
    if !handle.is_live() {
        return false;
    }
    if let Some(seq) = handle.slot() {
        seq.store(handle.seq.wrapping_add(1), Ordering::Release);
    }
    true
}

// ---------------------------------------------------------------------------
// Per-thread values
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Default)]
struct Entry {
    seq: u32,
    value: usize,
}

thread_local! {
    static VALUES: RefCell<Vec<Entry>> = const { RefCell::new(Vec::new()) };
}

/// The calling thread's value for `handle`; 0 if never set or not allocated.
#[must_use]
pub fn get_tls_value(handle: TlsHandle) -> usize {
    if !handle.is_live() {
        return 0;
    }
    VALUES
        .try_with(|values| {
            values
                .borrow()
                .get(handle.index as usize)
                .filter(|entry| entry.seq == handle.seq)
                .map_or(0, |entry| entry.value)
        })
        .unwrap_or(0)
}

/// Set the calling thread's value for `handle`. Returns false if the handle is
/// not allocated.
pub fn set_tls_value(handle: TlsHandle, value: usize) -> bool {
    if !handle.is_live() {
        return false;
    }
    VALUES
        .try_with(|values| {
            let mut values = values.borrow_mut();
            let index = handle.index as usize;
            if values.len() <= index {
                values.resize(index + 1, Entry::default());
            }
            values[index] = Entry {
                seq: handle.seq,
                value,
            };
        })
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_start_at_zero_and_are_per_thread() {
        let handle = allocate_tls_handle().unwrap();
        assert_eq!(get_tls_value(handle), 0);
        assert!(set_tls_value(handle, 0xdead));
        assert_eq!(get_tls_value(handle), 0xdead);
        let remote = std::thread::spawn(move || {
            let before = get_tls_value(handle);
            set_tls_value(handle, 7);
            (before, get_tls_value(handle))
        })
        .join()
        .unwrap();
        assert_eq!(remote, (0, 7));
        assert_eq!(get_tls_value(handle), 0xdead);
        assert!(free_tls_handle(handle));
    }

    #[test]
    fn double_free_and_invalid_free_fail() {
        let handle = allocate_tls_handle().unwrap();
        assert!(free_tls_handle(handle));
        assert!(!free_tls_handle(handle));
        assert!(!free_tls_handle(TlsHandle::INVALID));
        assert!(!set_tls_value(handle, 1));
        assert_eq!(get_tls_value(handle), 0);
    }

    #[test]
    fn reallocated_slot_does_not_inherit_old_value() {
        let old = allocate_tls_handle().unwrap();
        assert!(set_tls_value(old, 42));
        assert!(free_tls_handle(old));
        // Lowest free slot wins, so this usually reuses `old`'s slot.
        let handle = allocate_tls_handle().unwrap();
        assert_ne!(handle, old);
        assert_eq!(get_tls_value(handle), 0);
        assert!(!free_tls_handle(old));
        assert!(free_tls_handle(handle));
    }

    #[test]
    fn raw_form_round_trips() {
        let handle = allocate_tls_handle().unwrap();
        assert_eq!(TlsHandle::from_raw(handle.to_raw()), handle);
        assert!(free_tls_handle(handle));
    }
}
