//! Process-unique thread identity.
//!
//! Mutant ownership compares these tokens instead of relying on a host
//! recursive lock, so cross-thread release attempts can be rejected. Tokens
//! start at 1 and are never reused; 0 means "no thread".

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Token value that never identifies a thread.
pub const NO_THREAD: u64 = 0;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static TOKEN: Cell<u64> = const { Cell::new(NO_THREAD) };
}

/// Identity of the calling thread, assigned on first use.
#[must_use]
pub fn current_thread_token() -> u64 {
    TOKEN.with(|slot| {
        let existing = slot.get();
        if existing != NO_THREAD {
            return existing;
        }
        let fresh = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        slot.set(fresh);
        fresh
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_stable_within_a_thread() {
        let first = current_thread_token();
        assert_ne!(first, NO_THREAD);
        assert_eq!(current_thread_token(), first);
    }

    #[test]
    fn tokens_differ_across_threads() {
        let here = current_thread_token();
        let there = std::thread::spawn(current_thread_token).join().unwrap();
        assert_ne!(here, there);
    }
}
