//! Signal/wait latch for handing a single wakeup between two threads.
//!
//! Independent of the shared wait lock: a fence never takes part in
//! multi-object waits.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
pub struct Fence {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Fence {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    /// Block until signaled, then consume the signal.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
        *signaled = false;
    }
}
