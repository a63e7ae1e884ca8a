//! Host threads with suspend/resume, user callbacks and cooperative
//! termination.
//!
//! ## Design
//!
//! - **Creation**: raw `pthread_create` with an explicit stack size. The
//!   creator blocks the thread-control signals before spawning, so the child
//!   starts with them blocked, publishes itself, parks while its suspend count
//!   is non-zero and only then unblocks them.
//! - **Suspension**: the 0→1 transition of the suspend count sends the
//!   suspend signal; the handler parks on the thread's private futex-backed
//!   condition variable until the count returns to 0. A thread suspended
//!   inside a wait stays queued on the wait engine and does not consume a
//!   signal until it is resumed.
//! - **User callbacks**: stored in the control block, then the callback
//!   signal is sent. The handler only records that the target was alertable;
//!   the callback itself runs in thread context when the alertable wait or
//!   sleep wakes.
//! - **Termination**: cooperative. The target finishes immediately from the
//!   point of view of waiters, and unwinds at its next wait or sleep.
//! - **Handle release**: exactly once, on drop of the last reference. A
//!   thread that has left its start routine is joined; one still running (or
//!   dropping its own last reference) is detached.

use std::cell::Cell;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use guestsync_core::alert;
use guestsync_core::error::{Result, SyncError};
use guestsync_core::log;
use guestsync_core::termination;
use guestsync_core::thread::{ThreadControl, ThreadState, UserCallback};
use guestsync_core::wait::{WaitHandle, Waitable};
use parking_lot::Mutex;
use serde_json::json;

use crate::signals::{self, BlockedSignals, SignalKind};
use crate::system;
use crate::wake;

/// Default host stack size for created threads.
pub const DEFAULT_STACK_SIZE: usize = 4 * 1024 * 1024;

/// Exit code recorded when a start routine panics.
pub const PANIC_EXIT_CODE: i32 = -1;

/// Logical priority levels.
pub struct ThreadPriority;

impl ThreadPriority {
    pub const LOWEST: i32 = -2;
    pub const BELOW_NORMAL: i32 = -1;
    pub const NORMAL: i32 = 0;
    pub const ABOVE_NORMAL: i32 = 1;
    pub const HIGHEST: i32 = 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreationParameters {
    pub stack_size: usize,
    pub initial_priority: i32,
    pub create_suspended: bool,
    pub affinity_mask: Option<u64>,
}

impl Default for CreationParameters {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            initial_priority: ThreadPriority::NORMAL,
            create_suspended: false,
            affinity_mask: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Thread object
// ---------------------------------------------------------------------------

pub struct Thread {
    control: Arc<ThreadControl>,
    host: OnceLock<libc::pthread_t>,
    /// Cleared once the host handle has been joined or detached.
    owns_handle: AtomicBool,
    /// Set when the start routine has returned and the host thread is about
    /// to exit, so a join cannot block on guest code.
    exited: AtomicBool,
    system_id: AtomicU32,
    name: Mutex<String>,
    priority: AtomicI32,
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("system_id", &self.system_id())
            .field("name", &*self.name.lock())
            .field("control", &self.control)
            .finish_non_exhaustive()
    }
}

struct StartPayload {
    thread: Arc<Thread>,
    routine: Box<dyn FnOnce() + Send + 'static>,
    affinity_mask: Option<u64>,
}

thread_local! {
    // Read from signal handlers: a const-initialized Cell has no destructor,
    // so it stays accessible for the whole life of the thread.
    static CURRENT: Cell<*const Thread> = const { Cell::new(std::ptr::null()) };
    static ADOPTED: AdoptedSlot = const { AdoptedSlot(std::cell::RefCell::new(None)) };
}

/// Keeps an adopted thread's object alive; clears `CURRENT` before releasing it.
struct AdoptedSlot(std::cell::RefCell<Option<Arc<Thread>>>);

impl Drop for AdoptedSlot {
    fn drop(&mut self) {
        CURRENT.with(|current| current.set(std::ptr::null()));
        termination::unbind_current();
    }
}

impl Thread {
    fn new_object(control: ThreadControl, priority: i32, owns_handle: bool) -> Self {
        Self {
            control: Arc::new(control),
            host: OnceLock::new(),
            owns_handle: AtomicBool::new(owns_handle),
            exited: AtomicBool::new(false),
            system_id: AtomicU32::new(0),
            name: Mutex::new(String::new()),
            priority: AtomicI32::new(priority),
        }
    }

    /// Start a host thread running `start_routine`.
    ///
    /// Returns once the new thread has started; with `create_suspended` it is
    /// then parked in `Suspended` until [`Thread::resume`].
    pub fn create<F>(params: CreationParameters, start_routine: F) -> Result<Arc<Self>>
    where
        F: FnOnce() + Send + 'static,
    {
        if params.affinity_mask == Some(0) {
            return Err(SyncError::InvalidParameter("affinity mask must select a processor"));
        }
        wake::start()?;
        signals::install_handler(SignalKind::ThreadSuspend)?;
        signals::install_handler(SignalKind::ThreadUserCallback)?;

        let thread = Arc::new(Self::new_object(
            ThreadControl::new(params.create_suspended),
            params.initial_priority,
            true,
        ));
        let payload = Box::new(StartPayload {
            thread: Arc::clone(&thread),
            routine: Box::new(start_routine),
            affinity_mask: params.affinity_mask,
        });

        let tid = {
            let _blocked = BlockedSignals::thread_control()?;
            spawn_host(params.stack_size, payload)?
        };
        let _ = thread.host.set(tid);
        thread.control.wait_started();

        log::debug(
            "thread.create",
            json!({
                "system_id": thread.system_id(),
                "stack_size": params.stack_size,
                "suspended": params.create_suspended,
            }),
        );
        Ok(thread)
    }

    /// The thread object of the calling thread. Threads not created through
    /// [`Thread::create`] (such as `main`) are adopted on first call.
    #[must_use]
    pub fn current() -> Arc<Self> {
        let existing = CURRENT.with(Cell::get);
        if !existing.is_null() {
            // SAFETY: a non-null CURRENT always points into an Arc kept alive
            // by the thread's start payload or its adopted slot.
            return unsafe {
                Arc::increment_strong_count(existing);
                Arc::from_raw(existing)
            };
        }
        Self::adopt_current()
    }

    fn adopt_current() -> Arc<Self> {
        let control = ThreadControl::new(false);
        control.mark_started();
        let thread = Arc::new(Self::new_object(control, ThreadPriority::NORMAL, false));
        // SAFETY: pthread_self is always valid for the calling thread.
        let _ = thread.host.set(unsafe { libc::pthread_self() });
        thread
            .system_id
            .store(system::current_thread_system_id(), Ordering::Release);
        if let Err(err) = wake::start() {
            log::warn("thread.adopt.wake", json!({ "error": err.to_string() }));
        }
        let _ = signals::install_handler(SignalKind::ThreadSuspend);
        let _ = signals::install_handler(SignalKind::ThreadUserCallback);

        termination::bind_current(Arc::clone(&thread.control));
        ADOPTED.with(|slot| *slot.0.borrow_mut() = Some(Arc::clone(&thread)));
        CURRENT.with(|current| current.set(Arc::as_ptr(&thread)));
        thread
    }

    /// Exit the calling thread with `exit_code`. Never returns.
    ///
    /// The stack unwinds to the thread entry point, running destructors on
    /// the way. On an adopted thread the unwind reaches that thread's own
    /// entry point instead.
    pub fn exit(exit_code: i32) -> ! {
        Self::current().control.finish(exit_code);
        termination::unwind(exit_code)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn state(&self) -> ThreadState {
        self.control.state()
    }

    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.control.exit_code()
    }

    #[must_use]
    pub fn suspend_count(&self) -> u32 {
        self.control.suspend_count()
    }

    /// Kernel thread id.
    #[must_use]
    pub fn system_id(&self) -> u32 {
        self.system_id.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn control(&self) -> &Arc<ThreadControl> {
        &self.control
    }

    fn is_current(&self) -> bool {
        std::ptr::eq(CURRENT.with(Cell::get), self)
    }

    /// Host handle, while the host thread may still be signaled.
    fn live_host(&self) -> Option<libc::pthread_t> {
        if self.control.is_finished() || self.exited.load(Ordering::Acquire) {
            return None;
        }
        self.host.get().copied()
    }

    // -----------------------------------------------------------------------
    // Name, affinity, priority
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Record `name` and apply its first 15 bytes to the host thread.
    pub fn set_name(&self, name: &str) {
        *self.name.lock() = name.to_owned();
        if let Some(host) = self.live_host() {
            if let Err(err) = system::set_host_thread_name(host, name) {
                log::debug("thread.set_name", json!({ "error": err.to_string() }));
            }
        }
    }

    /// Processors the thread may run on, one bit per processor (first 64).
    pub fn affinity_mask(&self) -> Result<u64> {
        let host = self.live_host().ok_or(SyncError::ThreadFinished)?;
        get_affinity(host)
    }

    pub fn set_affinity_mask(&self, mask: u64) -> Result<()> {
        if mask == 0 {
            return Err(SyncError::InvalidParameter("affinity mask must select a processor"));
        }
        let host = self.live_host().ok_or(SyncError::ThreadFinished)?;
        set_affinity(host, mask).inspect_err(|err| {
            log::warn("thread.set_affinity_mask", json!({ "mask": mask, "error": err.to_string() }));
        })
    }

    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Acquire)
    }

    /// Record the logical priority and pass it through to the host scheduler
    /// where permitted. Levels above normal need real-time scheduling rights;
    /// without them the host priority is left alone.
    pub fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Release);
        if let Some(host) = self.live_host() {
            apply_priority(host, priority);
        }
    }

    // -----------------------------------------------------------------------
    // Suspend / resume
    // -----------------------------------------------------------------------

    /// Increment the suspend count; returns the previous count. The thread
    /// stops asynchronously, shortly after the first suspension.
    pub fn suspend(&self) -> Result<u32> {
        let previous = self.control.request_suspend()?;
        if previous == 0 {
            if let Some(host) = self.live_host() {
                if let Err(err) = signals::send(host, SignalKind::ThreadSuspend) {
                    log::warn("thread.suspend", json!({ "error": err.to_string() }));
                }
            }
        }
        Ok(previous)
    }

    /// Decrement the suspend count; returns the previous count. At zero the
    /// thread continues.
    pub fn resume(&self) -> Result<u32> {
        if self.is_current() {
            // A pending suspend signal must not park us while we hold the
            // park lock.
            let _blocked = BlockedSignals::thread_control()?;
            return self.control.resume();
        }
        self.control.resume()
    }

    // -----------------------------------------------------------------------
    // User callbacks and termination
    // -----------------------------------------------------------------------

    /// Queue `callback` for the thread. It runs only if the thread is in an
    /// alertable wait or sleep when the notification arrives; otherwise it
    /// stays unexecuted until replaced by the next queued callback.
    pub fn queue_user_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let callback: UserCallback = Box::new(callback);
        self.control.store_callback(callback);
        if let Some(host) = self.live_host() {
            if let Err(err) = signals::send(host, SignalKind::ThreadUserCallback) {
                log::warn("thread.queue_user_callback", json!({ "error": err.to_string() }));
            }
        }
    }

    /// Finish the thread with `exit_code`. Waiters are released immediately;
    /// the host thread unwinds at its next wait or sleep. Returns false if the
    /// thread had already finished.
    pub fn terminate(&self, exit_code: i32) -> bool {
        let host = self.live_host();
        let terminated = if self.is_current() {
            // Keeps a suspend signal from parking us on the held park lock.
            let _blocked = BlockedSignals::thread_control().ok();
            self.control.terminate(exit_code)
        } else {
            self.control.terminate(exit_code)
        };
        if !terminated {
            return false;
        }
        log::debug(
            "thread.terminate",
            json!({ "system_id": self.system_id(), "exit_code": exit_code }),
        );
        if self.is_current() {
            termination::unwind(exit_code);
        }
        if let Some(host) = host {
            // Interrupts a sleep so the target reaches a termination point.
            let _ = signals::send(host, SignalKind::ThreadUserCallback);
        }
        true
    }

    // -----------------------------------------------------------------------
    // Host handle
    // -----------------------------------------------------------------------

    fn release_handle(&self) {
        if !self.owns_handle.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(&host) = self.host.get() else {
            return;
        };
        // SAFETY: pthread_self is always valid for the calling thread.
        let on_self = unsafe { libc::pthread_equal(host, libc::pthread_self()) } != 0;
        if on_self || !self.exited.load(Ordering::Acquire) {
            // SAFETY: the handle is owned and released exactly once.
            let rc = unsafe { libc::pthread_detach(host) };
            if rc != 0 {
                log::warn("thread.detach", json!({ "errno": rc }));
            }
        } else {
            // SAFETY: as above; the thread has left guest code, so the join
            // only waits for host thread teardown.
            let rc = unsafe { libc::pthread_join(host, std::ptr::null_mut()) };
            if rc != 0 {
                log::warn("thread.join", json!({ "errno": rc }));
            }
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.release_handle();
    }
}

impl WaitHandle for Thread {
    fn waitable(&self) -> Option<&dyn Waitable> {
        Some(&*self.control)
    }
}

// ---------------------------------------------------------------------------
// Host thread entry
// ---------------------------------------------------------------------------

fn spawn_host(stack_size: usize, payload: Box<StartPayload>) -> Result<libc::pthread_t> {
    // SAFETY: pthread_attr_t is initialized by pthread_attr_init before use.
    let mut attr = unsafe { std::mem::zeroed::<libc::pthread_attr_t>() };
    // SAFETY: `attr` is writable.
    let rc = unsafe { libc::pthread_attr_init(&mut attr) };
    if rc != 0 {
        return Err(SyncError::from_code("pthread_attr_init", rc));
    }
    let stack_size = stack_size.max(libc::PTHREAD_STACK_MIN);
    // SAFETY: `attr` is initialized.
    let rc = unsafe { libc::pthread_attr_setstacksize(&mut attr, stack_size) };
    if rc != 0 {
        // SAFETY: `attr` is initialized and destroyed once.
        unsafe { libc::pthread_attr_destroy(&mut attr) };
        return Err(SyncError::from_code("pthread_attr_setstacksize", rc));
    }

    let raw = Box::into_raw(payload);
    // SAFETY: zeroed pthread_t is a valid output slot.
    let mut tid: libc::pthread_t = unsafe { std::mem::zeroed() };
    // SAFETY: `thread_entry` takes ownership of `raw` exactly once on success.
    let rc = unsafe { libc::pthread_create(&mut tid, &attr, thread_entry, raw.cast::<c_void>()) };
    // SAFETY: `attr` is initialized and destroyed once.
    unsafe { libc::pthread_attr_destroy(&mut attr) };
    if rc != 0 {
        // SAFETY: the thread was not created, so `raw` is still ours.
        drop(unsafe { Box::from_raw(raw) });
        log::error("thread.create", json!({ "op": "pthread_create", "errno": rc }));
        return Err(SyncError::from_code("pthread_create", rc));
    }
    Ok(tid)
}

extern "C" fn thread_entry(arg: *mut c_void) -> *mut c_void {
    // SAFETY: `arg` is the payload leaked by `spawn_host`, handed over once.
    let payload = unsafe { Box::from_raw(arg.cast::<StartPayload>()) };
    let StartPayload {
        thread,
        routine,
        affinity_mask,
    } = *payload;

    // SAFETY: pthread_self is always valid for the calling thread.
    let _ = thread.host.set(unsafe { libc::pthread_self() });
    thread
        .system_id
        .store(system::current_thread_system_id(), Ordering::Release);
    CURRENT.with(|current| current.set(Arc::as_ptr(&thread)));
    termination::bind_current(Arc::clone(&thread.control));

    let _ = system::set_current_thread_name("");
    if let Some(mask) = affinity_mask {
        if let Some(&host) = thread.host.get() {
            if let Err(err) = set_affinity(host, mask) {
                log::warn("thread.start.affinity", json!({ "mask": mask, "error": err.to_string() }));
            }
        }
    }
    let priority = thread.priority();
    if priority != ThreadPriority::NORMAL {
        if let Some(&host) = thread.host.get() {
            apply_priority(host, priority);
        }
    }

    // Thread-control signals are still blocked (inherited from the creator).
    thread.control.mark_started();
    thread.control.park_while_suspended();
    if let Err(err) = signals::unblock_thread_control() {
        log::error("thread.start.sigmask", json!({ "error": err.to_string() }));
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        termination::checkpoint();
        routine();
    }));
    let exit_code = match outcome {
        Ok(()) => 0,
        Err(payload) => termination::exit_code_of(payload.as_ref()).unwrap_or_else(|| {
            log::error(
                "thread.start_routine.panic",
                json!({ "system_id": thread.system_id() }),
            );
            PANIC_EXIT_CODE
        }),
    };
    // No-op when terminate or exit already finished the thread.
    thread.control.finish(exit_code);

    // Best effort: a handler arriving after this point finds no thread.
    let _blocked = BlockedSignals::thread_control().ok();
    CURRENT.with(|current| current.set(std::ptr::null()));
    termination::unbind_current();
    thread.exited.store(true, Ordering::Release);
    drop(thread);
    std::ptr::null_mut()
}

// ---------------------------------------------------------------------------
// Signal-handler entry points
// ---------------------------------------------------------------------------

fn current_raw() -> Option<&'static Thread> {
    let current = CURRENT.try_with(Cell::get).ok()?;
    // SAFETY: CURRENT is cleared before the owning Arc is released.
    unsafe { current.as_ref() }
}

/// Suspend signal: park until resumed or terminated.
pub(crate) fn on_suspend_signal() {
    if let Some(thread) = current_raw() {
        thread.control.park_while_suspended();
    }
}

/// User-callback signal: record delivery if the thread is alertable, then
/// have the wait engine re-check so a blocked alertable wait runs it.
pub(crate) fn on_user_callback_signal() {
    if let Some(thread) = current_raw() {
        if alert::is_alertable() {
            thread.control.mark_callback_delivered();
            wake::wake_waiters();
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler pass-through
// ---------------------------------------------------------------------------

fn get_affinity(host: libc::pthread_t) -> Result<u64> {
    // SAFETY: cpu_set_t is plain data; zeroed is an empty set.
    let mut set = unsafe { std::mem::zeroed::<libc::cpu_set_t>() };
    // SAFETY: `set` is writable and its size is passed.
    let rc = unsafe {
        libc::pthread_getaffinity_np(host, std::mem::size_of::<libc::cpu_set_t>(), &mut set)
    };
    if rc != 0 {
        return Err(SyncError::from_code("pthread_getaffinity_np", rc));
    }
    let mut mask = 0u64;
    for cpu in 0..64 {
        // SAFETY: `set` is initialized and `cpu` is below CPU_SETSIZE.
        if unsafe { libc::CPU_ISSET(cpu, &set) } {
            mask |= 1u64 << cpu;
        }
    }
    Ok(mask)
}

fn set_affinity(host: libc::pthread_t, mask: u64) -> Result<()> {
    // SAFETY: cpu_set_t is plain data; zeroed is an empty set.
    let mut set = unsafe { std::mem::zeroed::<libc::cpu_set_t>() };
    for cpu in 0..64 {
        if mask & (1u64 << cpu) != 0 {
            // SAFETY: `set` is initialized and `cpu` is below CPU_SETSIZE.
            unsafe { libc::CPU_SET(cpu, &mut set) };
        }
    }
    // SAFETY: `set` is initialized and its size is passed.
    let rc = unsafe {
        libc::pthread_setaffinity_np(host, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if rc != 0 {
        return Err(SyncError::from_code("pthread_setaffinity_np", rc));
    }
    Ok(())
}

/// Map a logical priority onto the host: normal and below keep the default
/// time-sharing policy, higher levels ask for `SCHED_FIFO`.
fn apply_priority(host: libc::pthread_t, priority: i32) {
    let (policy, host_priority) = if priority <= ThreadPriority::NORMAL {
        (libc::SCHED_OTHER, 0)
    } else {
        // SAFETY: plain queries with a valid policy constant.
        let (min, max) = unsafe {
            (
                libc::sched_get_priority_min(libc::SCHED_FIFO),
                libc::sched_get_priority_max(libc::SCHED_FIFO),
            )
        };
        let level = priority.min(ThreadPriority::HIGHEST);
        (libc::SCHED_FIFO, min + (max - min) * level / (2 * ThreadPriority::HIGHEST))
    };
    let param = libc::sched_param {
        sched_priority: host_priority,
    };
    // SAFETY: `param` is initialized; the caller guarantees `host` is live.
    let rc = unsafe { libc::pthread_setschedparam(host, policy, &param) };
    if rc != 0 {
        log::debug(
            "thread.set_priority",
            json!({ "priority": priority, "policy": policy, "errno": rc }),
        );
    }
}
