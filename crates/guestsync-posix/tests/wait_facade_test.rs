use std::sync::Arc;
use std::time::Duration;

use guestsync_posix::{
    CreationParameters, Event, Mutant, Semaphore, Thread, Timeout, Timer, WaitHandle,
    WaitResult, Waitable, signal_and_wait, wait, wait_all, wait_any,
};

const SHORT: Timeout = Timeout::from_millis(20);
const LONG: Timeout = Timeout::from_millis(2_000);

/// A handle to something that is not a host wait object.
struct GuestOnly;

impl WaitHandle for GuestOnly {
    fn waitable(&self) -> Option<&dyn Waitable> {
        None
    }
}

#[test]
fn unresolvable_handles_fail_without_blocking() {
    let event = Event::create_manual_reset(false);
    assert_eq!(wait(&GuestOnly, true, Timeout::Infinite), WaitResult::Failed);
    assert_eq!(
        wait_any(&[&event, &GuestOnly], false, Timeout::Infinite),
        (WaitResult::Failed, 0)
    );
    assert_eq!(wait_all(&[&GuestOnly], false, Timeout::Infinite), WaitResult::Failed);
}

#[test]
fn empty_lists_fail() {
    assert_eq!(wait_any(&[], false, SHORT).0, WaitResult::Failed);
    assert_eq!(wait_all(&[], false, SHORT), WaitResult::Failed);
}

#[test]
fn wait_any_mixes_object_kinds() {
    let event = Event::create_auto_reset(false);
    let sem = Semaphore::create(0, 1).unwrap();
    let timer = Timer::create_synchronization();
    timer.set_once(Duration::from_millis(5), None).unwrap();

    let handles: [&dyn WaitHandle; 3] = [&event, &sem, &timer];
    assert_eq!(wait_any(&handles, false, LONG), (WaitResult::Success, 2));

    sem.release(1).unwrap();
    event.set();
    assert_eq!(wait_any(&handles, false, SHORT), (WaitResult::Success, 0));
    assert_eq!(wait_any(&handles, false, SHORT), (WaitResult::Success, 1));
    assert_eq!(wait_any(&handles, false, SHORT).0, WaitResult::Timeout);
}

#[test]
fn wait_all_includes_a_thread() {
    let gate = Arc::new(Event::create_manual_reset(false));
    let opened = Arc::clone(&gate);
    let thread = Thread::create(CreationParameters::default(), move || {
        let _ = wait(&*opened, false, Timeout::Infinite);
    })
    .unwrap();
    let ready = Event::create_manual_reset(true);

    let handles: [&dyn WaitHandle; 2] = [&ready, &*thread];
    assert_eq!(wait_all(&handles, false, SHORT), WaitResult::Timeout);
    gate.set();
    assert_eq!(wait_all(&handles, false, LONG), WaitResult::Success);
    assert_eq!(thread.exit_code(), Some(0));
}

#[test]
fn signal_and_wait_hands_over_a_mutant() {
    let mutant = Arc::new(Mutant::create(true));
    let done = Arc::new(Event::create_manual_reset(false));

    let (shared, finished) = (Arc::clone(&mutant), Arc::clone(&done));
    let thread = Thread::create(CreationParameters::default(), move || {
        if wait(&*shared, false, LONG) == WaitResult::Success {
            shared.release().unwrap();
            finished.set();
        }
    })
    .unwrap();

    assert_eq!(signal_and_wait(&*mutant, &*done, false, LONG), WaitResult::Success);
    assert_eq!(wait(&*thread, false, LONG), WaitResult::Success);
    // Released by its last owner, so free again.
    assert_eq!(wait(&*mutant, false, Timeout::ZERO), WaitResult::Success);
    mutant.release().unwrap();
}

#[test]
fn signal_and_wait_fails_when_the_signal_is_refused() {
    let full = Semaphore::create(1, 1).unwrap();
    let target = Event::create_manual_reset(true);
    assert_eq!(signal_and_wait(&full, &target, false, SHORT), WaitResult::Failed);
    assert_eq!(full.count(), 1);

    let timer = Timer::create_manual_reset();
    assert_eq!(signal_and_wait(&timer, &target, false, SHORT), WaitResult::Failed);
}

#[test]
fn signal_and_wait_times_out_after_signaling() {
    let sem = Semaphore::create(0, 2).unwrap();
    let never = Event::create_manual_reset(false);
    assert_eq!(signal_and_wait(&sem, &never, false, SHORT), WaitResult::Timeout);
    assert_eq!(sem.count(), 1);
}
