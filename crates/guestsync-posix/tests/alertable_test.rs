use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use guestsync_posix::{
    CreationParameters, Event, SleepResult, Thread, Timeout, WaitResult, alertable_sleep, sleep,
    wait,
};

const JOIN: Timeout = Timeout::from_millis(10_000);

/// Queue a callback that sets `ran` until one is observed to run. A callback
/// queued before the target becomes alertable is dropped unexecuted, so the
/// first attempts may be lost.
fn deliver_until_run(thread: &Thread, ran: &Arc<Event>) {
    for _ in 0..200 {
        let flag = Arc::clone(ran);
        thread.queue_user_callback(move || flag.set());
        if wait(&**ran, false, Timeout::from_millis(25)) == WaitResult::Success {
            return;
        }
    }
    panic!("user callback never ran");
}

#[test]
fn callback_cuts_alertable_sleep_short() {
    let ran = Arc::new(Event::create_manual_reset(false));
    let outcome = Arc::new(AtomicU64::new(0));
    let slot = Arc::clone(&outcome);
    let thread = Thread::create(CreationParameters::default(), move || {
        let start = Instant::now();
        let result = alertable_sleep(Duration::from_secs(30));
        let code = match result {
            SleepResult::Alerted => 1,
            SleepResult::Success => 2,
        };
        assert!(start.elapsed() < Duration::from_secs(30));
        slot.store(code, Ordering::Release);
    })
    .unwrap();

    deliver_until_run(&thread, &ran);
    assert_eq!(wait(&*thread, false, JOIN), WaitResult::Success);
    assert_eq!(outcome.load(Ordering::Acquire), 1);
    assert_eq!(thread.exit_code(), Some(0));
}

#[test]
fn plain_sleep_never_runs_callbacks() {
    let started = Arc::new(Event::create_manual_reset(false));
    let ran = Arc::new(AtomicBool::new(false));
    let signal = Arc::clone(&started);
    let thread = Thread::create(CreationParameters::default(), move || {
        signal.set();
        sleep(Duration::from_millis(100));
    })
    .unwrap();

    assert_eq!(wait(&*started, false, JOIN), WaitResult::Success);
    let start = Instant::now();
    let flag = Arc::clone(&ran);
    thread.queue_user_callback(move || flag.store(true, Ordering::Release));
    assert_eq!(wait(&*thread, false, JOIN), WaitResult::Success);
    assert!(start.elapsed() <= Duration::from_millis(5_000));
    assert!(!ran.load(Ordering::Acquire));
    assert!(thread.control().has_pending_callback());
}

#[test]
fn alertable_wait_runs_callback_and_keeps_waiting() {
    let ran = Arc::new(Event::create_manual_reset(false));
    let gate = Arc::new(Event::create_manual_reset(false));
    let result = Arc::new(AtomicU64::new(0));
    let (opened, slot) = (Arc::clone(&gate), Arc::clone(&result));
    let thread = Thread::create(CreationParameters::default(), move || {
        let outcome = wait(&*opened, true, Timeout::Infinite);
        slot.store(u64::from(outcome == WaitResult::Success), Ordering::Release);
    })
    .unwrap();

    deliver_until_run(&thread, &ran);
    assert_eq!(wait(&*thread, false, Timeout::from_millis(50)), WaitResult::Timeout);
    gate.set();
    assert_eq!(wait(&*thread, false, JOIN), WaitResult::Success);
    assert_eq!(result.load(Ordering::Acquire), 1);
}

#[test]
fn terminate_interrupts_a_sleep() {
    struct Unwound(Arc<AtomicBool>);
    impl Drop for Unwound {
        fn drop(&mut self) {
            self.0.store(true, Ordering::Release);
        }
    }

    let started = Arc::new(Event::create_manual_reset(false));
    let unwound = Arc::new(AtomicBool::new(false));
    let (signal, flag) = (Arc::clone(&started), Arc::clone(&unwound));
    let thread = Thread::create(CreationParameters::default(), move || {
        let _guard = Unwound(flag);
        signal.set();
        sleep(Duration::from_secs(60));
        unreachable!("terminated threads do not return from sleeps");
    })
    .unwrap();

    assert_eq!(wait(&*started, false, JOIN), WaitResult::Success);
    assert!(thread.terminate(42));
    assert_eq!(wait(&*thread, false, JOIN), WaitResult::Success);
    assert_eq!(thread.exit_code(), Some(42));

    let deadline = Instant::now() + Duration::from_secs(10);
    while !unwound.load(Ordering::Acquire) {
        assert!(Instant::now() < deadline, "sleeping thread did not unwind");
        std::thread::sleep(Duration::from_millis(1));
    }
}
