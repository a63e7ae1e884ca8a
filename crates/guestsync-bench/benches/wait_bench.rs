//! Wait engine benchmarks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use guestsync_posix::{
    Event, Mutant, Semaphore, Timeout, WaitHandle, WaitResult, allocate_tls_handle,
    free_tls_handle, get_tls_value, set_tls_value, wait, wait_all, wait_any,
};

fn bench_uncontended(c: &mut Criterion) {
    let mut group = c.benchmark_group("uncontended");

    let event = Event::create_manual_reset(true);
    group.bench_function("manual_event_wait", |b| {
        b.iter(|| black_box(wait(&event, false, Timeout::ZERO)));
    });

    let auto = Event::create_auto_reset(false);
    group.bench_function("auto_event_set_wait", |b| {
        b.iter(|| {
            auto.set();
            black_box(wait(&auto, false, Timeout::ZERO))
        });
    });

    let sem = Semaphore::create(0, 1).unwrap();
    group.bench_function("semaphore_release_wait", |b| {
        b.iter(|| {
            sem.release(1).unwrap();
            black_box(wait(&sem, false, Timeout::ZERO))
        });
    });

    let mutant = Mutant::create(false);
    group.bench_function("mutant_acquire_release", |b| {
        b.iter(|| {
            let result = wait(&mutant, false, Timeout::ZERO);
            mutant.release().unwrap();
            black_box(result)
        });
    });
    group.finish();
}

fn bench_multiple(c: &mut Criterion) {
    let counts: &[usize] = &[2, 8, 32, 64];
    let mut group = c.benchmark_group("wait_multiple");

    for &count in counts {
        let events: Vec<Event> = (0..count).map(|_| Event::create_manual_reset(true)).collect();
        let handles: Vec<&dyn WaitHandle> = events.iter().map(|e| e as &dyn WaitHandle).collect();

        group.bench_with_input(BenchmarkId::new("all", count), &count, |b, _| {
            b.iter(|| black_box(wait_all(&handles, false, Timeout::ZERO)));
        });

        events[..count - 1].iter().for_each(Event::reset);
        group.bench_with_input(BenchmarkId::new("any_last", count), &count, |b, _| {
            b.iter(|| black_box(wait_any(&handles, false, Timeout::ZERO)));
        });
    }
    group.finish();
}

fn bench_ping_pong(c: &mut Criterion) {
    let ping = Arc::new(Event::create_auto_reset(false));
    let pong = Arc::new(Event::create_auto_reset(false));
    let stop = Arc::new(AtomicBool::new(false));

    let (rx, tx, done) = (Arc::clone(&ping), Arc::clone(&pong), Arc::clone(&stop));
    let partner = std::thread::spawn(move || {
        while !done.load(Ordering::Acquire) {
            if wait(&*rx, false, Timeout::from_millis(10)) == WaitResult::Success {
                tx.set();
            }
        }
    });

    c.bench_function("event_ping_pong", |b| {
        b.iter(|| {
            ping.set();
            black_box(wait(&*pong, false, Timeout::Infinite))
        });
    });

    stop.store(true, Ordering::Release);
    let _ = partner.join();
}

fn bench_tls(c: &mut Criterion) {
    let handle = allocate_tls_handle().unwrap();
    c.bench_function("tls_set_get", |b| {
        b.iter(|| {
            set_tls_value(handle, 0xfeed);
            black_box(get_tls_value(handle))
        });
    });
    free_tls_handle(handle);
}

criterion_group!(benches, bench_uncontended, bench_multiple, bench_ping_pong, bench_tls);
criterion_main!(benches);
