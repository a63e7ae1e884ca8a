//! Thread lifecycle and timer benchmarks.

use std::time::Duration;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use guestsync_posix::{CreationParameters, Thread, Timeout, Timer, wait};

fn bench_create_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread");
    group.sample_size(20);

    group.bench_function("create_wait", |b| {
        b.iter(|| {
            let thread = Thread::create(CreationParameters::default(), || {}).unwrap();
            black_box(wait(&*thread, false, Timeout::Infinite))
        });
    });

    group.bench_function("create_suspended_resume_wait", |b| {
        let params = CreationParameters {
            create_suspended: true,
            ..CreationParameters::default()
        };
        b.iter(|| {
            let thread = Thread::create(params, || {}).unwrap();
            thread.resume().unwrap();
            black_box(wait(&*thread, false, Timeout::Infinite))
        });
    });
    group.finish();
}

fn bench_timer_expiry(c: &mut Criterion) {
    let mut group = c.benchmark_group("timer");
    group.sample_size(20);

    let timer = Timer::create_synchronization();
    group.bench_function("zero_due_expiry", |b| {
        b.iter(|| {
            timer.set_once(Duration::ZERO, None).unwrap();
            black_box(wait(&timer, false, Timeout::Infinite))
        });
    });
    group.finish();
}

criterion_group!(benches, bench_create_join, bench_timer_expiry);
criterion_main!(benches);
