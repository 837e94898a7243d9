//! Lock benchmark suite for ordlock.
//!
//! Benchmarks the hot paths of the coordinator:
//! - Uncontended acquire/release: the immediate-grant fast path
//! - Reentrant acquire: depth bookkeeping without queue traffic
//! - Failed immediate attempt: the zero-timeout contended path
//! - Handoff: release granting a parked waiter

#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use ordlock::{CancelToken, LockManager};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn bench_uncontended(c: &mut Criterion) {
    let manager = LockManager::new();
    let lock = manager.new_lock();

    let mut group = c.benchmark_group("uncontended");
    group.throughput(Throughput::Elements(1));
    group.bench_function("acquire_release", |b| {
        b.iter(|| {
            lock.acquire();
            black_box(lock.depth());
            lock.release();
        });
    });
    group.finish();
}

fn bench_reentrant(c: &mut Criterion) {
    let manager = LockManager::new();
    let lock = manager.new_lock();
    lock.acquire();

    let mut group = c.benchmark_group("reentrant");
    group.throughput(Throughput::Elements(1));
    group.bench_function("nested_acquire_release", |b| {
        b.iter(|| {
            lock.acquire();
            black_box(lock.depth());
            lock.release();
        });
    });
    group.finish();
    lock.release();
}

fn bench_contended_attempt(c: &mut Criterion) {
    let manager = LockManager::new();
    let lock = manager.new_lock();
    let token = CancelToken::never();

    // Park an owner on another thread for the duration of the bench.
    let stop = Arc::new(AtomicBool::new(false));
    let owner = {
        let lock = Arc::clone(&lock);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            lock.acquire();
            while !stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            lock.release();
        })
    };
    while lock.depth() == 0 {
        std::thread::sleep(Duration::from_millis(1));
    }

    let mut group = c.benchmark_group("contended");
    group.throughput(Throughput::Elements(1));
    group.bench_function("failed_attempt", |b| {
        b.iter(|| black_box(lock.acquire_timeout(&token, Duration::ZERO)));
    });
    group.finish();

    stop.store(true, Ordering::SeqCst);
    owner.join().expect("owner thread panicked");
}

fn bench_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("handoff");
    group.throughput(Throughput::Elements(1));
    group.bench_function("release_to_waiter", |b| {
        b.iter_custom(|iters| {
            let manager = LockManager::new();
            let lock = manager.new_lock();
            let counter = Arc::new(AtomicBool::new(false));

            lock.acquire();
            let waiter = {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..iters {
                        lock.acquire();
                        counter.store(true, Ordering::SeqCst);
                        lock.release();
                    }
                })
            };

            let start = std::time::Instant::now();
            lock.release();
            waiter.join().expect("waiter thread panicked");
            start.elapsed()
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_uncontended,
    bench_reentrant,
    bench_contended_attempt,
    bench_handoff
);
criterion_main!(benches);
