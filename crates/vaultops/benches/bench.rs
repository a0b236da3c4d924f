use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::{sync::Arc, thread::scope, time::Instant};
use vaultops::{
    IdGenStatus, IdGenerator, IdKind, MonoUlidGenerator, MonotonicClock, RandSource, ThreadRandom,
    TimeSource, TokenGenerator,
};

#[derive(Clone)]
struct FixedMockTime {
    millis: u64,
}

impl TimeSource<u64> for FixedMockTime {
    fn current_millis(&self) -> u64 {
        self.millis
    }
}

#[derive(Clone)]
struct FixedMockRand;

impl RandSource<u128> for FixedMockRand {
    fn rand(&self) -> u128 {
        0
    }
}

// Number of IDs generated per benchmark iteration (per-thread for
// multi-threaded).
const TOTAL_IDS: usize = 4096;
const THREADS: usize = 8;

/// Hot path with a pinned clock: every call increments the random part.
fn bench_mono_hot(c: &mut Criterion) {
    let mut group = c.benchmark_group("mono/fixed");
    group.throughput(Throughput::Elements(TOTAL_IDS as u64));

    group.bench_function(format!("elems/{TOTAL_IDS}"), |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            for _ in 0..iters {
                let generator =
                    MonoUlidGenerator::new(FixedMockTime { millis: 1 }, FixedMockRand);
                for _ in 0..TOTAL_IDS {
                    match generator.next_id() {
                        IdGenStatus::Ready { id } => {
                            black_box(id);
                        }
                        IdGenStatus::Pending { .. } => unreachable!(),
                    }
                }
            }
            start.elapsed()
        });
    });
    group.finish();
}

fn bench_tagged_ids(c: &mut Criterion) {
    let mut group = c.benchmark_group("ids/tagged");
    group.throughput(Throughput::Elements(TOTAL_IDS as u64));

    let ids = IdGenerator::new(MonotonicClock::default());
    group.bench_function(format!("string/elems/{TOTAL_IDS}"), |b| {
        b.iter(|| {
            for _ in 0..TOTAL_IDS {
                black_box(ids.new_id(IdKind::Operation));
            }
        });
    });
    group.bench_function(format!("typed/elems/{TOTAL_IDS}"), |b| {
        b.iter(|| {
            for _ in 0..TOTAL_IDS {
                black_box(ids.operation_id());
            }
        });
    });
    group.finish();
}

/// All threads share one generator and contend on its lock.
fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("ids/contended");
    group.throughput(Throughput::Elements((TOTAL_IDS * THREADS) as u64));

    group.bench_function(format!("threads/{THREADS}/elems/{TOTAL_IDS}"), |b| {
        b.iter_custom(|iters| {
            let generator = Arc::new(MonoUlidGenerator::new(
                MonotonicClock::default(),
                ThreadRandom,
            ));
            let start = Instant::now();
            for _ in 0..iters {
                scope(|s| {
                    for _ in 0..THREADS {
                        let generator = Arc::clone(&generator);
                        s.spawn(move || {
                            for _ in 0..TOTAL_IDS {
                                black_box(generator.generate());
                            }
                        });
                    }
                });
            }
            start.elapsed()
        });
    });
    group.finish();
}

fn bench_tokens(c: &mut Criterion) {
    let mut group = c.benchmark_group("tokens");
    group.throughput(Throughput::Elements(1));

    let tokens = TokenGenerator::default();
    group.bench_function("generate", |b| b.iter(|| black_box(tokens.generate())));
    group.finish();
}

criterion_group!(
    benches,
    bench_mono_hot,
    bench_tagged_ids,
    bench_contended,
    bench_tokens
);
criterion_main!(benches);
