use criterion::{black_box, criterion_group, criterion_main, Criterion};
use heteroq::config::{MpmcRelaxedQueue, SpscQueue};
use heteroq::{Progress, SystemByteAllocator};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn bench_spsc_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("SPSC throughput");
    group.sample_size(10);
    const BATCH: u64 = 10_000;

    group.bench_function("push/consume one producer one consumer", |b| {
        b.iter(|| {
            let queue: SpscQueue<u64> = SpscQueue::build(SystemByteAllocator).unwrap();
            for i in 0..BATCH {
                queue.push(black_box(i));
            }
            let mut drained = 0u64;
            while let Some(op) = queue.try_start_consume() {
                black_box(unsafe { op.element_ptr().read() });
                op.commit();
                drained += 1;
            }
            black_box(drained);
        });
    });

    group.bench_function("Vec<u64> push/drain baseline", |b| {
        b.iter(|| {
            let mut v = Vec::with_capacity(BATCH as usize);
            for i in 0..BATCH {
                v.push(black_box(i));
            }
            black_box(v.drain(..).count());
        });
    });
}

fn bench_mpmc_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("MPMC contention");
    group.sample_size(10);
    const THREADS: usize = 4;
    const OPS_PER_THREAD: u64 = 2_000;

    group.bench_function("relaxed tail, multi-consumer head", |b| {
        b.iter(|| {
            let queue: Arc<MpmcRelaxedQueue<u64>> = Arc::new(MpmcRelaxedQueue::build(SystemByteAllocator).unwrap());
            let consumed = Arc::new(AtomicUsize::new(0));

            thread::scope(|scope| {
                for _ in 0..THREADS {
                    let queue = Arc::clone(&queue);
                    scope.spawn(move || {
                        for i in 0..OPS_PER_THREAD {
                            queue.try_push(black_box(i), Progress::Blocking);
                        }
                    });
                }

                for _ in 0..THREADS {
                    let queue = Arc::clone(&queue);
                    let consumed = Arc::clone(&consumed);
                    scope.spawn(move || {
                        let target = (THREADS as u64 * OPS_PER_THREAD) as usize;
                        while consumed.load(Ordering::Acquire) < target {
                            if let Some(op) = queue.try_start_consume() {
                                black_box(unsafe { op.element_ptr().read() });
                                op.commit();
                                consumed.fetch_add(1, Ordering::AcqRel);
                            } else {
                                thread::yield_now();
                            }
                        }
                    });
                }
            });
        });
    });
}

criterion_group!(benches, bench_spsc_throughput, bench_mpmc_contention);
criterion_main!(benches);
