//! Concrete scenario tests (spec.md §8).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use heteroq::config::{MpmcRelaxedQueue, MpmcSeqCstQueue, SpmcQueue, SpscQueue};
use heteroq::{ConstructError, Progress, SystemByteAllocator};

/// Installs a `tracing` subscriber once per test binary, filtered by
/// `RUST_LOG` (e.g. `RUST_LOG=trace cargo test -- --nocapture` to see the
/// pin/CAS-retry trace lines the core emits).
fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[test]
fn single_producer_single_consumer_one_million_pushes() {
    init_tracing();
    let queue: SpscQueue<u64> = SpscQueue::build(SystemByteAllocator).unwrap();
    const N: u64 = 1_000_000;

    thread::scope(|scope| {
        let producer = &queue;
        scope.spawn(move || {
            for i in 0..N {
                producer.push(i);
            }
        });

        let mut next = 0u64;
        while next < N {
            if let Some(op) = queue.try_start_consume() {
                let value = unsafe { op.element_ptr().read() };
                assert_eq!(value, next);
                op.commit();
                next += 1;
            } else {
                thread::yield_now();
            }
        }
    });
}

#[derive(Clone, Copy)]
struct Record {
    producer_id: u32,
    seq: u32,
}

#[test]
fn eight_producers_eight_consumers_no_loss_no_duplication_per_producer_fifo() {
    init_tracing();
    const PRODUCERS: u32 = 8;
    const CONSUMERS: u32 = 8;
    const PER_PRODUCER: u32 = 1000;

    let queue: Arc<MpmcRelaxedQueue<Record>> = Arc::new(MpmcRelaxedQueue::build(SystemByteAllocator).unwrap());
    let observed = Arc::new(Mutex::new(Vec::<Record>::new()));
    let produced_count = Arc::new(AtomicUsize::new(0));

    thread::scope(|scope| {
        for producer_id in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            let produced_count = Arc::clone(&produced_count);
            scope.spawn(move || {
                for seq in 0..PER_PRODUCER {
                    queue.push(Record { producer_id, seq });
                    produced_count.fetch_add(1, Ordering::Release);
                }
            });
        }

        for _ in 0..CONSUMERS {
            let queue = Arc::clone(&queue);
            let observed = Arc::clone(&observed);
            let produced_count = Arc::clone(&produced_count);
            scope.spawn(move || {
                let mut local = Vec::new();
                loop {
                    match queue.try_start_consume() {
                        Some(op) => {
                            let record = unsafe { op.element_ptr().read() };
                            op.commit();
                            local.push(record);
                        }
                        None => {
                            let all_produced = produced_count.load(Ordering::Acquire) as u32 >= PRODUCERS * PER_PRODUCER;
                            if all_produced && queue.is_empty() {
                                break;
                            }
                            thread::yield_now();
                        }
                    }
                }
                observed.lock().unwrap().extend(local);
            });
        }
    });

    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), (PRODUCERS * PER_PRODUCER) as usize);

    let mut per_producer: HashMap<u32, Vec<u32>> = HashMap::new();
    for record in observed.iter() {
        per_producer.entry(record.producer_id).or_default().push(record.seq);
    }
    assert_eq!(per_producer.len(), PRODUCERS as usize);
    for (_, seqs) in per_producer {
        assert_eq!(seqs.len(), PER_PRODUCER as usize);
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), PER_PRODUCER as usize, "no duplicates per producer");
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "per-producer FIFO order preserved");
    }
}

#[test]
fn constructor_throws_on_third_call_cancels_that_slot() {
    init_tracing();
    let queue: SpscQueue<u32> = SpscQueue::build(SystemByteAllocator).unwrap();
    let mut calls = 0u32;

    for value in 0..3u32 {
        calls += 1;
        let attempt = calls;
        let result: Result<(), ConstructError<&'static str>> = queue.emplace(|slot| {
            if attempt == 3 {
                return Err("constructor refuses on its third call");
            }
            unsafe { slot.write(value) };
            Ok(())
        });
        if attempt == 3 {
            assert!(result.is_err());
        } else {
            assert!(result.is_ok());
        }
    }

    let first = queue.try_start_consume().unwrap();
    assert_eq!(unsafe { first.element_ptr().read() }, 0);
    first.commit();

    let second = queue.try_start_consume().unwrap();
    assert_eq!(unsafe { second.element_ptr().read() }, 1);
    second.commit();

    // The third slot was canceled (DEAD) without ever publishing Ready, so
    // it is invisible to consumption.
    assert!(queue.try_start_consume().is_none());
    assert!(queue.is_queue_empty());
}

#[test]
fn raw_block_attached_to_a_transaction_round_trips() {
    init_tracing();
    let queue: SpscQueue<(usize, usize)> = SpscQueue::build(SystemByteAllocator).unwrap();
    const LEN: usize = 200;
    let fill = b'0' + (LEN % 10) as u8;

    let txn = queue.start_push(Progress::Blocking).unwrap();
    let raw = txn.raw_allocate(LEN, 1).unwrap();
    unsafe { std::ptr::write_bytes(raw, fill, LEN) };
    unsafe { txn.element_ptr().write((raw as usize, LEN)) };
    txn.commit();

    let op = queue.try_start_consume().unwrap();
    let (ptr_addr, len) = unsafe { op.element_ptr().read() };
    let bytes = unsafe { std::slice::from_raw_parts(ptr_addr as *const u8, len) };
    assert!(bytes.iter().all(|&b| b == fill));
    op.commit();
}

#[test]
fn wait_free_put_makes_progress_under_contention() {
    init_tracing();
    const THREADS: usize = 16;
    let queue: Arc<MpmcRelaxedQueue<u32>> = Arc::new(MpmcRelaxedQueue::build(SystemByteAllocator).unwrap());
    let successes = Arc::new(AtomicUsize::new(0));

    thread::scope(|scope| {
        for _ in 0..THREADS {
            let queue = Arc::clone(&queue);
            let successes = Arc::clone(&successes);
            scope.spawn(move || {
                for attempt in 0..200u32 {
                    if queue.try_push(attempt, Progress::WaitFree).is_some() {
                        successes.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    assert!(successes.load(Ordering::Relaxed) > 0);
    while queue.try_start_consume().map(|op| op.commit()).is_some() {}
}

#[test]
fn pin_stress_page_stays_allocated_while_consumer_holds_it() {
    init_tracing();
    let queue: SpmcQueue<[u8; 256]> = SpmcQueue::build(SystemByteAllocator).unwrap();

    let first = queue.start_push(Progress::Blocking).unwrap();
    unsafe { first.element_ptr().write([0u8; 256]) };
    first.commit();

    let held = queue.try_start_consume().unwrap();
    assert!(queue.diagnostic_pin_count_of_head_page() > 0);

    // Fill and advance the producer past many pages while the consumer
    // above still pins the first one.
    for _ in 0..64u32 {
        let txn = queue.start_push(Progress::Blocking).unwrap();
        unsafe { txn.element_ptr().write([1u8; 256]) };
        txn.commit();
    }

    assert!(queue.diagnostic_pin_count_of_head_page() > 0);
    held.commit();

    // Drain the rest; the pinned page's count should now have dropped and
    // it is free to be reclaimed on the next pass over it.
    while queue.try_start_consume().map(|op| op.commit()).is_some() {}
}

#[test]
fn seqcst_eight_producers_eight_consumers_no_loss_no_duplication_per_producer_fifo() {
    init_tracing();
    const PRODUCERS: u32 = 8;
    const CONSUMERS: u32 = 8;
    const PER_PRODUCER: u32 = 1000;

    let queue: Arc<MpmcSeqCstQueue<Record>> = Arc::new(MpmcSeqCstQueue::build(SystemByteAllocator).unwrap());
    let observed = Arc::new(Mutex::new(Vec::<Record>::new()));
    let produced_count = Arc::new(AtomicUsize::new(0));

    thread::scope(|scope| {
        for producer_id in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            let produced_count = Arc::clone(&produced_count);
            scope.spawn(move || {
                for seq in 0..PER_PRODUCER {
                    queue.push(Record { producer_id, seq });
                    produced_count.fetch_add(1, Ordering::Release);
                }
            });
        }

        for _ in 0..CONSUMERS {
            let queue = Arc::clone(&queue);
            let observed = Arc::clone(&observed);
            let produced_count = Arc::clone(&produced_count);
            scope.spawn(move || {
                let mut local = Vec::new();
                loop {
                    match queue.try_start_consume() {
                        Some(op) => {
                            let record = unsafe { op.element_ptr().read() };
                            op.commit();
                            local.push(record);
                        }
                        None => {
                            let all_produced = produced_count.load(Ordering::Acquire) as u32 >= PRODUCERS * PER_PRODUCER;
                            if all_produced && queue.is_empty() {
                                break;
                            }
                            thread::yield_now();
                        }
                    }
                }
                observed.lock().unwrap().extend(local);
            });
        }
    });

    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), (PRODUCERS * PER_PRODUCER) as usize);

    let mut per_producer: HashMap<u32, Vec<u32>> = HashMap::new();
    for record in observed.iter() {
        per_producer.entry(record.producer_id).or_default().push(record.seq);
    }
    assert_eq!(per_producer.len(), PRODUCERS as usize);
    for (_, seqs) in per_producer {
        assert_eq!(seqs.len(), PER_PRODUCER as usize);
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), PER_PRODUCER as usize, "no duplicates per producer");
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "per-producer FIFO order preserved");
    }
}
