//! Multi-threaded stress tests that only use the public API.
use hyphae::Queue;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Barrier,
    },
    thread,
    time::{Duration, Instant},
};

const PRODUCERS: usize = 8;
const CONSUMERS: usize = 8;
/// Keeps the bookkeeping for a fast machine from eating all the memory.
const MAX_PER_PRODUCER: usize = 250_000;

/// Producer index in the high bits, per-producer sequence number in the low
/// bits.
fn tag(producer: usize, seq: usize) -> u64 {
    ((producer as u64) << 32) | seq as u64
}

fn untag(tag: u64) -> (usize, usize) {
    ((tag >> 32) as usize, (tag & 0xffff_ffff) as usize)
}

fn trace_init() -> tracing::dispatcher::DefaultGuard {
    use tracing_subscriber::prelude::*;
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_timer(())
        .set_default()
}

#[test]
fn soak_for_fixed_duration() {
    let _trace = trace_init();
    let run_for = if cfg!(miri) {
        Duration::from_millis(50)
    } else {
        Duration::from_millis(500)
    };

    let q = Arc::new(Queue::new());
    let stop = Arc::new(AtomicBool::new(false));
    let producers_done = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(PRODUCERS + CONSUMERS + 1));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let q = q.clone();
            let stop = stop.clone();
            let producers_done = producers_done.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                let mut seq = 0;
                while !stop.load(Ordering::Relaxed) && seq < MAX_PER_PRODUCER {
                    q.enqueue(tag(producer, seq));
                    seq += 1;
                }
                producers_done.fetch_add(1, Ordering::Release);
                seq
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let q = q.clone();
            let producers_done = producers_done.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                let mut seen = Vec::new();
                let mut last = [None; PRODUCERS];
                loop {
                    let done = producers_done.load(Ordering::Acquire) == PRODUCERS;
                    match q.dequeue() {
                        Some(tag) => {
                            let (producer, seq) = untag(tag);
                            if let Some(prev) = last[producer] {
                                assert!(seq > prev, "producer {producer} reordered: {seq} after {prev}");
                            }
                            last[producer] = Some(seq);
                            seen.push(tag);
                        }
                        None if done => return seen,
                        None => thread::yield_now(),
                    }
                }
            })
        })
        .collect();

    start.wait();
    let started = Instant::now();
    thread::sleep(run_for);
    stop.store(true, Ordering::Relaxed);

    let produced: Vec<usize> = producers.into_iter().map(|p| p.join().unwrap()).collect();
    let mut consumed: Vec<u64> = consumers
        .into_iter()
        .flat_map(|c| c.join().unwrap())
        .collect();
    tracing::info!(
        elapsed = ?started.elapsed(),
        produced = produced.iter().sum::<usize>(),
        consumed = consumed.len(),
        "soak finished"
    );

    consumed.sort_unstable();
    let mut expected: Vec<u64> = produced
        .iter()
        .enumerate()
        .flat_map(|(producer, &count)| (0..count).map(move |seq| tag(producer, seq)))
        .collect();
    expected.sort_unstable();

    assert_eq!(consumed.len(), expected.len(), "item count mismatch");
    assert!(consumed == expected, "dequeued tags differ from enqueued tags");
    assert_eq!(q.len(), 0);
    assert!(q.is_empty());
}

#[test]
fn shared_handle_clear_after_quiescence() {
    let mut q = Arc::new(Queue::with_reclaim_threshold(0));
    let threads: Vec<_> = (0..4)
        .map(|i| {
            let q = q.clone();
            thread::spawn(move || {
                for j in 0..100 {
                    q.enqueue(i * 100 + j);
                    if j % 2 == 0 {
                        let _ = q.dequeue();
                    }
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(q.len(), 200);
    let q_mut = Arc::get_mut(&mut q).expect("every other handle was dropped");
    q_mut.clear();
    assert_eq!(q.len(), 0);
    assert_eq!(q.dequeue(), None);
}
