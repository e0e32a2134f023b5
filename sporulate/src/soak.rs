//! Drives one queue with many producer and consumer threads and checks what
//! came out against what went in.
use color_eyre::eyre::{eyre, Result, WrapErr};
use hyphae::Queue;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, PoisonError, RwLock,
    },
    thread,
    time::{Duration, Instant},
};

/// How often the main thread logs progress while producers are running.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct Soak {
    pub producers: u32,
    pub consumers: u32,
    pub duration: Duration,
    pub items: u32,
    pub reclaim_threshold: Option<usize>,
}

/// A property the queue failed to uphold during a soak.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Violation {
    #[error("item {seq} from producer {producer} was enqueued but never dequeued")]
    Lost { producer: u32, seq: u32 },

    #[error("item {seq} from producer {producer} was dequeued more than once")]
    Duplicated { producer: u32, seq: u32 },

    #[error(
        "consumer {consumer} dequeued item {seq} from producer {producer} after item {prev}"
    )]
    Reordered {
        consumer: u32,
        producer: u32,
        seq: u32,
        prev: u32,
    },

    #[error("queue reports {len} items after every item was dequeued")]
    CountMismatch { len: usize },
}

#[derive(Debug)]
pub struct Report {
    pub produced: u64,
    pub consumed: u64,
    /// Time from releasing the threads until producers stopped.
    pub produce_time: Duration,
    /// Time from releasing the threads until the queue was drained.
    pub total_time: Duration,
}

/// One bit per item a producer may enqueue, set when that item is dequeued.
struct Ledger {
    words: Vec<AtomicU64>,
}

struct Shared {
    queue: Queue<u64>,
    ledgers: Vec<Ledger>,
    stop: AtomicBool,
    /// Set if the soak was abandoned before every thread could be spawned.
    aborted: AtomicBool,
    producers_done: AtomicUsize,
    /// Write-locked while threads are being spawned, so that none of them
    /// starts working before all of them exist.
    start: RwLock<()>,
}

type Threads = (
    Vec<thread::JoinHandle<u32>>,
    Vec<thread::JoinHandle<Result<u64, Violation>>>,
);

fn tag(producer: u32, seq: u32) -> u64 {
    (u64::from(producer) << 32) | u64::from(seq)
}

fn untag(tag: u64) -> (u32, u32) {
    ((tag >> 32) as u32, tag as u32)
}

// === impl Soak ===

impl Soak {
    pub fn run(&self) -> Result<Report> {
        let queue = match self.reclaim_threshold {
            Some(threshold) => Queue::with_reclaim_threshold(threshold),
            None => Queue::new(),
        };
        let ledgers = (0..self.producers)
            .map(|_| Ledger::new(self.items))
            .collect();
        let shared = Arc::new(Shared::new(queue, ledgers));

        tracing::info!(
            "Soaking {} producers and {} consumers for {:?}",
            self.producers,
            self.consumers,
            self.duration,
        );
        let start = shared.start.write().unwrap_or_else(PoisonError::into_inner);
        let threads = self.spawn(&shared);
        if threads.is_err() {
            // let the threads that did start see the abort and exit.
            shared.abort();
        }
        drop(start);
        let (producers, consumers) = threads?;

        let started = Instant::now();
        self.wait_for_producers(&shared, started);
        shared.stop.store(true, Ordering::Relaxed);

        let produced: Vec<u32> = producers
            .into_iter()
            .map(|p| p.join().map_err(|_| eyre!("a producer thread panicked")))
            .collect::<Result<_>>()?;
        let produce_time = started.elapsed();
        tracing::info!("Draining after {produce_time:?}");

        let mut consumed = 0;
        let mut violation = None;
        for consumer in consumers {
            let result = consumer
                .join()
                .map_err(|_| eyre!("a consumer thread panicked"))?;
            match result {
                Ok(count) => consumed += count,
                Err(error) => {
                    tracing::error!(%error, "consumer failed");
                    violation.get_or_insert(error);
                }
            }
        }
        let total_time = started.elapsed();
        if let Some(violation) = violation {
            return Err(violation.into());
        }

        shared.check_ledgers(&produced)?;
        let len = shared.queue.len();
        if len != 0 || !shared.queue.is_empty() {
            return Err(Violation::CountMismatch { len }.into());
        }

        Ok(Report {
            produced: produced.iter().copied().map(u64::from).sum(),
            consumed,
            produce_time,
            total_time,
        })
    }

    fn spawn(&self, shared: &Arc<Shared>) -> Result<Threads> {
        let producers = (0..self.producers)
            .map(|producer| {
                let shared = shared.clone();
                let items = self.items;
                thread::Builder::new()
                    .name(format!("producer-{producer}"))
                    .spawn(move || shared.produce(producer, items))
                    .wrap_err("failed to spawn producer thread")
            })
            .collect::<Result<_>>()?;
        let consumers = (0..self.consumers)
            .map(|consumer| {
                let shared = shared.clone();
                let producers = self.producers;
                thread::Builder::new()
                    .name(format!("consumer-{consumer}"))
                    .spawn(move || shared.consume(consumer, producers))
                    .wrap_err("failed to spawn consumer thread")
            })
            .collect::<Result<_>>()?;
        Ok((producers, consumers))
    }

    fn wait_for_producers(&self, shared: &Shared, started: Instant) {
        loop {
            let elapsed = started.elapsed();
            if elapsed >= self.duration
                || shared.producers_done.load(Ordering::Acquire) == self.producers as usize
            {
                return;
            }
            thread::sleep(PROGRESS_INTERVAL.min(self.duration - elapsed));
            tracing::debug!(
                elapsed = ?started.elapsed(),
                len = shared.queue.len(),
                "soaking..."
            );
        }
    }
}

// === impl Shared ===

impl Shared {
    fn new(queue: Queue<u64>, ledgers: Vec<Ledger>) -> Self {
        Self {
            queue,
            ledgers,
            stop: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            producers_done: AtomicUsize::new(0),
            start: RwLock::new(()),
        }
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.stop.store(true, Ordering::Release);
    }

    /// Blocks until every thread has been spawned.
    fn wait_for_start(&self) {
        drop(self.start.read());
    }

    #[tracing::instrument(level = "debug", skip(self, items))]
    fn produce(&self, producer: u32, items: u32) -> u32 {
        self.wait_for_start();
        let mut seq = 0;
        while seq < items && !self.stop.load(Ordering::Relaxed) {
            self.queue.enqueue(tag(producer, seq));
            seq += 1;
        }
        self.producers_done.fetch_add(1, Ordering::Release);
        tracing::debug!(enqueued = seq, "producer done");
        seq
    }

    #[tracing::instrument(level = "debug", skip(self, producers))]
    fn consume(&self, consumer: u32, producers: u32) -> Result<u64, Violation> {
        self.wait_for_start();
        let mut last: Vec<Option<u32>> = vec![None; producers as usize];
        let mut dequeued = 0;
        loop {
            // Read before dequeueing: if every producer was done before an
            // empty dequeue, nothing more will ever arrive.
            let done = self.producers_done.load(Ordering::Acquire) == producers as usize
                || self.aborted.load(Ordering::Acquire);
            let Some(tag) = self.queue.dequeue() else {
                if done {
                    tracing::debug!(dequeued, "consumer done");
                    return Ok(dequeued);
                }
                thread::yield_now();
                continue;
            };

            let (producer, seq) = untag(tag);
            let prev = &mut last[producer as usize];
            if let Some(prev) = *prev {
                if seq <= prev {
                    return Err(Violation::Reordered {
                        consumer,
                        producer,
                        seq,
                        prev,
                    });
                }
            }
            *prev = Some(seq);

            if !self.ledgers[producer as usize].mark(seq) {
                return Err(Violation::Duplicated { producer, seq });
            }
            dequeued += 1;
        }
    }

    fn check_ledgers(&self, produced: &[u32]) -> Result<(), Violation> {
        for (producer, (ledger, &count)) in self.ledgers.iter().zip(produced).enumerate() {
            if let Some(seq) = ledger.first_unmarked(count) {
                return Err(Violation::Lost {
                    producer: producer as u32,
                    seq,
                });
            }
        }
        Ok(())
    }
}

// === impl Ledger ===

impl Ledger {
    fn new(items: u32) -> Self {
        let words = (items as usize + 63) / 64;
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Marks `seq` as dequeued, returning `false` if it already was.
    fn mark(&self, seq: u32) -> bool {
        let (word, bit) = Self::position(seq);
        self.words[word].fetch_or(bit, Ordering::Relaxed) & bit == 0
    }

    /// Returns the first of the first `count` items that was never marked.
    fn first_unmarked(&self, count: u32) -> Option<u32> {
        (0..count).find(|&seq| {
            let (word, bit) = Self::position(seq);
            self.words[word].load(Ordering::Relaxed) & bit == 0
        })
    }

    fn position(seq: u32) -> (usize, u64) {
        ((seq / 64) as usize, 1 << (seq % 64))
    }
}

// === impl Report ===

impl Report {
    pub fn throughput(&self) -> f64 {
        let secs = self.total_time.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.consumed as f64 / secs
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} items through the queue in {:.2?} ({:.2?} producing), {:.0} items/s",
            self.consumed,
            self.total_time,
            self.produce_time,
            self.throughput(),
        )
    }
}
