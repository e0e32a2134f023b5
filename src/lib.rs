//! An unbounded, lock-free, multi-producer multi-consumer FIFO queue.
//!
//! [`Queue`] is meant for handing work items between threads at a high rate,
//! such as moving messages from I/O threads to a pool of workers. Any number
//! of threads may enqueue and dequeue at the same time through a shared
//! reference, and no operation ever takes a lock, parks a thread, or waits
//! for another thread to finish what it's doing.
//!
//! ```
//! use hyphae::Queue;
//! use std::{sync::Arc, thread};
//!
//! let q = Arc::new(Queue::new());
//! for job in 0..100u32 {
//!     q.enqueue(job);
//! }
//!
//! let workers: Vec<_> = (0..4)
//!     .map(|_| {
//!         let q = q.clone();
//!         thread::spawn(move || {
//!             let mut handled = 0;
//!             while let Some(_job) = q.dequeue() {
//!                 handled += 1;
//!             }
//!             handled
//!         })
//!     })
//!     .collect();
//!
//! let handled: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
//! assert_eq!(handled, 100);
//! assert!(q.is_empty());
//! ```
//!
//! ## Implementation
//!
//! The queue is a singly-linked list with a permanent sentinel at its head,
//! following Michael and Scott's non-blocking queue: producers link new
//! nodes after the tail with a compare-and-swap, and consumers swing the
//! head forward with another. Either side helps a lagging tail pointer along
//! rather than waiting for the thread that linked the node to do so.
//!
//! Dequeued nodes can't be freed immediately, since other threads may still
//! be looking at them. Each queue owns a small hazard-pointer domain: a
//! thread publishes the nodes it is about to dereference, and unlinked nodes
//! are only freed once no published hazard names them. This also keeps a
//! node's address from being reused while any thread might still compare
//! against it, so the queue is not subject to the ABA problem.
//!
//! ## Feature flags
//!
//! - `tracing`: emit [`tracing`] diagnostics for reclamation and other
//!   infrequent events. Disabled by default.
//! - `no-cache-pad`: don't pad the head and tail pointers to separate cache
//!   lines. Useful on targets without a data cache.
//!
//! [`tracing`]: https://docs.rs/tracing
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(docsrs, deny(missing_docs))]
#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub(crate) mod util;

pub(crate) mod hazard;
pub(crate) mod loom;
pub mod queue;

#[doc(inline)]
pub use queue::Queue;
