//! An unbounded lock-free multi-producer, multi-consumer FIFO queue.
//!
//! Based on the queue described by Maged Michael and Michael Scott in
//! ["Simple, Fast, and Practical Non-Blocking and Blocking Concurrent Queue
//! Algorithms"][ms-queue] (PODC '96), with nodes reclaimed through
//! [hazard pointers](crate::hazard).
//!
//! [ms-queue]: https://www.cs.rochester.edu/~scott/papers/1996_PODC_queues.pdf
use crate::{
    hazard::{Domain, Retire},
    loom::{
        cell::UnsafeCell,
        sync::atomic::{AtomicIsize, AtomicPtr, Ordering::*},
    },
    util::{Backoff, CachePadded},
};
use alloc::boxed::Box;
use core::{
    fmt,
    iter::FusedIterator,
    mem::MaybeUninit,
    ptr::{self, NonNull},
};

#[cfg(test)]
use crate::loom::alloc::Track;

/// An unbounded lock-free multi-producer, multi-consumer FIFO queue.
///
/// Any number of threads may [`enqueue`] and [`dequeue`] concurrently
/// through a shared reference; neither operation ever takes a lock or waits
/// for another thread. To hand a queue to several threads, wrap it in an
/// [`Arc`].
///
/// Every operation is linearizable: items are dequeued in the order in which
/// their enqueues took effect. When two enqueues race, the one whose link
/// into the list succeeds first is dequeued first, which is not necessarily
/// the one that was *called* first.
///
/// [`enqueue`]: Queue::enqueue
/// [`dequeue`]: Queue::dequeue
/// [`Arc`]: alloc::sync::Arc
///
/// # Examples
///
/// ```
/// use hyphae::Queue;
/// use std::{sync::Arc, thread};
///
/// let q = Arc::new(Queue::new());
///
/// let producer = thread::spawn({
///     let q = q.clone();
///     move || {
///         for i in 0..10 {
///             q.enqueue(i);
///         }
///     }
/// });
/// producer.join().unwrap();
///
/// let items: Vec<_> = q.drain().collect();
/// assert_eq!(items, (0..10).collect::<Vec<_>>());
/// ```
pub struct Queue<T> {
    /// The node most recently dequeued (or the initial sentinel). The first
    /// item in the queue, if any, is `head.next`.
    head: CachePadded<AtomicPtr<Node<T>>>,

    /// The last node in the list, or the second-to-last node while an
    /// enqueue that already linked its node has not yet swung the tail.
    tail: CachePadded<AtomicPtr<Node<T>>>,

    /// Net enqueues minus dequeues. Only exact when the queue is quiescent,
    /// and may briefly dip below zero when a dequeue of an item finishes
    /// before the enqueue that produced it.
    len: CachePadded<AtomicIsize>,

    domain: Domain<Node<T>>,
}

/// An iterator that dequeues items until the queue is observed empty.
///
/// Returned by [`Queue::drain`].
#[derive(Debug)]
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct Drain<'q, T> {
    q: &'q Queue<T>,
}

/// An owning iterator over the items remaining in a [`Queue`], in FIFO
/// order.
#[derive(Debug)]
pub struct IntoIter<T> {
    q: Queue<T>,
}

struct Node<T> {
    /// Null until a successor is linked; written exactly once after that.
    next: AtomicPtr<Node<T>>,

    /// Initialized for every node except the current sentinel. The dequeuer
    /// that swings `head` onto this node moves the value out.
    value: UnsafeCell<MaybeUninit<T>>,

    /// Link in the hazard domain's list of retired nodes.
    retired: AtomicPtr<Node<T>>,

    // participate in leak checking
    #[cfg(test)]
    _track: Track<()>,
}

// === impl Queue ===

impl<T> Queue<T> {
    /// The default number of retired nodes that may accumulate (beyond one
    /// per in-use hazard slot) before a dequeue tries to free them.
    pub const DEFAULT_RECLAIM_THRESHOLD: usize = 64;

    /// Returns a new, empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::with_reclaim_threshold(Self::DEFAULT_RECLAIM_THRESHOLD)
    }

    /// Returns a new, empty queue that lets up to `threshold` unlinked nodes
    /// (plus one per hazard slot in use) pile up before freeing them.
    ///
    /// A larger threshold amortizes reclamation over more dequeues at the
    /// cost of holding on to more memory. A threshold of zero frees nodes as
    /// eagerly as possible.
    #[must_use]
    pub fn with_reclaim_threshold(threshold: usize) -> Self {
        let sentinel = Node::sentinel().as_ptr();
        Self {
            head: CachePadded(AtomicPtr::new(sentinel)),
            tail: CachePadded(AtomicPtr::new(sentinel)),
            len: CachePadded(AtomicIsize::new(0)),
            domain: Domain::new(threshold),
        }
    }

    /// Appends `value` to the back of the queue.
    ///
    /// This never blocks and never fails. If other enqueues are racing, this
    /// retries until its node is linked, helping a lagging `tail` along on
    /// the way.
    pub fn enqueue(&self, value: T) {
        let node = Node::new(value).as_ptr();
        test_trace!(?node, "Queue::enqueue");

        let hazards = self.domain.hazards();
        let mut boff = Backoff::new();
        let tail = loop {
            let tail = hazards.protect(0, &self.tail);
            // Safety: `tail` is never null (there is always a sentinel), and
            // it is protected, so it cannot be freed while we look at it.
            let next = unsafe { (*tail).next.load(Acquire) };
            if tail != self.tail.load(Acquire) {
                continue;
            }

            if !next.is_null() {
                // Someone linked a node but hasn't swung the tail yet. Help
                // them, then try again from the new tail.
                test_trace!(?tail, ?next, "Queue::enqueue -> tail lagging");
                let _ = self.tail.compare_exchange(tail, next, AcqRel, Relaxed);
                continue;
            }

            // Safety: as above.
            let linked = unsafe {
                (*tail)
                    .next
                    .compare_exchange(ptr::null_mut(), node, AcqRel, Relaxed)
            };
            match linked {
                Ok(_) => break tail,
                Err(_actual) => {
                    test_trace!(?tail, next = ?_actual, "Queue::enqueue -> lost link race");
                    boff.spin();
                }
            }
        };

        // The node is now in the queue. Try once to swing the tail to it; if
        // this fails, another thread already helped.
        let _ = self.tail.compare_exchange(tail, node, AcqRel, Relaxed);
        drop(hazards);

        self.len.fetch_add(1, Relaxed);
        test_trace!(?node, ?tail, "Queue::enqueue -> linked");
    }

    /// Removes the item at the front of the queue.
    ///
    /// # Returns
    ///
    /// - `Some(T)` if an item was dequeued
    /// - `None` if the queue was empty
    pub fn dequeue(&self) -> Option<T> {
        let hazards = self.domain.hazards();
        let mut boff = Backoff::new();
        let (head, next) = loop {
            let head = hazards.protect(0, &self.head);
            let tail = self.tail.load(Acquire);
            // Safety: `head` is never null, and it is protected.
            let next = unsafe { (*head).next.load(Acquire) };
            hazards.set(1, next);
            // If `head` has not moved, `next` cannot have been dequeued (let
            // alone retired) yet, so it is now safely protected.
            if head != self.head.load(Acquire) {
                continue;
            }

            if next.is_null() {
                test_trace!(?head, "Queue::dequeue -> empty");
                return None;
            }

            if head == tail {
                // The queue is not empty, but the tail hasn't caught up with
                // the node after it. Help it before moving the head past it.
                test_trace!(?tail, ?next, "Queue::dequeue -> tail lagging");
                let _ = self.tail.compare_exchange(tail, next, AcqRel, Relaxed);
                continue;
            }

            if self
                .head
                .compare_exchange(head, next, AcqRel, Relaxed)
                .is_ok()
            {
                break (head, next);
            }
            boff.spin();
        };

        // Safety: winning the CAS above makes this thread the only one that
        // will ever read `next`'s value, which was initialized before `next`
        // was linked. `next` is still protected, so it can't be freed even
        // if other threads dequeue past it in the meantime.
        let value = unsafe { (*next).value.with_mut(|value| (*value).assume_init_read()) };
        drop(hazards);

        self.len.fetch_sub(1, Relaxed);
        test_trace!(?head, ?next, "Queue::dequeue -> dequeued");

        // Safety: `head` is no longer reachable from `self.head`, and only
        // the thread that swung the head past it retires it.
        unsafe {
            self.domain.retire(NonNull::new_unchecked(head));
        }

        Some(value)
    }

    /// Returns the number of items in the queue.
    ///
    /// This count is advisory: while other threads are enqueueing or
    /// dequeueing, it may be briefly out of date. It is exact whenever no
    /// operations are in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        let len = self.len.load(Relaxed);
        if len < 0 {
            0
        } else {
            len as usize
        }
    }

    /// Returns `true` if the queue had no items when it was checked.
    ///
    /// Unlike [`Queue::len`], this inspects the list itself rather than the
    /// advisory counter, but with concurrent enqueues and dequeues the answer
    /// may still be stale by the time the caller sees it.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let hazards = self.domain.hazards();
        let head = hazards.protect(0, &self.head);
        // Safety: `head` is never null, and it is protected.
        unsafe { (*head).next.load(Acquire).is_null() }
    }

    /// Returns an iterator that dequeues items until the queue is empty.
    ///
    /// Items enqueued by other threads while the iterator is in use may or
    /// may not be yielded.
    pub fn drain(&self) -> Drain<'_, T> {
        Drain { q: self }
    }

    /// Removes and drops every item in the queue, and frees every node the
    /// queue is holding on to.
    ///
    /// Because this requires exclusive access, no other operation can be in
    /// progress. When the queue is shared through an [`Arc`], use
    /// [`Arc::get_mut`] once all other handles are idle or dropped.
    ///
    /// [`Arc`]: alloc::sync::Arc
    /// [`Arc::get_mut`]: alloc::sync::Arc::get_mut
    pub fn clear(&mut self) {
        let _dropped = self.free_nodes();
        self.domain.reclaim_all();

        let sentinel = Node::sentinel().as_ptr();
        self.head.store(sentinel, Relaxed);
        self.tail.store(sentinel, Relaxed);
        self.len.store(0, Relaxed);
        debug!(dropped = _dropped, "cleared queue");
    }

    /// Frees the sentinel and every node after it, dropping their values.
    /// Returns the number of values dropped.
    ///
    /// Leaves `head` and `tail` dangling; the caller must reset or discard
    /// them.
    fn free_nodes(&mut self) -> usize {
        let mut curr = self.head.load(Relaxed);
        let mut is_sentinel = true;
        let mut dropped = 0;
        while let Some(node) = NonNull::new(curr) {
            // Safety: we have exclusive access to the queue, and every node
            // in the list came from `Box::into_raw`.
            let node = unsafe { Box::from_raw(node.as_ptr()) };
            curr = node.next.load(Relaxed);
            if !is_sentinel {
                // Safety: every node after the sentinel holds a value.
                node.value
                    .with_mut(|value| unsafe { (*value).assume_init_drop() });
                dropped += 1;
            }
            is_sentinel = false;
        }
        dropped
    }

    #[cfg(all(test, not(loom)))]
    #[track_caller]
    fn assert_valid(&self) {
        let head = self.head.load(Acquire);
        let tail = self.tail.load(Acquire);
        let mut last = head;
        let mut second_to_last = ptr::null_mut();
        let mut items = 0;
        loop {
            let next = unsafe { (*last).next.load(Acquire) };
            if next.is_null() {
                break;
            }
            second_to_last = last;
            last = next;
            items += 1;
        }
        assert!(
            tail == last || tail == second_to_last,
            "tail must be the last node or lag by one link; \
             tail={tail:p}, last={last:p}, second_to_last={second_to_last:p}",
        );
        assert_eq!(items, self.len(), "quiescent length must match the list");
    }

    #[cfg(all(test, not(loom)))]
    fn retired(&self) -> usize {
        self.domain.retired_count()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        self.free_nodes();
        // The domain frees retired nodes when it is dropped.
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("head", &format_args!("{:p}", self.head.load(Acquire)))
            .field("tail", &format_args!("{:p}", self.tail.load(Acquire)))
            .field("len", &self.len())
            .field("domain", &self.domain)
            .finish()
    }
}

impl<T> FromIterator<T> for Queue<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut q = Queue::new();
        q.extend(iter);
        q
    }
}

impl<T> Extend<T> for Queue<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for value in iter {
            self.enqueue(value);
        }
    }
}

impl<T> IntoIterator for Queue<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        IntoIter { q: self }
    }
}

// Safety: values are moved in on one thread and out on another, but never
// shared, so only `T: Send` is required, just like `Mutex<T>`.
unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

// === impl Drain ===

impl<T> Iterator for Drain<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.q.dequeue()
    }
}

// === impl IntoIter ===

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.q.dequeue()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        // we own the queue, so the count is exact.
        let len = self.q.len();
        (len, Some(len))
    }
}

impl<T> ExactSizeIterator for IntoIter<T> {}
impl<T> FusedIterator for IntoIter<T> {}

// === impl Node ===

impl<T> Node<T> {
    fn new(value: T) -> NonNull<Self> {
        Self::alloc(MaybeUninit::new(value))
    }

    fn sentinel() -> NonNull<Self> {
        Self::alloc(MaybeUninit::uninit())
    }

    fn alloc(value: MaybeUninit<T>) -> NonNull<Self> {
        let node = Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(value),
            retired: AtomicPtr::new(ptr::null_mut()),
            #[cfg(test)]
            _track: Track::new(()),
        });
        NonNull::from(Box::leak(node))
    }
}

unsafe impl<T> Retire for Node<T> {
    fn retired_link(&self) -> &AtomicPtr<Self> {
        &self.retired
    }

    unsafe fn reclaim(ptr: NonNull<Self>) {
        // A retired node was a sentinel, so its value has already been moved
        // out; dropping the box frees the node without touching it.
        drop(Box::from_raw(ptr.as_ptr()));
    }
}


#[cfg(all(loom, test))]
mod loom {
    use super::*;
    use crate::loom::{self, alloc::Track, sync::Arc, thread};

    #[derive(Debug)]
    struct Entry {
        val: i32,
        // participate in loom leak checking
        _track: Track<()>,
    }

    fn entry(val: i32) -> Entry {
        Entry {
            val,
            _track: Track::new(()),
        }
    }

    fn model(f: impl Fn() + Sync + Send + 'static) {
        let mut builder = loom::model::Builder::new();
        if builder.preemption_bound.is_none() {
            builder.preemption_bound = Some(3);
        }
        builder.check(f)
    }

    #[test]
    fn spsc_fifo() {
        model(|| {
            let q = Arc::new(Queue::with_reclaim_threshold(0));
            let producer = thread::spawn({
                let q = q.clone();
                move || {
                    q.enqueue(entry(1));
                    q.enqueue(entry(2));
                }
            });

            let mut seen = Vec::new();
            while seen.len() < 2 {
                match q.dequeue() {
                    Some(entry) => seen.push(entry.val),
                    None => thread::yield_now(),
                }
            }
            assert_eq!(seen, vec![1, 2]);
            producer.join().unwrap();
            assert_eq!(q.len(), 0);
        })
    }

    #[test]
    fn racing_producers() {
        model(|| {
            let q = Arc::new(Queue::with_reclaim_threshold(0));
            let threads: Vec<_> = (0..2)
                .map(|thread| {
                    let q = q.clone();
                    thread::spawn(move || q.enqueue(entry(thread)))
                })
                .collect();

            for thread in threads {
                thread.join().unwrap();
            }

            let mut seen: Vec<_> = q.drain().map(|entry| entry.val).collect();
            seen.sort_unstable();
            assert_eq!(seen, vec![0, 1]);
            assert_eq!(q.len(), 0);
        })
    }

    #[test]
    fn racing_consumers() {
        model(|| {
            let q = Arc::new(Queue::with_reclaim_threshold(0));
            q.enqueue(entry(1));
            q.enqueue(entry(2));

            let consumer = thread::spawn({
                let q = q.clone();
                move || q.dequeue().map(|entry| entry.val)
            });
            let mine = q.dequeue().map(|entry| entry.val);
            let theirs = consumer.join().unwrap();

            let mut seen = vec![mine.unwrap(), theirs.unwrap()];
            seen.sort_unstable();
            assert_eq!(seen, vec![1, 2]);
            assert!(q.dequeue().is_none());
        })
    }

    #[test]
    fn enqueue_races_dequeue() {
        model(|| {
            let q = Arc::new(Queue::with_reclaim_threshold(0));
            q.enqueue(entry(1));

            let producer = thread::spawn({
                let q = q.clone();
                move || q.enqueue(entry(2))
            });
            let consumer = thread::spawn({
                let q = q.clone();
                move || q.dequeue().map(|entry| entry.val)
            });

            // whatever the interleaving, the first item out is the one that
            // was enqueued before either thread started.
            assert_eq!(consumer.join().unwrap(), Some(1));
            producer.join().unwrap();
            assert_eq!(q.dequeue().map(|entry| entry.val), Some(2));
        })
    }

    #[test]
    fn drop_with_items_doesnt_leak() {
        model(|| {
            let q = Arc::new(Queue::with_reclaim_threshold(0));
            let producer = thread::spawn({
                let q = q.clone();
                move || {
                    q.enqueue(entry(1));
                    q.enqueue(entry(2));
                }
            });
            let _ = q.dequeue();
            producer.join().unwrap();
            // the queue, any remaining entries, and any retired nodes are all
            // dropped here; loom fails the model if any of them leak.
        })
    }
}
