//! Hazard-pointer memory reclamation.
//!
//! A node unlinked from a lock-free structure may still be referenced by
//! threads that loaded a pointer to it before it was unlinked. Those threads
//! announce such pointers by *publishing* them in a hazard slot before
//! dereferencing them. Unlinked nodes are *retired* to a [`Domain`], which
//! only frees a retired node once a scan finds that no hazard slot names it.
//!
//! Because an address can only be reused after it is freed, a thread that
//! holds a hazard on a pointer can never observe that address being
//! recycled underneath it, which also rules out ABA on any CAS that compares
//! against a protected pointer.
//!
//! Based on Maged Michael, ["Hazard Pointers: Safe Memory Reclamation for
//! Lock-Free Objects"][hp] (IEEE TPDS, 2004).
//!
//! [hp]: https://www.cs.otago.ac.nz/cosc440/readings/hazard-pointers.pdf
use crate::loom::atomic::{self, AtomicBool, AtomicPtr, AtomicUsize, Ordering::*};
use alloc::{boxed::Box, vec::Vec};
use core::{
    fmt,
    ptr::{self, NonNull},
};

/// Number of hazard slots in each [`Record`]. A queue operation never needs
/// to protect more than two nodes at once (`head` and `head.next`).
pub(crate) const SLOTS: usize = 2;

/// Types which can be retired to a hazard [`Domain`].
///
/// # Safety
///
/// Implementations must ensure that:
///
/// - [`Retire::retired_link`] always returns the same link for a given
///   node, and that link is used for nothing else while the node is retired.
/// - [`Retire::reclaim`] frees the node without touching any value that was
///   already moved out of it.
pub(crate) unsafe trait Retire: Sized {
    /// Returns the intrusive link used to chain this node into the domain's
    /// list of retired nodes.
    fn retired_link(&self) -> &AtomicPtr<Self>;

    /// Frees a retired node.
    ///
    /// # Safety
    ///
    /// `ptr` must have been retired, must not be protected by any hazard, and
    /// must not be reclaimed more than once.
    unsafe fn reclaim(ptr: NonNull<Self>);
}

/// A set of hazard records plus the nodes waiting to be freed.
pub(crate) struct Domain<N: Retire> {
    /// Push-only list of hazard records. Records are reused but never freed
    /// until the domain is dropped.
    records: AtomicPtr<Record<N>>,
    /// Number of records ever allocated.
    record_count: AtomicUsize,

    /// Intrusive Treiber stack of retired nodes.
    retired: AtomicPtr<N>,
    /// Approximate number of nodes on `retired`.
    retired_count: AtomicUsize,

    /// How many retired nodes beyond the number of hazard slots may pile up
    /// before a retiring thread runs a scan.
    threshold: usize,
}

/// Exclusive use of one hazard [`Record`] for the duration of an operation.
///
/// Dropping the guard clears its slots and returns the record to the domain.
#[must_use = "hazards are released as soon as the guard is dropped"]
pub(crate) struct Hazards<'domain, N> {
    record: &'domain Record<N>,
}

struct Record<N> {
    slots: [AtomicPtr<N>; SLOTS],
    active: AtomicBool,
    /// Written once, before the record is published.
    next: *mut Record<N>,
}

// === impl Domain ===

impl<N: Retire> Domain<N> {
    pub(crate) fn new(threshold: usize) -> Self {
        Self {
            records: AtomicPtr::new(ptr::null_mut()),
            record_count: AtomicUsize::new(0),
            retired: AtomicPtr::new(ptr::null_mut()),
            retired_count: AtomicUsize::new(0),
            threshold,
        }
    }

    /// Claims a hazard record, allocating a new one only if every existing
    /// record is in use.
    pub(crate) fn hazards(&self) -> Hazards<'_, N> {
        let mut curr = self.records.load(Acquire);
        while let Some(record) = NonNull::new(curr) {
            // Safety: records are never freed while the domain is alive.
            let record = unsafe { &*record.as_ptr() };
            if !record.active.load(Relaxed)
                && record
                    .active
                    .compare_exchange(false, true, Acquire, Relaxed)
                    .is_ok()
            {
                return Hazards { record };
            }
            curr = record.next;
        }

        let record = Box::into_raw(Box::new(Record {
            slots: [AtomicPtr::new(ptr::null_mut()), AtomicPtr::new(ptr::null_mut())],
            active: AtomicBool::new(true),
            next: ptr::null_mut(),
        }));
        let mut head = self.records.load(Relaxed);
        loop {
            // Safety: we still own `record` until the CAS below publishes it.
            unsafe {
                (*record).next = head;
            }
            match self
                .records
                .compare_exchange_weak(head, record, AcqRel, Acquire)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        let _count = self.record_count.fetch_add(1, Relaxed) + 1;
        trace!(records = _count, "allocated hazard record");

        // Safety: published records live as long as the domain.
        Hazards {
            record: unsafe { &*record },
        }
    }

    /// Hands an unlinked node to the domain, freeing it once no hazard
    /// protects it.
    ///
    /// # Safety
    ///
    /// `node` must already be unreachable for any thread that does not
    /// currently hold it in a hazard slot, and must be retired only once.
    pub(crate) unsafe fn retire(&self, node: NonNull<N>) {
        test_trace!(?node, "Domain::retire");
        self.push_retired(node, node, 1);

        let retired = self.retired_count.load(Relaxed);
        let hazard_slots = self.record_count.load(Relaxed) * SLOTS;
        if retired >= self.threshold + hazard_slots {
            self.scan();
        }
    }

    /// Frees every retired node that is not currently protected.
    fn scan(&self) {
        let mut curr = self.retired.swap(ptr::null_mut(), Acquire);
        if curr.is_null() {
            // another thread is already scanning this batch
            return;
        }

        // Pairs with the fence in `Hazards::set`: either a thread published
        // its hazard before this fence, and we see it below, or its
        // validation load happens after it, and sees that the node was
        // unlinked.
        atomic::fence(SeqCst);
        let protected = self.protected();

        let mut taken = 0;
        let mut _freed = 0;
        let mut kept: Option<(NonNull<N>, NonNull<N>)> = None;
        let mut kept_count = 0;
        while let Some(node) = NonNull::new(curr) {
            taken += 1;
            // Safety: nodes on the retired list are only freed by whoever
            // took them off the list, which is us.
            let link = unsafe { node.as_ref() }.retired_link();
            curr = link.load(Relaxed);

            if protected.contains(&node.as_ptr()) {
                link.store(ptr::null_mut(), Relaxed);
                kept = Some(match kept {
                    None => (node, node),
                    Some((first, last)) => {
                        // Safety: `last` is a survivor we took off the list.
                        unsafe { last.as_ref() }
                            .retired_link()
                            .store(node.as_ptr(), Relaxed);
                        (first, node)
                    }
                });
                kept_count += 1;
            } else {
                // Safety: the node was retired, so it is unreachable, and no
                // hazard slot names it.
                unsafe { N::reclaim(node) };
                _freed += 1;
            }
        }

        self.retired_count.fetch_sub(taken, Relaxed);
        if let Some((first, last)) = kept {
            self.push_retired(first, last, kept_count);
        }

        trace!(
            scanned = taken,
            freed = _freed,
            still_protected = kept_count,
            "reclaimed retired nodes"
        );
    }

    /// Pushes the chain `first..=last` (linked through `retired_link`) onto
    /// the retired stack.
    fn push_retired(&self, first: NonNull<N>, last: NonNull<N>, count: usize) {
        self.retired_count.fetch_add(count, Relaxed);
        // Safety: retired nodes are only freed by the thread that swapped
        // them off the list, and this chain is not on the list yet.
        let last_link = unsafe { last.as_ref() }.retired_link();
        let mut head = self.retired.load(Relaxed);
        loop {
            last_link.store(head, Relaxed);
            match self
                .retired
                .compare_exchange_weak(head, first.as_ptr(), Release, Relaxed)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Snapshot of every pointer currently published in any hazard slot.
    fn protected(&self) -> Vec<*mut N> {
        let mut protected = Vec::with_capacity(self.record_count.load(Relaxed) * SLOTS);
        let mut curr = self.records.load(Acquire);
        while let Some(record) = NonNull::new(curr) {
            // Safety: records are never freed while the domain is alive.
            let record = unsafe { &*record.as_ptr() };
            for slot in &record.slots {
                let ptr = slot.load(Acquire);
                if !ptr.is_null() {
                    protected.push(ptr);
                }
            }
            curr = record.next;
        }
        protected
    }

    /// Frees every retired node. Taking `&mut self` guarantees that no
    /// hazard guard is alive.
    pub(crate) fn reclaim_all(&mut self) {
        let mut curr = self.retired.swap(ptr::null_mut(), Acquire);
        let mut _freed = 0usize;
        while let Some(node) = NonNull::new(curr) {
            // Safety: we have exclusive access to the domain, so nothing can
            // be protecting a retired node.
            unsafe {
                curr = node.as_ref().retired_link().load(Relaxed);
                N::reclaim(node);
            }
            _freed += 1;
        }
        self.retired_count.store(0, Relaxed);
        debug!(freed = _freed, "reclaimed all retired nodes");
    }
}

impl<N: Retire> Domain<N> {
    #[cfg(all(test, not(loom)))]
    pub(crate) fn retired_count(&self) -> usize {
        self.retired_count.load(Relaxed)
    }
}

impl<N: Retire> Drop for Domain<N> {
    fn drop(&mut self) {
        self.reclaim_all();

        let mut curr = self.records.load(Relaxed);
        while let Some(record) = NonNull::new(curr) {
            // Safety: we have exclusive access, and every record was created
            // by `Box::into_raw` in `hazards`.
            let record = unsafe { Box::from_raw(record.as_ptr()) };
            debug_assert!(!record.active.load(Relaxed), "hazard guard outlived its domain");
            curr = record.next;
        }
    }
}

impl<N: Retire> fmt::Debug for Domain<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("records", &self.record_count.load(Relaxed))
            .field("retired", &self.retired_count.load(Relaxed))
            .field("threshold", &self.threshold)
            .finish()
    }
}

// Safety: the domain only ever hands out raw pointers to `N`s that the owning
// structure already shares between threads.
unsafe impl<N: Retire + Send> Send for Domain<N> {}
unsafe impl<N: Retire + Send> Sync for Domain<N> {}

// === impl Hazards ===

impl<N> Hazards<'_, N> {
    /// Loads `src` and protects the loaded pointer in `slot`, retrying until
    /// the protected value is still what `src` holds.
    ///
    /// Once this returns, the returned node cannot be freed until the slot
    /// is overwritten or the guard is dropped, provided it was reachable
    /// from `src` at the time of the final load.
    #[inline]
    pub(crate) fn protect(&self, slot: usize, src: &AtomicPtr<N>) -> *mut N {
        let mut ptr = src.load(Relaxed);
        loop {
            self.set(slot, ptr);
            let actual = src.load(Acquire);
            if actual == ptr {
                return ptr;
            }
            ptr = actual;
        }
    }

    /// Publishes `ptr` in `slot`. The caller must re-validate that `ptr` is
    /// still reachable before dereferencing it.
    #[inline]
    pub(crate) fn set(&self, slot: usize, ptr: *mut N) {
        self.record.slots[slot].store(ptr, Release);
        atomic::fence(SeqCst);
    }
}

impl<N> Drop for Hazards<'_, N> {
    fn drop(&mut self) {
        for slot in &self.record.slots {
            slot.store(ptr::null_mut(), Release);
        }
        self.record.active.store(false, Release);
    }
}

impl<N> fmt::Debug for Hazards<'_, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for slot in &self.record.slots {
            list.entry(&slot.load(Relaxed));
        }
        list.finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::loom::alloc::Track;

    struct Garbage {
        link: AtomicPtr<Garbage>,
        _track: Track<()>,
    }

    unsafe impl Retire for Garbage {
        fn retired_link(&self) -> &AtomicPtr<Self> {
            &self.link
        }

        unsafe fn reclaim(ptr: NonNull<Self>) {
            drop(Box::from_raw(ptr.as_ptr()));
        }
    }

    fn garbage() -> NonNull<Garbage> {
        let garbage = Box::new(Garbage {
            link: AtomicPtr::new(ptr::null_mut()),
            _track: Track::new(()),
        });
        NonNull::from(Box::leak(garbage))
    }

    #[test]
    fn records_are_reused() {
        let domain = Domain::<Garbage>::new(0);
        let first = domain.hazards();
        let first_record = first.record as *const Record<Garbage>;
        drop(first);

        let second = domain.hazards();
        assert_eq!(second.record as *const Record<Garbage>, first_record);

        // while `second` is held, a new record must be allocated
        let third = domain.hazards();
        assert_ne!(third.record as *const Record<Garbage>, first_record);
        assert_eq!(domain.record_count.load(Relaxed), 2);
    }

    #[test]
    fn protected_nodes_survive_scans() {
        crate::loom::model(|| {
            let domain = Domain::<Garbage>::new(0);
            let node = garbage();
            let src = AtomicPtr::new(node.as_ptr());

            let hazards = domain.hazards();
            assert_eq!(hazards.protect(0, &src), node.as_ptr());
            src.store(ptr::null_mut(), SeqCst);

            // one record is live, so every second retirement runs a scan.
            unsafe {
                domain.retire(node);
                domain.retire(garbage());
                domain.retire(garbage());
            }
            assert_eq!(domain.retired_count.load(Relaxed), 1);
            assert_eq!(domain.retired.load(Relaxed), node.as_ptr());

            drop(hazards);
            unsafe { domain.retire(garbage()) };
            assert_eq!(domain.retired_count.load(Relaxed), 0);
            assert!(domain.retired.load(Relaxed).is_null());
        });
    }

    #[test]
    fn drop_reclaims_retired_nodes() {
        crate::loom::model(|| {
            let domain = Domain::<Garbage>::new(64);
            for _ in 0..10 {
                unsafe { domain.retire(garbage()) };
            }
            assert_eq!(domain.retired_count.load(Relaxed), 10);
            drop(domain);
        });
    }
}
