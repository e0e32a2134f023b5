pub(crate) use self::inner::*;

#[cfg(loom)]
mod inner {
    #![allow(unused_imports)]

    pub(crate) mod atomic {
        pub use core::sync::atomic::Ordering;
        pub use loom::sync::atomic::*;
    }

    pub(crate) use loom::{cell, hint, model, sync, thread};

    pub(crate) mod alloc {
        #![allow(dead_code)]
        use core::fmt;
        use loom::alloc;

        /// Track allocations, detecting leaks.
        ///
        /// Under loom, this is just `loom::alloc::Track`, which makes the
        /// model fail if a tracked value is still alive when a permutation
        /// ends.
        pub struct Track<T>(alloc::Track<T>);

        impl<T> Track<T> {
            #[inline(always)]
            pub fn new(value: T) -> Track<T> {
                Track(alloc::Track::new(value))
            }
        }

        impl<T: fmt::Debug> fmt::Debug for Track<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    }
}

#[cfg(not(loom))]
mod inner {
    #![allow(dead_code)]

    pub(crate) mod sync {
        pub(crate) use core::sync::atomic;
    }

    pub(crate) use core::sync::atomic;

    #[cfg(test)]
    pub(crate) mod thread {
        pub(crate) use std::thread::{yield_now, JoinHandle};

        /// Spawns a thread that inherits the spawning thread's allocation
        /// tracking registry, so that leaks on any thread fail the test.
        pub(crate) fn spawn<F, T>(f: F) -> JoinHandle<T>
        where
            F: FnOnce() -> T + Send + 'static,
            T: Send + 'static,
        {
            let track = super::alloc::track::Registry::current();
            std::thread::spawn(move || {
                let _tracking = track.map(|track| track.set_default());
                f()
            })
        }
    }

    pub(crate) mod hint {
        #[inline(always)]
        pub(crate) fn spin_loop() {
            core::hint::spin_loop()
        }
    }

    pub(crate) mod cell {
        #[derive(Debug)]
        pub(crate) struct UnsafeCell<T>(core::cell::UnsafeCell<T>);

        impl<T> UnsafeCell<T> {
            pub const fn new(data: T) -> UnsafeCell<T> {
                UnsafeCell(core::cell::UnsafeCell::new(data))
            }

            #[inline(always)]
            pub fn with<F, R>(&self, f: F) -> R
            where
                F: FnOnce(*const T) -> R,
            {
                f(self.0.get())
            }

            #[inline(always)]
            pub fn with_mut<F, R>(&self, f: F) -> R
            where
                F: FnOnce(*mut T) -> R,
            {
                f(self.0.get())
            }
        }
    }

    /// Runs `f` once, failing if anything tracked with [`alloc::Track`] is
    /// still alive afterwards. This is the non-loom stand-in for
    /// `loom::model`, so tests can be written once for both.
    #[cfg(test)]
    pub(crate) fn model(f: impl FnOnce()) {
        // per-operation `test_trace!` output from threaded tests is too
        // much to be useful, so stop at `DEBUG`.
        let collector = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .without_time()
            .with_thread_ids(true)
            .with_thread_names(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(collector);

        let registry = alloc::track::Registry::default();
        {
            let _tracking = registry.set_default();
            f();
        }
        registry.check();
    }

    pub(crate) mod alloc {
        #[cfg(test)]
        use std::sync::Arc;

        #[cfg(test)]
        pub(in crate::loom) mod track {
            use std::{
                cell::RefCell,
                sync::{
                    atomic::{AtomicBool, Ordering},
                    Arc, Mutex, Weak,
                },
            };

            #[derive(Clone, Debug, Default)]
            pub(crate) struct Registry(Arc<Mutex<Allocations>>);

            #[derive(Debug, Default)]
            struct Allocations {
                live: Vec<Weak<Tracked>>,
                next_id: usize,
            }

            #[derive(Debug)]
            pub(super) struct Tracked {
                reported: AtomicBool,
                type_name: &'static str,
                location: &'static core::panic::Location<'static>,
                id: usize,
            }

            thread_local! {
                static REGISTRY: RefCell<Option<Registry>> = const { RefCell::new(None) };
            }

            impl Registry {
                pub(in crate::loom) fn current() -> Option<Registry> {
                    REGISTRY.with(|current| current.borrow().clone())
                }

                pub(in crate::loom) fn set_default(&self) -> impl Drop {
                    struct Restore(Option<Registry>);
                    impl Drop for Restore {
                        fn drop(&mut self) {
                            let _ =
                                REGISTRY.try_with(|current| *current.borrow_mut() = self.0.take());
                        }
                    }

                    REGISTRY.with(|current| {
                        let mut current = current.borrow_mut();
                        let restore = Restore(current.clone());
                        *current = Some(self.clone());
                        restore
                    })
                }

                #[track_caller]
                pub(super) fn start_tracking<T>() -> Option<Arc<Tracked>> {
                    // not `Option::map`: the closure would become the caller
                    // seen by `#[track_caller]`.
                    #[allow(clippy::manual_map)]
                    match Self::current() {
                        Some(registry) => Some(registry.insert::<T>()),
                        None => None,
                    }
                }

                #[track_caller]
                fn insert<T>(&self) -> Arc<Tracked> {
                    let mut allocs = self.0.lock().unwrap();
                    let id = allocs.next_id;
                    allocs.next_id += 1;
                    let tracked = Arc::new(Tracked {
                        reported: AtomicBool::new(false),
                        type_name: std::any::type_name::<T>(),
                        location: core::panic::Location::caller(),
                        id,
                    });
                    test_trace!(
                        target: "hyphae::alloc",
                        id,
                        "type" = %tracked.type_name,
                        location = %tracked.location,
                        "tracking allocation",
                    );
                    allocs.live.push(Arc::downgrade(&tracked));
                    tracked
                }

                pub(in crate::loom) fn check(&self) {
                    let leaked = self
                        .0
                        .lock()
                        .unwrap()
                        .live
                        .iter()
                        .filter_map(|weak| {
                            let tracked = weak.upgrade()?;
                            tracked.reported.store(true, Ordering::SeqCst);
                            Some(format!(
                                " - id {}, {} allocated at {}",
                                tracked.id, tracked.type_name, tracked.location
                            ))
                        })
                        .collect::<Vec<_>>();
                    if !leaked.is_empty() {
                        let leaked = leaked.join("\n  ");
                        panic!("the following allocations were leaked:\n  {leaked}");
                    }
                }
            }

            impl Drop for Tracked {
                fn drop(&mut self) {
                    if !self.reported.load(Ordering::SeqCst) {
                        test_trace!(
                            target: "hyphae::alloc",
                            id = self.id,
                            "type" = %self.type_name,
                            "tracked allocation freed",
                        );
                    }
                }
            }
        }

        /// Track allocations, detecting leaks.
        #[derive(Debug, Default)]
        pub struct Track<T> {
            value: T,

            #[cfg(test)]
            tracked: Option<Arc<track::Tracked>>,
        }

        impl<T> Track<T> {
            #[inline(always)]
            #[track_caller]
            pub fn new(value: T) -> Track<T> {
                Track {
                    value,

                    #[cfg(test)]
                    tracked: track::Registry::start_tracking::<T>(),
                }
            }
        }
    }
}
