use crate::loom::hint;
use core::{
    fmt,
    ops::{Deref, DerefMut},
};

#[cfg(any(test, feature = "tracing"))]
macro_rules! trace {
    ($($t:tt)*) => { tracing::trace!($($t)*) }
}

#[cfg(not(any(test, feature = "tracing")))]
macro_rules! trace {
    ($($t:tt)*) => {};
}

#[cfg(any(test, feature = "tracing"))]
macro_rules! debug {
    ($($t:tt)*) => { tracing::debug!($($t)*) }
}

#[cfg(not(any(test, feature = "tracing")))]
macro_rules! debug {
    ($($t:tt)*) => {};
}

/// Hot-path diagnostics. These are far too noisy to ever emit outside of
/// tests, even with the `tracing` feature enabled.
macro_rules! test_trace {
    ($($tt:tt)*) => {
        #[cfg(test)]
        tracing::trace!($($tt)*)
    }
}

/// An exponential backoff for CAS retry loops.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    exp: u8,
    max: u8,
}

pub(crate) use cache_pad::CachePadded;

/// When configured not to pad to cache alignment, just provide a no-op wrapper struct.
/// This feature is useful for platforms with no data cache, such as many Cortex-M
/// targets.
#[cfg(feature = "no-cache-pad")]
mod cache_pad {
    #[derive(Clone, Copy, Default, Hash, PartialEq, Eq)]
    pub(crate) struct CachePadded<T>(pub(crate) T);
}

/// When not inhibited, determine cache alignment based on target architecture.
/// Align to 128 bytes on 64-bit x86/ARM targets, otherwise align to 64 bytes.
///
/// `head` and `tail` are hammered by different sets of threads (consumers and
/// producers, respectively), so keeping them on separate lines matters.
#[cfg(not(feature = "no-cache-pad"))]
mod cache_pad {
    #[cfg_attr(any(target_arch = "x86_64", target_arch = "aarch64"), repr(align(128)))]
    #[cfg_attr(
        not(any(target_arch = "x86_64", target_arch = "aarch64")),
        repr(align(64))
    )]
    #[derive(Clone, Copy, Default, Hash, PartialEq, Eq)]
    pub(crate) struct CachePadded<T>(pub(crate) T);
}

// === impl Backoff ===

impl Backoff {
    /// Retry loops in the queue lose a CAS only when some other thread made
    /// progress, so the queue backs off less aggressively than a lock would.
    pub(crate) const DEFAULT_MAX_EXPONENT: u8 = 6;

    pub(crate) const fn new() -> Self {
        Self {
            exp: 0,
            max: Self::DEFAULT_MAX_EXPONENT,
        }
    }

    /// Perform one spin, doubling the number of spin hints issued next time.
    #[inline(always)]
    pub(crate) fn spin(&mut self) {
        // Issue 2^exp pause instructions. Under loom, every spin hint is a
        // yield point, so only issue one.
        let spins = if cfg!(loom) { 1 } else { 1 << self.exp };
        for _ in 0..spins {
            hint::spin_loop();
        }

        if self.exp < self.max {
            self.exp += 1
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

// === impl CachePadded ===

impl<T> Deref for CachePadded<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for CachePadded<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T: fmt::Debug> fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(all(test, not(loom)))]
pub(crate) fn assert_send_sync<T: Send + Sync>() {}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn backoff_saturates() {
        let mut boff = Backoff::new();
        for _ in 0..(Backoff::DEFAULT_MAX_EXPONENT as usize + 4) {
            boff.spin();
        }
        assert_eq!(boff.exp, Backoff::DEFAULT_MAX_EXPONENT);
    }

    #[test]
    #[cfg(all(
        not(feature = "no-cache-pad"),
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    fn cache_padded_alignment() {
        assert_eq!(core::mem::align_of::<CachePadded<usize>>(), 128);
        assert_eq!(*CachePadded(7usize), 7);
    }
}
