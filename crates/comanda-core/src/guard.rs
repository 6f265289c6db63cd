//! Single-flight guard for job passes

use std::sync::atomic::{AtomicBool, Ordering};

/// Holds the running flag for one pass and clears it on drop
pub(crate) struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    /// None when another pass already holds the flag
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
