//! Storage models.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Shared progress of a single fetch.
///
/// Cloning a `Progress` gives another view onto the same counters, so the
/// task performing the fetch and whoever is waiting on it can both hold one.
/// Backends that know the size of what they are reading report bytes as
/// they go; backends that don't simply [`finish`](Self::finish) at the end.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    read: AtomicU64,
    total: AtomicU64,
    finished: AtomicBool,
}

impl Progress {
    /// A progress handle that is already complete.
    pub fn complete() -> Self {
        let progress = Self::default();
        progress.finish();
        progress
    }

    pub fn set_total(&self, bytes: u64) {
        self.inner.total.store(bytes, Ordering::Relaxed);
    }

    pub fn advance(&self, bytes: u64) {
        self.inner.read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn finish(&self) {
        self.inner.finished.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    /// Bytes read so far.
    pub fn read(&self) -> u64 {
        self.inner.read.load(Ordering::Relaxed)
    }

    /// Proportion of work done, between `0.0` and `1.0`.
    ///
    /// Unknown totals report `0.0` until the fetch finishes.
    pub fn ratio(&self) -> f32 {
        if self.is_finished() {
            return 1.0;
        }
        let total = self.inner.total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        (self.read() as f64 / total as f64).clamp(0.0, 1.0) as f32
    }
}
