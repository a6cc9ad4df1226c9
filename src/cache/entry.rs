//! Cache entry: value under its own lock plus write generations.

use crate::clock::Millis;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// One cached value.
///
/// `generation` counts mutations; `committed` is the highest generation
/// known to have reached the backend. An entry is clean when the two match.
pub(crate) struct Entry<V> {
    pub(crate) value: Mutex<V>,
    generation: AtomicU64,
    committed: AtomicU64,
    loaded_at: AtomicU64,
    last_access: AtomicU64,
}

impl<V: Clone> Entry<V> {
    pub(crate) fn new(value: V, now: Millis) -> Self {
        Entry {
            value: Mutex::new(value),
            generation: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            loaded_at: AtomicU64::new(now.0),
            last_access: AtomicU64::new(now.0),
        }
    }

    #[inline]
    pub(crate) fn touch(&self, now: Millis) {
        self.last_access.store(now.0, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub(crate) fn loaded_at(&self) -> Millis {
        Millis(self.loaded_at.load(Ordering::Relaxed))
    }

    pub(crate) fn set_loaded_at(&self, now: Millis) {
        self.loaded_at.store(now.0, Ordering::Relaxed);
    }

    /// Must be called while the value lock is held.
    pub(crate) fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn commit_generation(&self, generation: u64) {
        self.committed.fetch_max(generation, Ordering::AcqRel);
    }

    pub(crate) fn is_clean(&self) -> bool {
        self.committed.load(Ordering::Acquire) >= self.generation.load(Ordering::Acquire)
    }

    /// Copies the value and its generation atomically with respect to writers.
    pub(crate) fn snapshot(&self) -> (V, u64) {
        let value = self.value.lock();
        (value.clone(), self.generation())
    }
}
