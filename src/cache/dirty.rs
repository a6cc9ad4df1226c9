//! DirtyData - one batch of dirty entries handed to a backend write.
//!
//! The consumer walks the batch with `has_next/next`, attempts the write,
//! and then must `commit` (entries leave the dirty chain) or `rollback`
//! (entries stay dirty and are retried). Dropping an unfinished batch
//! aborts it, which also keeps every entry dirty.

use super::{BatchOutcome, CacheValue, WriteBackCache};
use parking_lot::RwLockWriteGuard;
use std::hash::Hash;

/// A key and the value copied out of the cache for flushing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyEntry<K, V> {
    pub key: K,
    pub value: V,
    generation: u64,
}

impl<K, V> DirtyEntry<K, V> {
    pub(crate) fn new(key: K, value: V, generation: u64) -> Self {
        DirtyEntry {
            key,
            value,
            generation,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchState {
    Pending,
    Begun,
    Finished,
}

/// Batch of dirty entries detached from a [`WriteBackCache`].
pub struct DirtyData<'a, K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: CacheValue,
{
    cache: &'a WriteBackCache<K, V>,
    entries: Vec<DirtyEntry<K, V>>,
    cursor: usize,
    state: BatchState,
    copy: bool,
    // Held for the lifetime of a locked batch; blocks writers.
    _gate: Option<RwLockWriteGuard<'a, ()>>,
}

impl<'a, K, V> DirtyData<'a, K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: CacheValue,
{
    pub(crate) fn new(
        cache: &'a WriteBackCache<K, V>,
        entries: Vec<DirtyEntry<K, V>>,
        copy: bool,
        gate: Option<RwLockWriteGuard<'a, ()>>,
    ) -> Self {
        DirtyData {
            cache,
            entries,
            cursor: 0,
            state: BatchState::Pending,
            copy,
            _gate: gate,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if this batch is a detached snapshot rather than a locked view.
    pub fn is_copy(&self) -> bool {
        self.copy
    }

    /// Marks the start of a write attempt and rewinds the cursor.
    pub fn begin(&mut self) {
        debug_assert!(self.state != BatchState::Finished, "begin on finished batch");
        self.state = BatchState::Begun;
        self.cursor = 0;
    }

    pub fn is_begun(&self) -> bool {
        self.state == BatchState::Begun
    }

    pub fn has_next(&self) -> bool {
        self.cursor < self.entries.len()
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&DirtyEntry<K, V>> {
        let entry = self.entries.get(self.cursor)?;
        self.cursor += 1;
        Some(entry)
    }

    pub fn entries(&self) -> &[DirtyEntry<K, V>] {
        &self.entries
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.iter().map(|e| &e.key)
    }

    /// The write succeeded: entries leave the dirty chain unless they were
    /// mutated again while the batch was out.
    pub fn commit(mut self) {
        self.finish(BatchOutcome::Commit);
    }

    /// The write failed: every entry stays dirty and is retried.
    pub fn rollback(mut self) {
        self.finish(BatchOutcome::Rollback);
    }

    /// No write was attempted; hand the entries back untouched.
    pub fn abort(mut self) {
        self.finish(BatchOutcome::Abort);
    }

    fn finish(&mut self, outcome: BatchOutcome) {
        if self.state == BatchState::Finished {
            return;
        }
        self.state = BatchState::Finished;
        self.cache.finish_batch(&self.entries, outcome);
    }
}

impl<K, V> Drop for DirtyData<'_, K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: CacheValue,
{
    fn drop(&mut self) {
        self.finish(BatchOutcome::Abort);
    }
}
