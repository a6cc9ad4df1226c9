//! DbCounter - one named counter: a write-back cache over a backend.

use super::backend::{CounterBackend, CounterRef};
use super::error::{BackendError, CounterError};
use super::item::{Adder, CompareAndSet, CounterItem, Setter};
use super::Counter;
use crate::cache::{CacheStats, Change, CleanupPolicy, Updater, WriteBackCache};
use crate::clock::Clock;
use crate::config::CounterConfig;
use crate::label::KeyRange;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// State shared by every counter of one factory.
pub(crate) struct CounterShared<B> {
    pub(crate) server_id: String,
    pub(crate) backend: B,
    pub(crate) config: CounterConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) dirty: Arc<Notify>,
}

/// Outcome of one [`DbCounter::flush`] cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterFlush {
    /// Items committed
    pub written: usize,
    /// Batches committed
    pub batches: usize,
    /// A batch was rolled back and the cycle stopped early
    pub failed: bool,
}

pub struct DbCounter<B> {
    name: String,
    shared: Arc<CounterShared<B>>,
    cache: WriteBackCache<String, CounterItem>,
}

impl<B: CounterBackend> DbCounter<B> {
    pub(crate) fn new(name: String, shared: Arc<CounterShared<B>>) -> Self {
        let notify = shared.dirty.clone();
        let cache = WriteBackCache::new(shared.config.cache_config(), shared.clock.clone())
            .with_dirty_listener(Arc::new(move || notify.notify_one()));
        DbCounter {
            name,
            shared,
            cache,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.shared.server_id
    }

    fn counter_ref(&self) -> CounterRef<'_> {
        CounterRef {
            name: &self.name,
            server_id: &self.shared.server_id,
        }
    }

    fn load_item(&self, id: &str) -> Result<Option<CounterItem>, BackendError> {
        let counter = self.counter_ref();
        let backend = &self.shared.backend;
        self.cache.get_or_load(
            &id.to_string(),
            |key| {
                let loaded = backend.load(counter, key);
                if let Ok(item) = &loaded {
                    debug!(counter = counter.name, id = %key, found = item.is_some(), "loaded item");
                }
                loaded
            },
            self.shared.config.expire,
        )
    }

    /// Loads ahead of a mutation. A failed load is treated as absent.
    fn load_for_write(&self, id: &str) -> Option<CounterItem> {
        match self.load_item(id) {
            Ok(item) => item,
            Err(e) => {
                warn!(counter = %self.name, id, error = %e, "load failed; treating item as new");
                None
            }
        }
    }

    fn write<U>(&self, id: &str, updater: U) -> U::Output
    where
        U: Updater<String, CounterItem>,
    {
        let loaded = self.load_for_write(id);
        let key = id.to_string();
        // The loaded copy seeds the entry if it was evicted after the load.
        let updated = self.cache.update_or_insert(&key, loaded, updater);
        if updated.created {
            self.persist_new(&key, updated.generation);
        } else {
            self.cache.mark_updated(&key);
        }
        updated.output
    }

    /// Writes a freshly created item straight through. On failure the item
    /// stays dirty and the flusher retries it.
    fn persist_new(&self, key: &String, generation: u64) {
        let Some(item) = self.cache.get(key) else {
            return;
        };
        match self.shared.backend.insert_new(self.counter_ref(), &item) {
            Ok(()) => {
                self.cache.mark_persisted(key, generation);
                // A write that raced the insert may have been overwritten.
                if self.cache.generation(key) > Some(generation) {
                    self.cache.mark_updated(key);
                }
            }
            Err(e) => {
                warn!(counter = %self.name, id = %key, error = %e, "insert of new item failed; left dirty");
                self.cache.mark_updated(key);
            }
        }
    }

    /// Cached or freshly loaded item.
    pub fn get_item(&self, id: &str) -> Result<Option<CounterItem>, CounterError> {
        Ok(self.load_item(id)?)
    }

    /// Alias of [`Counter::inc_by`].
    pub fn add_and_get(&self, id: &str, delta: i64) -> i64 {
        self.inc_by(id, delta)
    }

    fn scan(&self, range: KeyRange) -> Result<Vec<CounterItem>, CounterError> {
        let persisted = self.shared.backend.scan(self.counter_ref(), &range)?;
        let mut merged: BTreeMap<String, CounterItem> = persisted
            .into_iter()
            .map(|item| (item.id().to_string(), item))
            .collect();
        for (id, item) in self.cache.entries() {
            if range.contains(&id) {
                merged.insert(id, item);
            }
        }
        Ok(merged.into_values().filter(|item| item.get() != 0).collect())
    }

    /// Runs one flush cycle for this counter.
    ///
    /// Drains at most as many items as were dirty when the cycle started,
    /// in batches of `max_batch`. The first failed batch is rolled back and
    /// ends the cycle; its items are retried next time.
    pub fn flush(&self) -> CounterFlush {
        let mut report = CounterFlush::default();
        let budget = self.cache.dirty_len();
        if budget == 0 {
            debug!(counter = %self.name, "nothing to flush");
            return report;
        }

        let copy = self.shared.config.flush_mode.is_copy();
        let max_batch = self.shared.config.max_batch;
        while report.written < budget {
            let mut batch = self.cache.get_dirty_data(copy, max_batch);
            if batch.is_empty() {
                break;
            }
            batch.begin();
            let size = batch.len();
            match self.shared.backend.bulk_update(self.counter_ref(), &mut batch) {
                Ok(()) => {
                    batch.commit();
                    report.written += size;
                    report.batches += 1;
                    debug!(counter = %self.name, size, "flushed batch");
                }
                Err(e) => {
                    batch.rollback();
                    warn!(counter = %self.name, size, error = %e, "flush batch failed; rolled back");
                    report.failed = true;
                    break;
                }
            }
        }
        report
    }

    /// Number of cached items.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Number of items waiting for a flush.
    pub fn dirty_len(&self) -> usize {
        self.cache.dirty_len()
    }

    pub fn is_dirty(&self, id: &str) -> bool {
        self.cache.is_dirty(&id.to_string())
    }

    pub fn cleanup(&self, policy: CleanupPolicy) -> usize {
        self.cache.cleanup(policy)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

impl<B: CounterBackend> Counter for DbCounter<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, id: &str) -> Result<i64, CounterError> {
        Ok(self.load_item(id)?.map(|item| item.get()).unwrap_or(0))
    }

    fn inc_by(&self, id: &str, step: i64) -> i64 {
        self.write(id, Adder(step))
    }

    fn set(&self, id: &str, value: i64) -> i64 {
        self.write(id, Setter(value))
    }

    fn compare_and_set(&self, id: &str, expect: i64, value: i64) -> bool {
        let key = id.to_string();
        if let Some(loaded) = self.load_for_write(id) {
            let swapped = self.cache.modify_or_insert(&key, loaded, |item| {
                if item.get() == expect {
                    item.set(value);
                    Change::Updated(true)
                } else {
                    Change::Unchanged(false)
                }
            });
            if swapped {
                self.cache.mark_updated(&key);
            }
            return swapped;
        }

        // An absent item counts as zero.
        if expect != 0 {
            return false;
        }
        let updated = self.cache.update(&key, CompareAndSet { expect, value });
        if updated.created {
            self.persist_new(&key, updated.generation);
        } else {
            self.cache.mark_updated(&key);
        }
        updated.output
    }

    fn remove(&self, id: &str) -> bool {
        let Some(loaded) = self.load_for_write(id) else {
            return false;
        };
        let key = id.to_string();
        let removed = self.cache.modify_or_insert(&key, loaded, |item| {
            if item.get() == 0 {
                Change::Unchanged(false)
            } else {
                item.set(0);
                Change::Updated(true)
            }
        });
        if removed {
            self.cache.mark_updated(&key);
        }
        removed
    }

    fn remove_all(&self) {
        self.cache.remove_all();
        debug!(counter = %self.name, "cleared cached items");
    }

    fn starts_with(&self, prefix: &str) -> Result<Vec<CounterItem>, CounterError> {
        self.scan(KeyRange::prefix(prefix))
    }

    fn search_range(&self, first: &str, last: &str) -> Result<Vec<CounterItem>, CounterError> {
        self.scan(KeyRange::between(first, last))
    }
}
