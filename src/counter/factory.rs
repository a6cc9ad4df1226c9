//! DbCounterFactory - registry of named counters for one node.

use super::backend::{CounterBackend, CounterRef};
use super::db_counter::{CounterShared, DbCounter};
use super::error::CounterError;
use crate::cache::CleanupPolicy;
use crate::clock::{Clock, SystemClock};
use crate::config::CounterConfig;
use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

/// Totals for one [`DbCounterFactory::flush_all`] cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Counters that had dirty items
    pub counters: usize,
    pub written: usize,
    pub batches: usize,
    /// Counters whose cycle stopped on a rolled-back batch
    pub failed: usize,
}

impl FlushReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

pub struct DbCounterFactory<B> {
    shared: Arc<CounterShared<B>>,
    counters: RwLock<AHashMap<String, Arc<DbCounter<B>>>>,
}

impl<B: CounterBackend> DbCounterFactory<B> {
    pub fn new(config: CounterConfig, backend: B) -> Result<Self, CounterError> {
        Self::with_clock(config, backend, SystemClock::shared())
    }

    pub fn with_clock(
        config: CounterConfig,
        backend: B,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CounterError> {
        config.validate()?;
        info!(server_id = %config.server_id, "counter factory started");
        Ok(DbCounterFactory {
            shared: Arc::new(CounterShared {
                server_id: config.server_id.clone(),
                backend,
                config,
                clock,
                dirty: Arc::new(Notify::new()),
            }),
            counters: RwLock::new(AHashMap::new()),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.shared.server_id
    }

    pub fn config(&self) -> &CounterConfig {
        &self.shared.config
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    /// Notified when any counter goes from clean to dirty.
    pub fn dirty_signal(&self) -> Arc<Notify> {
        self.shared.dirty.clone()
    }

    /// Existing counter or a new one; concurrent callers get the same handle.
    pub fn get_counter(&self, name: &str) -> Arc<DbCounter<B>> {
        if let Some(counter) = self.counters.read().get(name) {
            return counter.clone();
        }
        let mut counters = self.counters.write();
        counters
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(counter = name, server_id = %self.shared.server_id, "created counter");
                Arc::new(DbCounter::new(name.to_string(), self.shared.clone()))
            })
            .clone()
    }

    /// Registers a new counter; fails if the name is taken or the backend
    /// cannot store it.
    pub fn create_counter(&self, name: &str) -> Result<Arc<DbCounter<B>>, CounterError> {
        self.shared.backend.check_counter(CounterRef {
            name,
            server_id: &self.shared.server_id,
        })?;
        let mut counters = self.counters.write();
        if counters.contains_key(name) {
            return Err(CounterError::CounterExists(name.to_string()));
        }
        let counter = Arc::new(DbCounter::new(name.to_string(), self.shared.clone()));
        counters.insert(name.to_string(), counter.clone());
        info!(counter = name, server_id = %self.shared.server_id, "created counter");
        Ok(counter)
    }

    pub fn counter(&self, name: &str) -> Option<Arc<DbCounter<B>>> {
        self.counters.read().get(name).cloned()
    }

    pub fn counter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.counters.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Forgets a counter locally. Persisted data is left alone; flush the
    /// returned handle to keep unwritten changes.
    pub fn drop_counter(&self, name: &str) -> Option<Arc<DbCounter<B>>> {
        let dropped = self.counters.write().remove(name);
        if dropped.is_some() {
            info!(counter = name, "dropped counter");
        }
        dropped
    }

    fn snapshot(&self) -> Vec<Arc<DbCounter<B>>> {
        self.counters.read().values().cloned().collect()
    }

    /// Runs one flush cycle for every counter.
    pub fn flush_all(&self) -> FlushReport {
        let mut report = FlushReport::default();
        for counter in self.snapshot() {
            if counter.dirty_len() == 0 {
                continue;
            }
            let flushed = counter.flush();
            report.counters += 1;
            report.written += flushed.written;
            report.batches += flushed.batches;
            if flushed.failed {
                report.failed += 1;
            }
        }

        if report.counters > 0 && report.failed == report.counters {
            error!(
                server_id = %self.shared.server_id,
                counters = report.counters,
                "flush failed for every dirty counter"
            );
        } else if report.counters == 0 {
            debug!(server_id = %self.shared.server_id, "flush cycle found nothing dirty");
        } else {
            debug!(
                server_id = %self.shared.server_id,
                written = report.written,
                batches = report.batches,
                failed = report.failed,
                "flush cycle finished"
            );
        }
        report
    }

    /// Applies a cache eviction policy to every counter.
    pub fn on_gc_cleanup(&self, policy: CleanupPolicy) -> usize {
        let evicted: usize = self.snapshot().iter().map(|c| c.cleanup(policy)).sum();
        debug!(evicted, ?policy, "gc cleanup");
        evicted
    }

    /// Dirty items across all counters.
    pub fn dirty_len(&self) -> usize {
        self.snapshot().iter().map(|c| c.dirty_len()).sum()
    }
}
