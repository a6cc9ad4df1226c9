//! Counter Backend Contract
//!
//! A backend persists each node's own contribution per counter id and
//! reports every other node's contribution back as `hold` on load.
//!
//! Implementations:
//! - `ColumnCounterBackend`: one row per id, one column per node
//! - `LabelCounterBackend`: one label per node over an ordered store
//! - `SimulatedBackend`: fault-injecting wrapper for tests

use super::error::BackendResult;
use super::item::CounterItem;
use crate::cache::DirtyData;
use crate::label::KeyRange;

/// Batch of dirty counter items handed to [`CounterBackend::bulk_update`].
pub type CounterBatch<'a> = DirtyData<'a, String, CounterItem>;

/// Identifies the counter and the writing node for a backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterRef<'a> {
    pub name: &'a str,
    pub server_id: &'a str,
}

pub trait CounterBackend: Send + Sync + 'static {
    /// Returns `value` = this node's persisted contribution and
    /// `hold` = sum of every other node's, or `None` if no node has
    /// written the id.
    fn load(&self, counter: CounterRef<'_>, id: &str) -> BackendResult<Option<CounterItem>>;

    /// Writes this node's `value` for every entry of an already-begun
    /// batch. Must fail (and write nothing more) on a partial match so
    /// the caller rolls the whole batch back.
    fn bulk_update(&self, counter: CounterRef<'_>, batch: &mut CounterBatch<'_>)
        -> BackendResult<()>;

    /// Persists an item created on this node.
    fn insert_new(&self, counter: CounterRef<'_>, item: &CounterItem) -> BackendResult<()>;

    /// Items whose id falls in `range`, in id order, aggregated like `load`.
    fn scan(&self, counter: CounterRef<'_>, range: &KeyRange) -> BackendResult<Vec<CounterItem>>;

    /// Rejects a counter this backend cannot store apart from others.
    fn check_counter(&self, _counter: CounterRef<'_>) -> BackendResult<()> {
        Ok(())
    }
}

impl<B: CounterBackend> CounterBackend for std::sync::Arc<B> {
    fn load(&self, counter: CounterRef<'_>, id: &str) -> BackendResult<Option<CounterItem>> {
        (**self).load(counter, id)
    }

    fn bulk_update(
        &self,
        counter: CounterRef<'_>,
        batch: &mut CounterBatch<'_>,
    ) -> BackendResult<()> {
        (**self).bulk_update(counter, batch)
    }

    fn insert_new(&self, counter: CounterRef<'_>, item: &CounterItem) -> BackendResult<()> {
        (**self).insert_new(counter, item)
    }

    fn scan(&self, counter: CounterRef<'_>, range: &KeyRange) -> BackendResult<Vec<CounterItem>> {
        (**self).scan(counter, range)
    }

    fn check_counter(&self, counter: CounterRef<'_>) -> BackendResult<()> {
        (**self).check_counter(counter)
    }
}
