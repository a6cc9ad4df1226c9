//! CounterItem - one counter id as seen by one node.
//!
//! `value` is this node's own contribution, the only part the node ever
//! writes. `hold` is the sum of every peer's contribution as of the last
//! resync. The observed total is `value + hold`.

use crate::cache::{CacheValue, Updater};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CounterItem {
    id: String,
    value: i64,
    hold: i64,
}

impl CounterItem {
    pub fn new(id: impl Into<String>) -> Self {
        CounterItem {
            id: id.into(),
            value: 0,
            hold: 0,
        }
    }

    pub fn with_parts(id: impl Into<String>, value: i64, hold: i64) -> Self {
        CounterItem {
            id: id.into(),
            value,
            hold,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// This node's contribution.
    pub fn value(&self) -> i64 {
        self.value
    }

    /// Peers' contribution at the last resync.
    pub fn hold(&self) -> i64 {
        self.hold
    }

    /// Observed total.
    #[inline]
    pub fn get(&self) -> i64 {
        self.value.wrapping_add(self.hold)
    }

    pub fn inc(&mut self) -> i64 {
        self.add_and_get(1)
    }

    pub fn dec(&mut self) -> i64 {
        self.add_and_get(-1)
    }

    /// Adds `delta` to the local contribution and returns the new total.
    #[inline]
    pub fn add_and_get(&mut self, delta: i64) -> i64 {
        self.value = self.value.wrapping_add(delta);
        self.get()
    }

    /// Makes the observed total equal `total` by adjusting the local
    /// contribution only.
    pub fn set(&mut self, total: i64) {
        self.value = total.wrapping_sub(self.hold);
    }

    /// Absorbs a freshly observed global total by recomputing `hold`,
    /// leaving `value` alone. Returns true if `hold` changed.
    pub fn sync_total(&mut self, total: i64) -> bool {
        let hold = total.wrapping_sub(self.value);
        let changed = hold != self.hold;
        self.hold = hold;
        changed
    }
}

impl CacheValue for CounterItem {
    /// A reloaded item carries the persisted local value plus the freshly
    /// aggregated peers. Only the peer part is adopted; local writes that
    /// have not been flushed yet are kept.
    fn refresh(&mut self, fresh: Self) -> bool {
        self.sync_total(fresh.hold.wrapping_add(self.value))
    }
}

/// Adds a delta; returns the new total.
pub(crate) struct Adder(pub(crate) i64);

impl Updater<String, CounterItem> for Adder {
    type Output = i64;

    fn create(&self, key: &String) -> CounterItem {
        CounterItem::new(key.clone())
    }

    fn apply(self, item: &mut CounterItem) -> i64 {
        item.add_and_get(self.0)
    }
}

/// Forces the observed total; returns it.
pub(crate) struct Setter(pub(crate) i64);

impl Updater<String, CounterItem> for Setter {
    type Output = i64;

    fn create(&self, key: &String) -> CounterItem {
        CounterItem::new(key.clone())
    }

    fn apply(self, item: &mut CounterItem) -> i64 {
        item.set(self.0);
        item.get()
    }
}

/// Sets the total only if it currently equals `expect`.
pub(crate) struct CompareAndSet {
    pub(crate) expect: i64,
    pub(crate) value: i64,
}

impl Updater<String, CounterItem> for CompareAndSet {
    type Output = bool;

    fn create(&self, key: &String) -> CounterItem {
        CounterItem::new(key.clone())
    }

    fn apply(self, item: &mut CounterItem) -> bool {
        if item.get() != self.expect {
            return false;
        }
        item.set(self.value);
        true
    }
}
