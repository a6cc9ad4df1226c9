//! Column strategy: one row per counter id, one column per node.
//!
//! ```text
//! counter ──► id ──► { node-1: value, node-2: value, ... }
//! ```
//!
//! A node only ever writes its own column. `load` reports the node's
//! column as `value` and the sum of every other column as `hold`. Clones
//! share the same table, so several factories can act as separate nodes
//! over one backend.

use super::backend::{CounterBackend, CounterBatch, CounterRef};
use super::error::BackendResult;
use super::item::CounterItem;
use crate::label::KeyRange;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Row = BTreeMap<String, i64>;
type Table = HashMap<String, BTreeMap<String, Row>>;

#[derive(Debug, Clone, Default)]
pub struct ColumnCounterBackend {
    table: Arc<RwLock<Table>>,
    writes: Arc<AtomicU64>,
}

impl ColumnCounterBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Column values written so far, across every node.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// One node's stored column (for testing)
    pub fn column(&self, counter: &str, id: &str, node: &str) -> Option<i64> {
        self.table
            .read()
            .get(counter)
            .and_then(|rows| rows.get(id))
            .and_then(|row| row.get(node))
            .copied()
    }

    /// Sum of every column of a row.
    pub fn total(&self, counter: &str, id: &str) -> i64 {
        self.table
            .read()
            .get(counter)
            .and_then(|rows| rows.get(id))
            .map(|row| row.values().fold(0i64, |acc, v| acc.wrapping_add(*v)))
            .unwrap_or(0)
    }

    fn item_for(id: &str, row: &Row, server_id: &str) -> CounterItem {
        let mut value = 0i64;
        let mut hold = 0i64;
        for (node, v) in row {
            if node == server_id {
                value = *v;
            } else {
                hold = hold.wrapping_add(*v);
            }
        }
        CounterItem::with_parts(id, value, hold)
    }

    fn write_column(table: &mut Table, counter: CounterRef<'_>, item: &CounterItem) {
        table
            .entry(counter.name.to_string())
            .or_default()
            .entry(item.id().to_string())
            .or_default()
            .insert(counter.server_id.to_string(), item.value());
    }
}

impl CounterBackend for ColumnCounterBackend {
    fn load(&self, counter: CounterRef<'_>, id: &str) -> BackendResult<Option<CounterItem>> {
        Ok(self
            .table
            .read()
            .get(counter.name)
            .and_then(|rows| rows.get(id))
            .map(|row| Self::item_for(id, row, counter.server_id)))
    }

    fn bulk_update(
        &self,
        counter: CounterRef<'_>,
        batch: &mut CounterBatch<'_>,
    ) -> BackendResult<()> {
        let mut table = self.table.write();
        let mut written = 0u64;
        while let Some(entry) = batch.next() {
            Self::write_column(&mut table, counter, &entry.value);
            written += 1;
        }
        self.writes.fetch_add(written, Ordering::Relaxed);
        Ok(())
    }

    fn insert_new(&self, counter: CounterRef<'_>, item: &CounterItem) -> BackendResult<()> {
        Self::write_column(&mut self.table.write(), counter, item);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn scan(&self, counter: CounterRef<'_>, range: &KeyRange) -> BackendResult<Vec<CounterItem>> {
        let table = self.table.read();
        let Some(rows) = table.get(counter.name) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .range::<str, _>((range.lower(), Bound::Unbounded))
            .take_while(|(id, _)| !range.is_past(id))
            .filter(|(id, _)| range.contains(id))
            .map(|(id, row)| Self::item_for(id, row, counter.server_id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE_1: CounterRef<'static> = CounterRef {
        name: "orders",
        server_id: "node-1",
    };
    const NODE_2: CounterRef<'static> = CounterRef {
        name: "orders",
        server_id: "node-2",
    };

    #[test]
    fn test_load_splits_own_column_from_peers() {
        let backend = ColumnCounterBackend::new();
        backend
            .insert_new(NODE_1, &CounterItem::with_parts("a", 5, 0))
            .unwrap();
        backend
            .insert_new(NODE_2, &CounterItem::with_parts("a", 3, 0))
            .unwrap();

        let seen_by_1 = backend.load(NODE_1, "a").unwrap().unwrap();
        assert_eq!((seen_by_1.value(), seen_by_1.hold()), (5, 3));
        let seen_by_2 = backend.load(NODE_2, "a").unwrap().unwrap();
        assert_eq!((seen_by_2.value(), seen_by_2.hold()), (3, 5));
        assert_eq!(backend.total("orders", "a"), 8);
    }

    #[test]
    fn test_load_missing() {
        let backend = ColumnCounterBackend::new();
        assert!(backend.load(NODE_1, "a").unwrap().is_none());
    }

    #[test]
    fn test_peer_only_row_has_zero_value() {
        let backend = ColumnCounterBackend::new();
        backend
            .insert_new(NODE_2, &CounterItem::with_parts("a", 4, 0))
            .unwrap();
        let item = backend.load(NODE_1, "a").unwrap().unwrap();
        assert_eq!((item.value(), item.hold()), (0, 4));
    }

    #[test]
    fn test_scan_range() {
        let backend = ColumnCounterBackend::new();
        for id in ["a", "b", "c"] {
            backend
                .insert_new(NODE_1, &CounterItem::with_parts(id, 1, 0))
                .unwrap();
        }
        let items = backend.scan(NODE_1, &KeyRange::between("b", "c")).unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.id().to_string()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }
}
