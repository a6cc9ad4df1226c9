//! Label Counter Strategy
//!
//! Keeps each node's contribution to a counter in its own label:
//!
//! ```text
//! LabelSet "counters"
//!   ├─ orders.node-1 ──► { a: 5, b: 1 }
//!   ├─ orders.node-2 ──► { a: 3 }
//!   └─ visits.node-1 ──► { home: 42 }
//! ```
//!
//! A node writes only `{counter}.{node}`. Reads discover the sibling
//! labels of a counter through the label registry and add up the peers'
//! values into `hold`.

use crate::clock::Clock;
use crate::config::CounterConfig;
use crate::counter::{
    BackendError, BackendResult, CounterBackend, CounterBatch, CounterError, CounterItem,
    CounterRef, DbCounterFactory,
};
use crate::label::{
    normalize_name, KeyRange, Label, LabelElement, LabelError, LabelSet, OrderedStore, PutOption,
    DEFAULT_PAGE_SIZE,
};
use ahash::AHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Label set used when none is named.
pub const DEFAULT_SET_NAME: &str = "counters";

const COUNTER_ATTR: &str = "counter";
const NODE_ATTR: &str = "node";

/// One node's persisted contribution to one counter id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    pub id: String,
    pub value: i64,
}

impl LabelElement for CounterRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Counter backend over a [`LabelSet`] of per-node labels.
pub struct LabelCounterBackend {
    labels: LabelSet<CounterRecord>,
    own: RwLock<AHashMap<String, Label<CounterRecord>>>,
}

/// Counter factory whose counters persist into labels.
pub type LabelCounterFactory = DbCounterFactory<LabelCounterBackend>;

struct Sibling {
    node: String,
    label: Label<CounterRecord>,
}

impl LabelCounterBackend {
    /// Label set `set_name` written by `server_id`, spread over `shards`
    /// collections (0 = one collection per label).
    pub fn new(
        store: Arc<dyn OrderedStore>,
        set_name: &str,
        server_id: &str,
        shards: u32,
    ) -> BackendResult<Self> {
        let labels = LabelSet::new(store, set_name, server_id)?.with_shards(shards);
        Ok(Self::with_labels(labels))
    }

    pub fn with_labels(labels: LabelSet<CounterRecord>) -> Self {
        LabelCounterBackend {
            labels,
            own: RwLock::new(AHashMap::new()),
        }
    }

    /// Stamps element metadata from `clock` instead of the system clock.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self::with_labels(self.labels.with_clock(clock))
    }

    pub fn labels(&self) -> &LabelSet<CounterRecord> {
        &self.labels
    }

    /// Name of the label holding `server_id`'s share of `counter`.
    pub fn label_name(counter: &str, server_id: &str) -> String {
        format!("{}.{}", counter, server_id)
    }

    /// Label name for `counter`; fails unless normalization leaves it as is,
    /// so distinct counters never share a label.
    fn checked_label_name(counter: CounterRef<'_>) -> BackendResult<String> {
        let name = Self::label_name(counter.name, counter.server_id);
        if counter.name.is_empty() || normalize_name(&name)? != name {
            return Err(LabelError::InvalidName(counter.name.to_string()).into());
        }
        Ok(name)
    }

    fn own_label(&self, counter: CounterRef<'_>) -> BackendResult<Label<CounterRecord>> {
        if let Some(label) = self.own.read().get(counter.name) {
            return Ok(label.clone());
        }
        let name = Self::checked_label_name(counter)?;

        let attributes = BTreeMap::from([
            (COUNTER_ATTR.to_string(), counter.name.to_string()),
            (NODE_ATTR.to_string(), counter.server_id.to_string()),
        ]);
        let label = self
            .labels
            .open_label_with(&name, attributes)?;
        self.own
            .write()
            .entry(counter.name.to_string())
            .or_insert(label.clone());
        Ok(label)
    }

    /// Every node's label for `counter`, this node's included.
    fn siblings(&self, counter: CounterRef<'_>) -> BackendResult<Vec<Sibling>> {
        Self::checked_label_name(counter)?;
        let prefix = format!("{}.", counter.name);
        let mut siblings = Vec::new();
        for info in self.labels.label_infos(&prefix)? {
            // Node ids have no dots: "orders.eu.node-1" belongs to "orders.eu".
            let Some((name, node)) = info.name.rsplit_once('.') else {
                continue;
            };
            if name != counter.name {
                continue;
            }
            if let Some(label) = self.labels.get_label(&info.name)? {
                siblings.push(Sibling {
                    node: node.to_string(),
                    label,
                });
            }
        }
        debug!(counter = counter.name, siblings = siblings.len(), "discovered counter labels");
        Ok(siblings)
    }

    fn record(item: &CounterItem) -> CounterRecord {
        CounterRecord {
            id: item.id().to_string(),
            value: item.value(),
        }
    }
}

impl CounterBackend for LabelCounterBackend {
    fn check_counter(&self, counter: CounterRef<'_>) -> BackendResult<()> {
        Self::checked_label_name(counter).map(|_| ())
    }

    fn load(&self, counter: CounterRef<'_>, id: &str) -> BackendResult<Option<CounterItem>> {
        let mut found = false;
        let mut value = 0i64;
        let mut hold = 0i64;
        for sibling in self.siblings(counter)? {
            let Some(record) = sibling.label.get(id)? else {
                continue;
            };
            found = true;
            if sibling.node == counter.server_id {
                value = record.value;
            } else {
                hold = hold.wrapping_add(record.value);
            }
        }
        Ok(found.then(|| CounterItem::with_parts(id, value, hold)))
    }

    fn bulk_update(
        &self,
        counter: CounterRef<'_>,
        batch: &mut CounterBatch<'_>,
    ) -> BackendResult<()> {
        let label = self.own_label(counter)?;
        // A failed put aborts the rest; the caller rolls the whole batch back.
        while let Some(entry) = batch.next() {
            label.put(Self::record(&entry.value), PutOption::Force)?;
        }
        Ok(())
    }

    fn insert_new(&self, counter: CounterRef<'_>, item: &CounterItem) -> BackendResult<()> {
        self.own_label(counter)?
            .put(Self::record(item), PutOption::Force)?;
        Ok(())
    }

    fn scan(&self, counter: CounterRef<'_>, range: &KeyRange) -> BackendResult<Vec<CounterItem>> {
        let mut totals: BTreeMap<String, (i64, i64)> = BTreeMap::new();
        let mut seen_nodes = BTreeSet::new();
        for sibling in self.siblings(counter)? {
            if !seen_nodes.insert(sibling.node.clone()) {
                continue;
            }
            let own = sibling.node == counter.server_id;
            for record in sibling.label.scan(range, DEFAULT_PAGE_SIZE) {
                let record = record?;
                let (value, hold) = totals.entry(record.id).or_insert((0, 0));
                if own {
                    *value = record.value;
                } else {
                    *hold = hold.wrapping_add(record.value);
                }
            }
        }
        Ok(totals
            .into_iter()
            .map(|(id, (value, hold))| CounterItem::with_parts(id, value, hold))
            .collect())
    }
}

impl DbCounterFactory<LabelCounterBackend> {
    /// Factory over `store`, using `config.server_id` as the writer and
    /// `config.label_shards` for the label layout.
    pub fn with_label_store(
        store: Arc<dyn OrderedStore>,
        set_name: &str,
        config: CounterConfig,
    ) -> Result<Self, CounterError> {
        config.validate()?;
        let backend =
            LabelCounterBackend::new(store, set_name, &config.server_id, config.label_shards)?;
        Self::new(config, backend)
    }
}
