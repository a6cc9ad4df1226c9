//! Ordered Store Abstraction
//!
//! The storage primitive underneath labels: named collections of
//! lexicographically ordered string keys mapping to opaque bytes.
//! Any ordered key-value medium can implement it.
//!
//! Implementations:
//! - `InMemoryOrderedStore`: For unit tests, simulations and the demo node

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Error type for ordered store operations
#[derive(Debug)]
pub enum StoreError {
    /// The backing medium cannot be reached
    Unavailable(String),
    /// Stored bytes could not be encoded or decoded
    Codec(serde_json::Error),
    /// Other errors
    Other(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
            StoreError::Codec(e) => write!(f, "Codec error: {}", e),
            StoreError::Other(msg) => write!(f, "Store error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Codec(e)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A contiguous slice of the ordered keyspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRange {
    All,
    /// Every key starting with the prefix
    Prefix(String),
    /// `first..=last`; empty when `first > last`
    Between { first: String, last: String },
}

impl KeyRange {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        KeyRange::Prefix(prefix.into())
    }

    pub fn between(first: impl Into<String>, last: impl Into<String>) -> Self {
        KeyRange::Between {
            first: first.into(),
            last: last.into(),
        }
    }

    pub fn lower(&self) -> Bound<&str> {
        match self {
            KeyRange::All => Bound::Unbounded,
            KeyRange::Prefix(p) => Bound::Included(p.as_str()),
            KeyRange::Between { first, .. } => Bound::Included(first.as_str()),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        match self {
            KeyRange::All => true,
            KeyRange::Prefix(p) => key.starts_with(p.as_str()),
            KeyRange::Between { first, last } => key >= first.as_str() && key <= last.as_str(),
        }
    }

    /// True if `key` and every key after it fall outside the range.
    pub fn is_past(&self, key: &str) -> bool {
        match self {
            KeyRange::All => false,
            KeyRange::Prefix(p) => key > p.as_str() && !key.starts_with(p.as_str()),
            KeyRange::Between { last, .. } => key > last.as_str(),
        }
    }

    /// The same range with every boundary prefixed, for co-located labels.
    pub fn within(&self, key_prefix: &str) -> KeyRange {
        if key_prefix.is_empty() {
            return self.clone();
        }
        match self {
            KeyRange::All => KeyRange::Prefix(key_prefix.to_string()),
            KeyRange::Prefix(p) => KeyRange::Prefix(format!("{}{}", key_prefix, p)),
            KeyRange::Between { first, last } => KeyRange::Between {
                first: format!("{}{}", key_prefix, first),
                last: format!("{}{}", key_prefix, last),
            },
        }
    }
}

/// Ordered key-value primitive consumed by [`Label`](super::Label).
pub trait OrderedStore: Send + Sync + 'static {
    fn get(&self, collection: &str, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Create or overwrite; returns the previous value.
    fn put(&self, collection: &str, key: &str, value: Vec<u8>) -> StoreResult<Option<Vec<u8>>>;

    /// Insert only if missing; returns the existing value untouched otherwise.
    fn put_if_absent(
        &self,
        collection: &str,
        key: &str,
        value: Vec<u8>,
    ) -> StoreResult<Option<Vec<u8>>>;

    fn remove(&self, collection: &str, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Up to `limit` entries of `range` in key order, strictly after `after`.
    fn scan(
        &self,
        collection: &str,
        range: &KeyRange,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<(String, Vec<u8>)>>;

    /// Deletes every key in `range`; returns how many were removed.
    fn remove_range(&self, collection: &str, range: &KeyRange) -> StoreResult<usize>;

    /// Names of all non-empty collections, sorted.
    fn collections(&self) -> StoreResult<Vec<String>>;
}

// ============================================================================
// InMemoryOrderedStore - For tests and simulation
// ============================================================================

/// In-memory ordered store. Clones share the same data.
#[derive(Debug, Clone)]
pub struct InMemoryOrderedStore {
    data: Arc<RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>>,
    available: Arc<AtomicBool>,
}

impl InMemoryOrderedStore {
    pub fn new() -> Self {
        InMemoryOrderedStore {
            data: Arc::new(RwLock::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate an outage: every call fails with `Unavailable` while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of keys in a collection (for testing)
    pub fn collection_len(&self, collection: &str) -> usize {
        self.data.read().get(collection).map(|c| c.len()).unwrap_or(0)
    }

    fn check(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store offline".to_string()))
        }
    }
}

impl Default for InMemoryOrderedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderedStore for InMemoryOrderedStore {
    fn get(&self, collection: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check()?;
        Ok(self
            .data
            .read()
            .get(collection)
            .and_then(|c| c.get(key))
            .cloned())
    }

    fn put(&self, collection: &str, key: &str, value: Vec<u8>) -> StoreResult<Option<Vec<u8>>> {
        self.check()?;
        let mut data = self.data.write();
        Ok(data
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), value))
    }

    fn put_if_absent(
        &self,
        collection: &str,
        key: &str,
        value: Vec<u8>,
    ) -> StoreResult<Option<Vec<u8>>> {
        self.check()?;
        let mut data = self.data.write();
        let coll = data.entry(collection.to_string()).or_default();
        if let Some(existing) = coll.get(key) {
            return Ok(Some(existing.clone()));
        }
        coll.insert(key.to_string(), value);
        Ok(None)
    }

    fn remove(&self, collection: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check()?;
        let mut data = self.data.write();
        let removed = data.get_mut(collection).and_then(|c| c.remove(key));
        if data.get(collection).map(|c| c.is_empty()).unwrap_or(false) {
            data.remove(collection);
        }
        Ok(removed)
    }

    fn scan(
        &self,
        collection: &str,
        range: &KeyRange,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<(String, Vec<u8>)>> {
        self.check()?;
        let data = self.data.read();
        let Some(coll) = data.get(collection) else {
            return Ok(Vec::new());
        };

        let lower = match after {
            Some(a) => Bound::Excluded(a),
            None => range.lower(),
        };
        Ok(coll
            .range::<str, _>((lower, Bound::Unbounded))
            .take_while(|(k, _)| !range.is_past(k))
            .filter(|(k, _)| range.contains(k))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn remove_range(&self, collection: &str, range: &KeyRange) -> StoreResult<usize> {
        self.check()?;
        let mut data = self.data.write();
        let Some(coll) = data.get_mut(collection) else {
            return Ok(0);
        };
        let before = coll.len();
        coll.retain(|k, _| !range.contains(k));
        let removed = before - coll.len();
        if coll.is_empty() {
            data.remove(collection);
        }
        Ok(removed)
    }

    fn collections(&self) -> StoreResult<Vec<String>> {
        self.check()?;
        let mut names: Vec<String> = self.data.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
