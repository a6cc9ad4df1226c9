//! Write-Back Cache
//!
//! Keyed cache with load-on-miss, merge-on-write, dirty tracking and
//! batched flush. Mutations land in memory immediately; a flusher later
//! drains the dirty chain in bounded batches and either commits or rolls
//! back each batch after attempting the backend write.
//!
//! ## Architecture
//!
//! ```text
//! update(key) ──► shard[hash(key)] ──► Entry (Mutex<V>, generation)
//!                                          │
//! mark_updated(key) ──────────────► DirtyChain (FIFO, in-flight set)
//!                                          │
//! get_dirty_data(copy, max) ◄──────────────┘
//!        │
//!        ▼
//!   DirtyData ──► backend write ──► commit | rollback | abort
//! ```
//!
//! ## Locking
//!
//! Lock order is `gate → chain → shard → entry`. No lock is held while a
//! loader or a backend write runs. The gate is only taken for writing by a
//! locked (`copy = false`) batch, which blocks writers until it finishes.

mod dirty;
mod entry;

#[cfg(test)]
mod tests;

pub use dirty::{DirtyData, DirtyEntry};

use crate::clock::{Clock, Millis};
use ahash::{AHashMap, AHashSet, RandomState};
use entry::Entry;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DEFAULT_SHARDS: usize = 16;

/// Values stored in a [`WriteBackCache`].
pub trait CacheValue: Clone + Send + 'static {
    /// Folds a freshly loaded copy into the cached value after expiry.
    ///
    /// Returns true if the cached value changed.
    fn refresh(&mut self, fresh: Self) -> bool;
}

/// Merge function applied by [`WriteBackCache::update`].
pub trait Updater<K, V> {
    type Output;

    /// Builds the initial value when the key is not cached.
    fn create(&self, key: &K) -> V;

    /// Mutates the current value in place.
    fn apply(self, value: &mut V) -> Self::Output;
}

/// Outcome of [`WriteBackCache::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Updated<R> {
    pub output: R,
    /// True if this call inserted the entry.
    pub created: bool,
    /// Entry generation after the mutation.
    pub generation: u64,
}

/// Result of a closure passed to [`WriteBackCache::modify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change<R> {
    Updated(R),
    Unchanged(R),
}

/// Eviction policy for [`WriteBackCache::cleanup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Drop expired absent markers only.
    Expired,
    /// Evict least-recently-used clean entries until at most `keep` remain.
    Trim { keep: usize },
    /// Evict every clean entry and every absent marker.
    Clear,
}

/// Cache tuning knobs
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a `None` load result is remembered
    pub absent_ttl: Duration,
    /// Soft entry limit; 0 disables capacity eviction
    pub capacity: usize,
    /// Number of key shards (rounded up to 1)
    pub shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            absent_ttl: Duration::from_secs(1),
            capacity: 100_000,
            shards: DEFAULT_SHARDS,
        }
    }
}

/// Point-in-time counters for one cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub refreshes: u64,
    pub absent_hits: u64,
    pub evictions: u64,
    pub committed: u64,
    pub rolled_back: u64,
}

#[derive(Default)]
struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    refreshes: AtomicU64,
    absent_hits: AtomicU64,
    evictions: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

impl StatCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            absent_hits: self.absent_hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
        }
    }
}

/// Keys pending flush, in first-dirtied order
struct DirtyChain<K> {
    order: VecDeque<K>,
    queued: AHashSet<K>,
    in_flight: AHashSet<K>,
}

impl<K: Eq + Hash + Clone> DirtyChain<K> {
    fn new() -> Self {
        DirtyChain {
            order: VecDeque::new(),
            queued: AHashSet::new(),
            in_flight: AHashSet::new(),
        }
    }

    fn is_pending(&self, key: &K) -> bool {
        self.queued.contains(key) || self.in_flight.contains(key)
    }

    /// Enqueue at the tail. Returns true if the chain was empty before.
    fn push_back(&mut self, key: K) -> bool {
        let was_empty = self.order.is_empty();
        if self.queued.insert(key.clone()) {
            self.order.push_back(key);
            return was_empty;
        }
        false
    }

    fn push_front(&mut self, key: K) {
        if self.queued.insert(key.clone()) {
            self.order.push_front(key);
        }
    }

    fn take(&mut self, max: usize) -> Vec<K> {
        let n = max.min(self.order.len());
        let mut keys = Vec::with_capacity(n);
        for key in self.order.drain(..n) {
            self.queued.remove(&key);
            self.in_flight.insert(key.clone());
            keys.push(key);
        }
        keys
    }

    fn clear_queued(&mut self) {
        self.order.clear();
        self.queued.clear();
    }
}

/// How a [`DirtyData`] batch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchOutcome {
    Commit,
    Rollback,
    Abort,
}

type DirtyListener = Arc<dyn Fn() + Send + Sync>;

/// Write-back cache keyed by `K`.
pub struct WriteBackCache<K, V> {
    shards: Box<[RwLock<AHashMap<K, Arc<Entry<V>>>>]>,
    hasher: RandomState,
    absent: Mutex<AHashMap<K, Millis>>,
    chain: Mutex<DirtyChain<K>>,
    gate: RwLock<()>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    stats: StatCounters,
    on_dirty: Option<DirtyListener>,
}

impl<K, V> WriteBackCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: CacheValue,
{
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let shard_count = config.shards.max(1);
        let shards = (0..shard_count)
            .map(|_| RwLock::new(AHashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        WriteBackCache {
            shards,
            hasher: RandomState::new(),
            absent: Mutex::new(AHashMap::new()),
            chain: Mutex::new(DirtyChain::new()),
            gate: RwLock::new(()),
            clock,
            config,
            stats: StatCounters::default(),
            on_dirty: None,
        }
    }

    /// Registers a callback fired when the dirty chain goes from empty to
    /// non-empty.
    pub fn with_dirty_listener(mut self, listener: DirtyListener) -> Self {
        self.on_dirty = Some(listener);
        self
    }

    #[inline]
    fn shard(&self, key: &K) -> &RwLock<AHashMap<K, Arc<Entry<V>>>> {
        let idx = (self.hasher.hash_one(key) as usize) % self.shards.len();
        &self.shards[idx]
    }

    fn lookup(&self, key: &K) -> Option<Arc<Entry<V>>> {
        self.shard(key).read().get(key).cloned()
    }

    fn notify_dirty(&self) {
        if let Some(listener) = &self.on_dirty {
            listener();
        }
    }

    /// Returns a copy of the cached value, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.lookup(key)?;
        entry.touch(self.clock.now());
        StatCounters::bump(&self.stats.hits, 1);
        let value = entry.value.lock().clone();
        Some(value)
    }

    /// Returns the cached value, loading it on a miss or after `expiry`.
    ///
    /// A `None` load result is remembered as an absent marker for the
    /// configured TTL. A loader error is returned as-is and leaves neither
    /// an entry nor a marker behind.
    pub fn get_or_load<F, E>(&self, key: &K, loader: F, expiry: Duration) -> Result<Option<V>, E>
    where
        F: FnOnce(&K) -> Result<Option<V>, E>,
    {
        let now = self.clock.now();
        let existing = self.lookup(key);

        if let Some(entry) = &existing {
            entry.touch(now);
            if !self.clock.has_elapsed(entry.loaded_at(), expiry) {
                StatCounters::bump(&self.stats.hits, 1);
                let value = entry.value.lock().clone();
                return Ok(Some(value));
            }
        } else if self.absent_marker_live(key, now) {
            StatCounters::bump(&self.stats.absent_hits, 1);
            return Ok(None);
        }

        StatCounters::bump(&self.stats.misses, 1);
        StatCounters::bump(&self.stats.loads, 1);
        let loaded = loader(key)?;
        let now = self.clock.now();

        match (existing, loaded) {
            (Some(entry), Some(fresh)) => {
                let mut value = entry.value.lock();
                if value.refresh(fresh) {
                    StatCounters::bump(&self.stats.refreshes, 1);
                }
                entry.set_loaded_at(now);
                Ok(Some(value.clone()))
            }
            (Some(entry), None) => {
                // Known locally but not yet persisted; keep the local copy.
                entry.set_loaded_at(now);
                let value = entry.value.lock().clone();
                Ok(Some(value))
            }
            (None, Some(fresh)) => Ok(Some(self.insert_loaded(key, fresh, now))),
            (None, None) => {
                if let Some(entry) = self.lookup(key) {
                    let value = entry.value.lock().clone();
                    return Ok(Some(value));
                }
                let expires_at = now + self.config.absent_ttl;
                self.absent.lock().insert(key.clone(), expires_at);
                debug!("cached absent marker");
                Ok(None)
            }
        }
    }

    fn absent_marker_live(&self, key: &K, now: Millis) -> bool {
        let mut absent = self.absent.lock();
        match absent.get(key) {
            Some(expires_at) if *expires_at > now => true,
            Some(_) => {
                absent.remove(key);
                false
            }
            None => false,
        }
    }

    fn insert_loaded(&self, key: &K, fresh: V, now: Millis) -> V {
        let value = {
            let mut shard = self.shard(key).write();
            let cached = shard.get(key).map(|entry| entry.value.lock().clone());
            match cached {
                // Raced with another loader or writer; theirs is at least as fresh.
                Some(value) => value,
                None => {
                    let value = fresh.clone();
                    shard.insert(key.clone(), Arc::new(Entry::new(fresh, now)));
                    value
                }
            }
        };
        self.absent.lock().remove(key);
        self.enforce_capacity();
        value
    }

    /// Fetches or creates the entry for `key` and applies `updater` under
    /// the entry lock.
    pub fn update<U>(&self, key: &K, updater: U) -> Updated<U::Output>
    where
        U: Updater<K, V>,
    {
        self.update_or_insert(key, None, updater)
    }

    /// Like [`update`](Self::update), but an uncached key starts from
    /// `seed` when one is given.
    ///
    /// `seed` is the value the caller already loaded; it covers an entry
    /// that was evicted between the load and this call. A seeded insert is
    /// not reported as `created`.
    pub fn update_or_insert<U>(&self, key: &K, seed: Option<V>, updater: U) -> Updated<U::Output>
    where
        U: Updater<K, V>,
    {
        let _gate = self.gate.read();
        let now = self.clock.now();

        {
            let shard = self.shard(key).read();
            if let Some(entry) = shard.get(key) {
                let (output, generation) = Self::apply_update(entry, now, updater);
                return Updated {
                    output,
                    created: false,
                    generation,
                };
            }
        }

        let (updated, inserted) = {
            let mut shard = self.shard(key).write();
            let (entry, inserted, created) = match shard.get(key) {
                Some(entry) => (entry.clone(), false, false),
                None => {
                    let (initial, created) = match seed {
                        Some(value) => (value, false),
                        None => (updater.create(key), true),
                    };
                    let entry = Arc::new(Entry::new(initial, now));
                    shard.insert(key.clone(), entry.clone());
                    (entry, true, created)
                }
            };
            let (output, generation) = Self::apply_update(&entry, now, updater);
            (
                Updated {
                    output,
                    created,
                    generation,
                },
                inserted,
            )
        };

        if inserted {
            self.absent.lock().remove(key);
            self.enforce_capacity();
        }
        updated
    }

    fn apply_update<U>(entry: &Entry<V>, now: Millis, updater: U) -> (U::Output, u64)
    where
        U: Updater<K, V>,
    {
        entry.touch(now);
        let mut value = entry.value.lock();
        let output = updater.apply(&mut value);
        (output, entry.bump_generation())
    }

    fn apply_change<R, F>(entry: &Entry<V>, now: Millis, f: F) -> R
    where
        F: FnOnce(&mut V) -> Change<R>,
    {
        entry.touch(now);
        let mut value = entry.value.lock();
        match f(&mut value) {
            Change::Updated(r) => {
                entry.bump_generation();
                r
            }
            Change::Unchanged(r) => r,
        }
    }

    /// Runs `f` against an existing entry under its lock.
    ///
    /// Returns `None` if the key is not cached. `Change::Updated` bumps the
    /// entry generation so an in-flight batch will not mark it clean.
    pub fn modify<R, F>(&self, key: &K, f: F) -> Option<R>
    where
        F: FnOnce(&mut V) -> Change<R>,
    {
        let _gate = self.gate.read();
        let shard = self.shard(key).read();
        let entry = shard.get(key)?;
        Some(Self::apply_change(entry, self.clock.now(), f))
    }

    /// Runs `f` against the entry for `key`, inserting `seed` first if the
    /// key is not cached.
    pub fn modify_or_insert<R, F>(&self, key: &K, seed: V, f: F) -> R
    where
        F: FnOnce(&mut V) -> Change<R>,
    {
        let _gate = self.gate.read();
        let now = self.clock.now();

        {
            let shard = self.shard(key).read();
            if let Some(entry) = shard.get(key) {
                return Self::apply_change(entry, now, f);
            }
        }

        let (output, inserted) = {
            let mut shard = self.shard(key).write();
            let inserted = !shard.contains_key(key);
            let entry = shard
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Entry::new(seed, now)));
            (Self::apply_change(entry, now, f), inserted)
        };

        if inserted {
            self.absent.lock().remove(key);
            self.enforce_capacity();
        }
        output
    }

    /// Queues a mutated entry on the dirty chain.
    ///
    /// Returns false if the key is not cached.
    pub fn mark_updated(&self, key: &K) -> bool {
        let _gate = self.gate.read();
        if self.lookup(key).is_none() {
            return false;
        }
        let became_non_empty = {
            let mut chain = self.chain.lock();
            if chain.in_flight.contains(key) {
                false
            } else {
                chain.push_back(key.clone())
            }
        };
        if became_non_empty {
            self.notify_dirty();
        }
        true
    }

    /// Records that `generation` of `key` reached the backend outside a batch.
    pub fn mark_persisted(&self, key: &K, generation: u64) {
        if let Some(entry) = self.lookup(key) {
            entry.commit_generation(generation);
        }
    }

    /// Current mutation generation of a cached key.
    pub fn generation(&self, key: &K) -> Option<u64> {
        self.lookup(key).map(|e| e.generation())
    }

    /// Returns true if `key` has writes that have not been committed.
    pub fn is_dirty(&self, key: &K) -> bool {
        if self.chain.lock().is_pending(key) {
            return true;
        }
        self.lookup(key).map(|e| !e.is_clean()).unwrap_or(false)
    }

    /// Detaches up to `max_batch` dirty entries for flushing.
    ///
    /// With `copy = true` writers keep mutating the live cache while the
    /// batch is written; a key mutated meanwhile is re-queued on commit.
    /// With `copy = false` the batch holds the write gate until it is
    /// finished, so writers block for the duration of the flush.
    pub fn get_dirty_data(&self, copy: bool, max_batch: usize) -> DirtyData<'_, K, V> {
        let gate = if copy { None } else { Some(self.gate.write()) };

        let keys = self.chain.lock().take(max_batch);
        let mut entries = Vec::with_capacity(keys.len());
        let mut gone = Vec::new();
        for key in keys {
            match self.lookup(&key) {
                Some(entry) => {
                    let (value, generation) = entry.snapshot();
                    entries.push(DirtyEntry::new(key, value, generation));
                }
                None => gone.push(key),
            }
        }
        if !gone.is_empty() {
            let mut chain = self.chain.lock();
            for key in &gone {
                chain.in_flight.remove(key);
            }
        }

        DirtyData::new(self, entries, copy, gate)
    }

    pub(crate) fn finish_batch(&self, entries: &[DirtyEntry<K, V>], outcome: BatchOutcome) {
        if entries.is_empty() {
            return;
        }
        let became_non_empty = {
            let mut chain = self.chain.lock();
            let was_empty = chain.order.is_empty();
            match outcome {
                BatchOutcome::Commit => {
                    for e in entries {
                        chain.in_flight.remove(&e.key);
                        if let Some(entry) = self.lookup(&e.key) {
                            entry.commit_generation(e.generation());
                            if entry.generation() > e.generation() {
                                chain.push_back(e.key.clone());
                            }
                        }
                    }
                    StatCounters::bump(&self.stats.committed, entries.len() as u64);
                }
                BatchOutcome::Rollback | BatchOutcome::Abort => {
                    for e in entries.iter().rev() {
                        chain.in_flight.remove(&e.key);
                        if self.lookup(&e.key).is_some() {
                            chain.push_front(e.key.clone());
                        }
                    }
                    if outcome == BatchOutcome::Rollback {
                        StatCounters::bump(&self.stats.rolled_back, entries.len() as u64);
                    }
                }
            }
            was_empty && !chain.order.is_empty()
        };
        if became_non_empty {
            self.notify_dirty();
        }
    }

    /// Drops a clean entry. Dirty or in-flight entries are kept.
    pub fn invalidate(&self, key: &K) -> bool {
        let chain = self.chain.lock();
        if chain.is_pending(key) {
            return false;
        }
        let mut shard = self.shard(key).write();
        match shard.get(key) {
            Some(entry) if entry.is_clean() => {
                shard.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Clears every entry, absent marker and queued key.
    ///
    /// Batches already in flight finish normally but nothing is re-queued.
    pub fn remove_all(&self) {
        let _gate = self.gate.read();
        {
            let mut chain = self.chain.lock();
            chain.clear_queued();
            for shard in self.shards.iter() {
                shard.write().clear();
            }
        }
        self.absent.lock().clear();
    }

    /// Applies an eviction policy. Returns the number of entries evicted.
    pub fn cleanup(&self, policy: CleanupPolicy) -> usize {
        let now = self.clock.now();
        self.absent.lock().retain(|_, expires_at| *expires_at > now);
        match policy {
            CleanupPolicy::Expired => 0,
            CleanupPolicy::Trim { keep } => self.evict_clean(keep),
            CleanupPolicy::Clear => {
                self.absent.lock().clear();
                self.evict_clean(0)
            }
        }
    }

    fn enforce_capacity(&self) {
        let capacity = self.config.capacity;
        if capacity > 0 && self.len() > capacity {
            // Low watermark at 90% so a sweep is not repeated on every insert.
            self.evict_clean(capacity - capacity / 10);
        }
    }

    /// Evicts least-recently-used clean entries until `keep` remain.
    ///
    /// Runs without the chain lock. An entry is only removed if it is still
    /// clean under its shard write lock; a clean key left on the chain is
    /// dropped by the next [`get_dirty_data`](Self::get_dirty_data).
    fn evict_clean(&self, keep: usize) -> usize {
        let total = self.len();
        if total <= keep {
            return 0;
        }
        let excess = total - keep;

        let mut candidates: Vec<(u64, K)> = Vec::new();
        for shard in self.shards.iter() {
            for (key, entry) in shard.read().iter() {
                if entry.is_clean() {
                    candidates.push((entry.last_access(), key.clone()));
                }
            }
        }
        if candidates.len() > excess {
            candidates.select_nth_unstable_by_key(excess, |(access, _)| *access);
            candidates.truncate(excess);
        }

        let mut evicted = 0;
        for (_, key) in candidates {
            let mut shard = self.shard(&key).write();
            // Still clean under the shard write lock: no writer is inside.
            if shard.get(&key).map(|e| e.is_clean()).unwrap_or(false) {
                shard.remove(&key);
                evicted += 1;
            }
        }

        if evicted > 0 {
            StatCounters::bump(&self.stats.evictions, evicted as u64);
            debug!(evicted, "evicted clean cache entries");
        }
        evicted
    }

    /// Returns copies of all cached entries.
    pub fn entries(&self) -> Vec<(K, V)> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            for (key, entry) in shard.read().iter() {
                out.push((key.clone(), entry.value.lock().clone()));
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys queued or in flight.
    pub fn dirty_len(&self) -> usize {
        let chain = self.chain.lock();
        chain.queued.len() + chain.in_flight.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }
}
