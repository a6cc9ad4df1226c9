use super::*;
use crate::clock::ManualClock;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::mpsc;
use std::thread;

const EXPIRY: Duration = Duration::from_millis(5000);

/// Local delta on top of a remotely observed base.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Tally {
    local: i64,
    remote: i64,
}

impl CacheValue for Tally {
    fn refresh(&mut self, fresh: Self) -> bool {
        let changed = self.remote != fresh.remote;
        self.remote = fresh.remote;
        changed
    }
}

struct Add(i64);

impl Updater<String, Tally> for Add {
    type Output = i64;

    fn create(&self, _key: &String) -> Tally {
        Tally::default()
    }

    fn apply(self, value: &mut Tally) -> i64 {
        value.local += self.0;
        value.local + value.remote
    }
}

fn cache_with(config: CacheConfig) -> (WriteBackCache<String, Tally>, ManualClock) {
    let clock = ManualClock::new(10_000);
    (WriteBackCache::new(config, Arc::new(clock.clone())), clock)
}

fn cache() -> (WriteBackCache<String, Tally>, ManualClock) {
    cache_with(CacheConfig::default())
}

fn key(s: &str) -> String {
    s.to_string()
}

fn remote(n: i64) -> Tally {
    Tally { local: 0, remote: n }
}

fn dirty_and_marked(cache: &WriteBackCache<String, Tally>, k: &str, step: i64) {
    cache.update(&key(k), Add(step));
    assert!(cache.mark_updated(&key(k)));
}

#[test]
fn test_load_on_miss_then_hit() {
    let (cache, _clock) = cache();
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
        let got = cache
            .get_or_load(
                &key("a"),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(Some(remote(4)))
                },
                EXPIRY,
            )
            .unwrap();
        assert_eq!(got, Some(remote(4)));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = cache.stats();
    assert_eq!(stats.loads, 1);
    assert_eq!(stats.hits, 2);
}

#[test]
fn test_absent_marker_suppresses_reload_until_ttl() {
    let (cache, clock) = cache();
    let calls = AtomicUsize::new(0);
    let load = |_: &String| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<Option<Tally>, String>(None)
    };

    assert_eq!(cache.get_or_load(&key("a"), load, EXPIRY).unwrap(), None);
    assert_eq!(cache.get_or_load(&key("a"), load, EXPIRY).unwrap(), None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance_ms(1001);
    assert_eq!(cache.get_or_load(&key("a"), load, EXPIRY).unwrap(), None);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.stats().absent_hits, 1);
}

#[test]
fn test_loader_error_leaves_no_marker() {
    let (cache, _clock) = cache();

    let err = cache
        .get_or_load(&key("a"), |_| Err::<Option<Tally>, _>("down"), EXPIRY)
        .unwrap_err();
    assert_eq!(err, "down");
    assert!(cache.is_empty());

    // Next read goes straight back to the loader
    let got = cache
        .get_or_load(&key("a"), |_| Ok::<_, &str>(Some(remote(2))), EXPIRY)
        .unwrap();
    assert_eq!(got, Some(remote(2)));
}

#[test]
fn test_expired_entry_refreshes_and_keeps_local() {
    let (cache, clock) = cache();
    cache
        .get_or_load(&key("a"), |_| Ok::<_, String>(Some(remote(5))), EXPIRY)
        .unwrap();
    cache.update(&key("a"), Add(3));

    clock.advance(EXPIRY);
    let got = cache
        .get_or_load(&key("a"), |_| Ok::<_, String>(Some(remote(9))), EXPIRY)
        .unwrap();
    assert_eq!(got, Some(Tally { local: 3, remote: 9 }));
    assert_eq!(cache.stats().refreshes, 1);
}

#[test]
fn test_expired_entry_with_absent_load_keeps_local_copy() {
    let (cache, clock) = cache();
    cache.update(&key("a"), Add(2));

    clock.advance(EXPIRY);
    let got = cache
        .get_or_load(&key("a"), |_| Ok::<Option<Tally>, String>(None), EXPIRY)
        .unwrap();
    assert_eq!(got, Some(Tally { local: 2, remote: 0 }));
}

#[test]
fn test_update_creates_once() {
    let (cache, _clock) = cache();

    let first = cache.update(&key("a"), Add(1));
    assert!(first.created);
    assert_eq!(first.output, 1);

    let second = cache.update(&key("a"), Add(4));
    assert!(!second.created);
    assert_eq!(second.output, 5);
    assert!(second.generation > first.generation);
    assert!(cache.is_dirty(&key("a")));
}

#[test]
fn test_update_clears_absent_marker() {
    let (cache, _clock) = cache();
    cache
        .get_or_load(&key("a"), |_| Ok::<Option<Tally>, String>(None), EXPIRY)
        .unwrap();

    cache.update(&key("a"), Add(1));
    let got = cache
        .get_or_load(&key("a"), |_| Err::<Option<Tally>, _>("not called"), EXPIRY)
        .unwrap();
    assert_eq!(got.map(|t| t.local), Some(1));
}

#[test]
fn test_modify_missing_and_unchanged() {
    let (cache, _clock) = cache();
    assert_eq!(cache.modify(&key("a"), |_| Change::Updated(())), None);

    cache
        .get_or_load(&key("a"), |_| Ok::<_, String>(Some(remote(1))), EXPIRY)
        .unwrap();
    let out = cache.modify(&key("a"), |t| Change::Unchanged(t.remote));
    assert_eq!(out, Some(1));
    assert!(!cache.is_dirty(&key("a")));

    cache.modify(&key("a"), |t| {
        t.local = 7;
        Change::Updated(())
    });
    assert!(cache.is_dirty(&key("a")));
}

#[test]
fn test_seeded_update_starts_from_loaded_value() {
    let (cache, _clock) = cache();

    let seeded = cache.update_or_insert(&key("a"), Some(remote(5)), Add(1));
    assert!(!seeded.created);
    assert_eq!(seeded.output, 6);
    assert!(cache.is_dirty(&key("a")));

    // Cached keys ignore the seed
    let again = cache.update_or_insert(&key("a"), Some(remote(100)), Add(1));
    assert_eq!(again.output, 7);
    assert_eq!(cache.get(&key("a")), Some(Tally { local: 2, remote: 5 }));
}

#[test]
fn test_modify_or_insert_seeds_missing_key() {
    let (cache, _clock) = cache();
    cache
        .get_or_load(&key("a"), |_| Ok::<Option<Tally>, String>(None), EXPIRY)
        .unwrap();

    let seen = cache.modify_or_insert(&key("a"), remote(3), |t| Change::Unchanged(t.remote));
    assert_eq!(seen, 3);
    assert!(!cache.is_dirty(&key("a")));
    // The seed replaced the absent marker
    let got = cache
        .get_or_load(&key("a"), |_| Err::<Option<Tally>, _>("not called"), EXPIRY)
        .unwrap();
    assert_eq!(got, Some(remote(3)));

    cache.modify_or_insert(&key("a"), remote(0), |t| {
        t.local = 2;
        Change::Updated(())
    });
    assert_eq!(cache.get(&key("a")), Some(Tally { local: 2, remote: 3 }));
    assert!(cache.is_dirty(&key("a")));
}

#[test]
fn test_mark_updated_requires_cached_key() {
    let (cache, _clock) = cache();
    assert!(!cache.mark_updated(&key("missing")));
    assert_eq!(cache.dirty_len(), 0);
}

#[test]
fn test_batch_commit_cleans_entries() {
    let (cache, _clock) = cache();
    dirty_and_marked(&cache, "a", 1);
    dirty_and_marked(&cache, "b", 2);

    let mut batch = cache.get_dirty_data(true, 10);
    batch.begin();
    let mut seen = Vec::new();
    while batch.has_next() {
        if let Some(entry) = batch.next() {
            seen.push((entry.key.clone(), entry.value.local));
        }
    }
    assert_eq!(seen, vec![(key("a"), 1), (key("b"), 2)]);
    batch.commit();

    assert_eq!(cache.dirty_len(), 0);
    assert!(!cache.is_dirty(&key("a")));
    assert!(!cache.is_dirty(&key("b")));
    assert_eq!(cache.stats().committed, 2);
}

#[test]
fn test_rollback_keeps_order() {
    let (cache, _clock) = cache();
    for k in ["a", "b", "c"] {
        dirty_and_marked(&cache, k, 1);
    }

    let mut batch = cache.get_dirty_data(true, 2);
    batch.begin();
    batch.rollback();

    let batch = cache.get_dirty_data(true, 3);
    let keys: Vec<_> = batch.keys().cloned().collect();
    assert_eq!(keys, vec![key("a"), key("b"), key("c")]);
    assert_eq!(cache.stats().rolled_back, 2);
}

#[test]
fn test_dropped_batch_aborts() {
    let (cache, _clock) = cache();
    dirty_and_marked(&cache, "a", 1);
    dirty_and_marked(&cache, "b", 1);

    {
        let batch = cache.get_dirty_data(true, 10);
        assert_eq!(batch.len(), 2);
    }

    assert_eq!(cache.dirty_len(), 2);
    assert!(cache.is_dirty(&key("a")));
    assert_eq!(cache.stats().rolled_back, 0);
}

#[test]
fn test_mutation_while_in_flight_is_requeued() {
    let (cache, _clock) = cache();
    dirty_and_marked(&cache, "a", 1);

    let mut batch = cache.get_dirty_data(true, 10);
    batch.begin();
    assert_eq!(batch.entries()[0].value.local, 1);

    dirty_and_marked(&cache, "a", 10);
    batch.commit();

    assert!(cache.is_dirty(&key("a")));
    let batch = cache.get_dirty_data(true, 10);
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.entries()[0].value.local, 11);
}

#[test]
fn test_overlapping_batches_are_disjoint() {
    let (cache, _clock) = cache();
    for k in ["a", "b", "c"] {
        dirty_and_marked(&cache, k, 1);
    }

    let first = cache.get_dirty_data(true, 2);
    let second = cache.get_dirty_data(true, 10);

    let first_keys: Vec<_> = first.keys().cloned().collect();
    let second_keys: Vec<_> = second.keys().cloned().collect();
    assert_eq!(first_keys, vec![key("a"), key("b")]);
    assert_eq!(second_keys, vec![key("c")]);

    first.commit();
    second.commit();
    assert_eq!(cache.dirty_len(), 0);
}

#[test]
fn test_empty_batch() {
    let (cache, _clock) = cache();
    let batch = cache.get_dirty_data(true, 10);
    assert!(batch.is_empty());
    assert!(!batch.has_next());
    batch.commit();
}

#[test]
fn test_locked_batch_blocks_writers() {
    let (cache, _clock) = cache();
    let cache = Arc::new(cache);
    dirty_and_marked(&cache, "a", 1);

    let batch = cache.get_dirty_data(false, 10);
    assert!(!batch.is_copy());

    let done = Arc::new(AtomicBool::new(false));
    let (started_tx, started_rx) = mpsc::channel();
    let writer = {
        let cache = cache.clone();
        let done = done.clone();
        thread::spawn(move || {
            started_tx.send(()).unwrap();
            cache.update(&key("a"), Add(1));
            done.store(true, Ordering::SeqCst);
        })
    };

    started_rx.recv().unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(!done.load(Ordering::SeqCst), "writer should wait for the batch");

    batch.commit();
    writer.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(cache.get(&key("a")).map(|t| t.local), Some(2));
}

#[test]
fn test_mark_persisted_cleans_entry() {
    let (cache, _clock) = cache();
    let updated = cache.update(&key("a"), Add(1));
    assert!(cache.is_dirty(&key("a")));

    cache.mark_persisted(&key("a"), updated.generation);
    assert!(!cache.is_dirty(&key("a")));

    // A later write is dirty again
    cache.update(&key("a"), Add(1));
    assert!(cache.is_dirty(&key("a")));
}

#[test]
fn test_capacity_eviction_skips_dirty() {
    let (cache, _clock) = cache_with(CacheConfig {
        capacity: 2,
        ..CacheConfig::default()
    });
    cache.update(&key("a"), Add(1));
    cache.update(&key("b"), Add(1));

    cache
        .get_or_load(&key("c"), |_| Ok::<_, String>(Some(remote(1))), EXPIRY)
        .unwrap();

    assert_eq!(cache.len(), 2);
    assert!(cache.get(&key("a")).is_some());
    assert!(cache.get(&key("b")).is_some());
    assert!(cache.get(&key("c")).is_none());
    assert_eq!(cache.stats().evictions, 1);
}

#[test]
fn test_capacity_eviction_leaves_headroom() {
    let (cache, clock) = cache_with(CacheConfig {
        capacity: 20,
        ..CacheConfig::default()
    });
    for i in 0..21 {
        cache
            .get_or_load(&format!("k{}", i), |_| Ok::<_, String>(Some(remote(1))), EXPIRY)
            .unwrap();
        clock.advance_ms(1);
    }

    // Trimmed to 18 in one sweep, oldest first
    assert_eq!(cache.len(), 18);
    assert_eq!(cache.stats().evictions, 3);
    for i in 0..3 {
        assert!(cache.get(&format!("k{}", i)).is_none());
    }

    for i in 21..23 {
        cache
            .get_or_load(&format!("k{}", i), |_| Ok::<_, String>(Some(remote(1))), EXPIRY)
            .unwrap();
    }
    assert_eq!(cache.len(), 20);
    assert_eq!(cache.stats().evictions, 3);
}

#[test]
fn test_evicted_clean_key_leaves_chain() {
    let (cache, _clock) = cache();
    let updated = cache.update(&key("a"), Add(1));
    assert!(cache.mark_updated(&key("a")));
    cache.mark_persisted(&key("a"), updated.generation);

    // Persisted while queued: clean, so eviction may take it
    assert_eq!(cache.cleanup(CleanupPolicy::Clear), 1);
    let batch = cache.get_dirty_data(true, 10);
    assert!(batch.is_empty());
    batch.commit();
    assert_eq!(cache.dirty_len(), 0);
}

#[test]
fn test_cleanup_trim_evicts_least_recent() {
    let (cache, clock) = cache();
    for k in ["x", "y", "z"] {
        cache
            .get_or_load(&key(k), |_| Ok::<_, String>(Some(remote(1))), EXPIRY)
            .unwrap();
        clock.advance_ms(10);
    }
    cache.get(&key("x"));

    assert_eq!(cache.cleanup(CleanupPolicy::Trim { keep: 2 }), 1);
    assert!(cache.get(&key("y")).is_none());
    assert!(cache.get(&key("x")).is_some());
}

#[test]
fn test_cleanup_clear_keeps_dirty() {
    let (cache, _clock) = cache();
    for k in ["x", "y", "z"] {
        cache
            .get_or_load(&key(k), |_| Ok::<_, String>(Some(remote(1))), EXPIRY)
            .unwrap();
    }
    dirty_and_marked(&cache, "w", 1);

    assert_eq!(cache.cleanup(CleanupPolicy::Clear), 3);
    assert_eq!(cache.len(), 1);
    assert!(cache.get(&key("w")).is_some());
}

#[test]
fn test_invalidate_only_clean() {
    let (cache, _clock) = cache();
    cache
        .get_or_load(&key("a"), |_| Ok::<_, String>(Some(remote(1))), EXPIRY)
        .unwrap();
    dirty_and_marked(&cache, "b", 1);

    assert!(cache.invalidate(&key("a")));
    assert!(!cache.invalidate(&key("b")));
    assert!(!cache.invalidate(&key("missing")));
}

#[test]
fn test_dirty_listener_fires_on_empty_to_non_empty() {
    let fired = Arc::new(AtomicUsize::new(0));
    let clock = ManualClock::new(0);
    let cache: WriteBackCache<String, Tally> =
        WriteBackCache::new(CacheConfig::default(), Arc::new(clock)).with_dirty_listener({
            let fired = fired.clone();
            Arc::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        });

    dirty_and_marked(&cache, "a", 1);
    dirty_and_marked(&cache, "b", 1);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    cache.get_dirty_data(true, 10).commit();
    dirty_and_marked(&cache, "a", 1);
    assert_eq!(fired.load(Ordering::SeqCst), 2);

    // Rollback hands keys back to an empty chain
    let batch = cache.get_dirty_data(true, 10);
    batch.rollback();
    assert_eq!(fired.load(Ordering::SeqCst), 3);
}

#[test]
fn test_remove_all_clears_everything() {
    let (cache, _clock) = cache();
    dirty_and_marked(&cache, "a", 1);
    cache
        .get_or_load(&key("b"), |_| Ok::<Option<Tally>, String>(None), EXPIRY)
        .unwrap();

    cache.remove_all();
    assert!(cache.is_empty());
    assert_eq!(cache.dirty_len(), 0);

    // Absent marker is gone too
    let got = cache
        .get_or_load(&key("b"), |_| Ok::<_, String>(Some(remote(3))), EXPIRY)
        .unwrap();
    assert_eq!(got, Some(remote(3)));
}

#[test]
fn test_remove_all_during_flight_does_not_requeue() {
    let (cache, _clock) = cache();
    dirty_and_marked(&cache, "a", 1);

    let batch = cache.get_dirty_data(true, 10);
    cache.remove_all();
    batch.rollback();

    assert_eq!(cache.dirty_len(), 0);
    assert!(cache.is_empty());
}

#[test]
fn test_concurrent_updates_all_land() {
    let (cache, _clock) = cache();
    let cache = Arc::new(cache);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            thread::spawn(move || {
                for _ in 0..1000 {
                    cache.update(&key("hot"), Add(1));
                    cache.mark_updated(&key("hot"));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(cache.get(&key("hot")).map(|t| t.local), Some(8000));
    assert_eq!(cache.dirty_len(), 1);
}
