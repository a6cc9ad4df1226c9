//! Multi-node convergence tests
//!
//! Several factories act as separate nodes over one backend. After every
//! node has flushed and resynced, all of them must report the same totals.

use counter_sim::clock::{Clock, ManualClock};
use counter_sim::label::InMemoryOrderedStore;
use counter_sim::label_counter::DEFAULT_SET_NAME;
use counter_sim::{
    ColumnCounterBackend, Counter, CounterBackend, CounterConfig, DbCounterFactory,
    LabelCounterBackend, LabelCounterFactory,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Arc;

const EXPIRE_MS: u64 = 100;

fn column_nodes(count: usize, clock: &ManualClock) -> Vec<DbCounterFactory<ColumnCounterBackend>> {
    let backend = ColumnCounterBackend::new();
    (0..count)
        .map(|i| {
            DbCounterFactory::with_clock(
                CounterConfig::test(&format!("node-{}", i)),
                backend.clone(),
                Arc::new(clock.clone()),
            )
            .unwrap()
        })
        .collect()
}

fn label_nodes(count: usize, shards: u32, clock: &ManualClock) -> Vec<LabelCounterFactory> {
    let store = Arc::new(InMemoryOrderedStore::new());
    (0..count)
        .map(|i| {
            let server_id = format!("node-{}", i);
            let clock: Arc<dyn Clock> = Arc::new(clock.clone());
            let backend =
                LabelCounterBackend::new(store.clone(), DEFAULT_SET_NAME, &server_id, shards)
                    .unwrap()
                    .with_clock(clock.clone());
            let config = CounterConfig {
                label_shards: shards,
                ..CounterConfig::test(&server_id)
            };
            DbCounterFactory::with_clock(config, backend, clock).unwrap()
        })
        .collect()
}

fn settle<B: CounterBackend>(nodes: &[DbCounterFactory<B>], clock: &ManualClock) {
    for node in nodes {
        assert!(node.flush_all().is_complete(), "flush should succeed");
    }
    clock.advance_ms(EXPIRE_MS);
}

/// Random increments from every node; returns the expected totals.
fn random_workload<B: CounterBackend>(
    nodes: &[DbCounterFactory<B>],
    seed: u64,
    ops: usize,
) -> BTreeMap<String, i64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut expected = BTreeMap::new();
    for _ in 0..ops {
        let node = &nodes[rng.gen_range(0..nodes.len())];
        let id = format!("item-{}", rng.gen_range(0..8));
        let step = rng.gen_range(-3..10);
        node.get_counter("orders").inc_by(&id, step);
        *expected.entry(id).or_insert(0) += step;
    }
    expected
}

fn assert_converged<B: CounterBackend>(
    nodes: &[DbCounterFactory<B>],
    expected: &BTreeMap<String, i64>,
) {
    for node in nodes {
        let orders = node.get_counter("orders");
        for (id, total) in expected {
            assert_eq!(
                orders.get(id).unwrap(),
                *total,
                "{} disagrees on {}",
                node.server_id(),
                id
            );
        }
    }
}

#[test]
fn test_two_nodes_add_up() {
    let clock = ManualClock::new(0);
    let nodes = column_nodes(2, &clock);
    nodes[0].get_counter("orders").inc_by("o", 5);
    nodes[1].get_counter("orders").inc_by("o", 3);
    settle(&nodes, &clock);

    for node in &nodes {
        assert_eq!(node.get_counter("orders").get("o").unwrap(), 8);
    }
}

#[test]
fn test_set_only_moves_local_share() {
    let clock = ManualClock::new(0);
    let nodes = column_nodes(2, &clock);
    nodes[0].get_counter("orders").inc_by("o", 5);
    nodes[1].get_counter("orders").inc_by("o", 3);
    settle(&nodes, &clock);

    let orders = nodes[0].get_counter("orders");
    assert_eq!(orders.get("o").unwrap(), 8);
    orders.set("o", 100);
    let item = orders.get_item("o").unwrap().unwrap();
    println!("after set: value={} hold={}", item.value(), item.hold());
    assert_eq!(item.value(), 97);
    assert_eq!(item.hold(), 3);

    settle(&nodes, &clock);
    assert_eq!(nodes[1].get_counter("orders").get("o").unwrap(), 100);
    assert_eq!(nodes[0].backend().column("orders", "o", "node-1"), Some(3));
}

#[test]
fn test_concurrent_set_is_last_flush_per_share() {
    // Two nodes setting the same id each move only their own share, so the
    // converged total is the sum of both adjustments.
    let clock = ManualClock::new(0);
    let nodes = column_nodes(2, &clock);
    nodes[0].get_counter("orders").inc_by("o", 5);
    nodes[1].get_counter("orders").inc_by("o", 3);
    settle(&nodes, &clock);

    nodes[0].get_counter("orders").set("o", 10);
    nodes[1].get_counter("orders").set("o", 20);
    settle(&nodes, &clock);

    // node-0 share: 10 - 3 = 7, node-1 share: 20 - 5 = 15
    for node in &nodes {
        assert_eq!(node.get_counter("orders").get("o").unwrap(), 22);
    }
}

#[test]
fn test_remove_converges_to_zero() {
    let clock = ManualClock::new(0);
    let nodes = column_nodes(3, &clock);
    for (i, node) in nodes.iter().enumerate() {
        node.get_counter("orders").inc_by("o", i as i64 + 1);
    }
    settle(&nodes, &clock);

    assert!(nodes[2].get_counter("orders").remove("o"));
    settle(&nodes, &clock);
    for node in &nodes {
        assert_eq!(node.get_counter("orders").get("o").unwrap(), 0);
        assert!(node.get_counter("orders").starts_with("").unwrap().is_empty());
    }
}

#[test]
fn test_random_workload_column_backend() {
    for seed in 0..5 {
        let clock = ManualClock::new(0);
        let nodes = column_nodes(3, &clock);
        let expected = random_workload(&nodes, seed, 300);
        settle(&nodes, &clock);
        assert_converged(&nodes, &expected);
    }
}

#[test]
fn test_random_workload_label_backend() {
    for (seed, shards) in [(11, 0), (12, 1), (13, 4)] {
        let clock = ManualClock::new(0);
        let nodes = label_nodes(3, shards, &clock);
        let expected = random_workload(&nodes, seed, 200);
        settle(&nodes, &clock);
        assert_converged(&nodes, &expected);

        let scanned: BTreeMap<String, i64> = nodes[1]
            .get_counter("orders")
            .starts_with("item-")
            .unwrap()
            .into_iter()
            .map(|item| (item.id().to_string(), item.get()))
            .collect();
        let nonzero: BTreeMap<String, i64> = expected
            .iter()
            .filter(|(_, total)| **total != 0)
            .map(|(id, total)| (id.clone(), *total))
            .collect();
        assert_eq!(scanned, nonzero, "scan with {} shards", shards);
    }
}

#[test]
fn test_reads_are_stale_until_expire() {
    let clock = ManualClock::new(0);
    let nodes = column_nodes(2, &clock);
    let orders_0 = nodes[0].get_counter("orders");
    orders_0.inc("o");
    assert_eq!(nodes[1].get_counter("orders").inc("o"), 2);
    nodes[1].flush_all();

    clock.advance_ms(EXPIRE_MS - 1);
    assert_eq!(orders_0.get("o").unwrap(), 1, "still within the resync window");
    clock.advance_ms(1);
    assert_eq!(orders_0.get("o").unwrap(), 2);
}
