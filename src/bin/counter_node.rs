//! Two counter nodes sharing one in-memory ordered store.
//!
//! Usage: `counter-node [config.toml]`. `COUNTER_*` environment variables
//! override the file; `RUST_LOG` controls logging.

use counter_sim::label::InMemoryOrderedStore;
use counter_sim::label_counter::DEFAULT_SET_NAME;
use counter_sim::{spawn_flusher, Counter, CounterConfig, LabelCounterFactory, OrderedStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let base = match std::env::args().nth(1) {
        Some(path) => CounterConfig::from_file(path)?,
        None => CounterConfig::default(),
    }
    .with_env_overrides()?;

    let store: Arc<dyn OrderedStore> = Arc::new(InMemoryOrderedStore::new());
    let peer_id = format!("{}-peer", base.server_id);
    let node_a = Arc::new(LabelCounterFactory::with_label_store(
        store.clone(),
        DEFAULT_SET_NAME,
        base.clone(),
    )?);
    let node_b = Arc::new(LabelCounterFactory::with_label_store(
        store,
        DEFAULT_SET_NAME,
        CounterConfig {
            server_id: peer_id,
            ..base.clone()
        },
    )?);

    let (flusher_a, task_a) = spawn_flusher(node_a.clone(), base.flush_policy);
    let (flusher_b, task_b) = spawn_flusher(node_b.clone(), base.flush_policy);

    let orders_a = node_a.get_counter("orders");
    let orders_b = node_b.get_counter("orders");
    orders_a.inc_by("widget", 5);
    orders_b.inc_by("widget", 3);
    orders_a.inc("gadget");
    info!(
        node = node_a.server_id(),
        widget = orders_a.get("widget")?,
        "local view before resync"
    );

    flusher_a.flush_now().await;
    flusher_b.flush_now().await;
    tokio::time::sleep(base.expire + Duration::from_millis(10)).await;
    info!(
        node = node_a.server_id(),
        widget = orders_a.get("widget")?,
        "converged view"
    );

    orders_a.set("widget", 100);
    flusher_a.flush_now().await;
    tokio::time::sleep(base.expire + Duration::from_millis(10)).await;
    info!(
        node = node_b.server_id(),
        widget = orders_b.get("widget")?,
        "peer view after set"
    );

    for item in orders_b.starts_with("")? {
        info!(id = item.id(), total = item.get(), own = item.value(), "item");
    }

    let report_a = flusher_a.shutdown().await;
    let report_b = flusher_b.shutdown().await;
    task_a.await?;
    task_b.await?;
    info!(?report_a, ?report_b, "nodes stopped");
    Ok(())
}
