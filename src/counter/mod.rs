//! Distributed Counters
//!
//! Eventually consistent integer counters shared by a fleet of nodes.
//! Each node owns one contribution per counter id and only ever writes
//! that; the observed total is its own contribution plus the peers'
//! contributions as of the last resync.
//!
//! ## Architecture
//!
//! ```text
//! DbCounterFactory (one per node)
//!   ├─ DbCounter "orders" ──► WriteBackCache<id, CounterItem>
//!   ├─ DbCounter "visits" ──► WriteBackCache<id, CounterItem>
//!   └─ CounterBackend (shared) ◄── Flusher (tokio task)
//! ```
//!
//! Writes are immediate and local. A first write to an id is written
//! through with `insert_new`; later writes are drained by the flusher in
//! batches. After `expire` a read reloads the item and adopts the peers'
//! latest contributions while keeping unflushed local writes.

mod backend;
mod column;
mod db_counter;
mod error;
mod factory;
mod flusher;
mod item;
mod simulated;


pub use backend::{CounterBackend, CounterBatch, CounterRef};
pub use column::ColumnCounterBackend;
pub use db_counter::{CounterFlush, DbCounter};
pub use error::{BackendError, BackendResult, CounterError};
pub use factory::{DbCounterFactory, FlushReport};
pub use flusher::{spawn_flusher, Flusher, FlusherHandle, FlusherMessage};
pub use item::CounterItem;
pub use simulated::{SimulatedBackend, SimulatedBackendConfig, SimulatedBackendStats};

/// Operations on one named counter.
///
/// Mutations report their result from the local view and never fail;
/// persistence errors are logged and retried by the flusher.
pub trait Counter: Send + Sync {
    fn name(&self) -> &str;

    /// Observed total for `id`; 0 if no node has written it.
    fn get(&self, id: &str) -> Result<i64, CounterError>;

    fn inc(&self, id: &str) -> i64 {
        self.inc_by(id, 1)
    }

    /// Adds `step` and returns the new total.
    fn inc_by(&self, id: &str, step: i64) -> i64;

    fn dec(&self, id: &str) -> i64 {
        self.dec_by(id, 1)
    }

    fn dec_by(&self, id: &str, step: i64) -> i64 {
        self.inc_by(id, step.wrapping_neg())
    }

    /// Forces the observed total to `value` by moving only this node's
    /// contribution. Returns `value`.
    fn set(&self, id: &str, value: i64) -> i64;

    /// Sets the total to `value` only if it currently equals `expect`.
    ///
    /// An id nobody has written counts as 0, so `expect == 0` succeeds on
    /// it as well as on a confirmed zero.
    fn compare_and_set(&self, id: &str, expect: i64, value: i64) -> bool;

    /// Drives the total to 0. Returns false if it already was 0 or the id
    /// is unknown.
    fn remove(&self, id: &str) -> bool;

    /// Drops every locally cached item. Persisted data is untouched.
    fn remove_all(&self);

    /// Items whose id starts with `prefix`, ordered by id.
    fn starts_with(&self, prefix: &str) -> Result<Vec<CounterItem>, CounterError>;

    /// Items with `first <= id <= last`, ordered by id.
    fn search_range(&self, first: &str, last: &str) -> Result<Vec<CounterItem>, CounterError>;
}
