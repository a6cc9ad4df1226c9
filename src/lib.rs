pub mod cache;
pub mod clock;
pub mod config;
pub mod counter;
pub mod label;
pub mod label_counter;

pub use cache::{CacheConfig, CacheStats, CleanupPolicy, WriteBackCache};
pub use clock::{Clock, ManualClock, Millis, SystemClock};
pub use config::{ConfigError, CounterConfig, FlushMode, FlushPolicy};
pub use counter::{
    spawn_flusher, BackendError, ColumnCounterBackend, Counter, CounterBackend, CounterError,
    CounterItem, DbCounter, DbCounterFactory, FlushReport, FlusherHandle, SimulatedBackend,
    SimulatedBackendConfig,
};
pub use label::{InMemoryOrderedStore, Label, LabelError, LabelSet, OrderedStore, PutOption};
pub use label_counter::{CounterRecord, LabelCounterBackend, LabelCounterFactory};
