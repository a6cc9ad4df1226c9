//! Clock Abstraction
//!
//! Every expiry, TTL and last-modified timestamp in the crate is read
//! through [`Clock`], so tests can drive resync windows and absent-marker
//! lifetimes with virtual time instead of sleeping.
//!
//! - `SystemClock`: wall-clock milliseconds since the Unix epoch
//! - `ManualClock`: virtual time that only moves when told to

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timestamp in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Millis(pub u64);

impl Millis {
    pub const ZERO: Millis = Millis(0);

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn saturating_sub(&self, other: Millis) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl std::ops::Add<Duration> for Millis {
    type Output = Millis;

    fn add(self, rhs: Duration) -> Self::Output {
        Millis(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

/// Source of the current time.
///
/// Object safe so caches and label sets can share one `Arc<dyn Clock>`.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Millis;

    fn elapsed(&self, since: Millis) -> Duration {
        self.now().saturating_sub(since)
    }

    fn has_elapsed(&self, since: Millis, duration: Duration) -> bool {
        self.elapsed(since) >= duration
    }
}

/// Real time, anchored to the Unix epoch at construction and advanced
/// with a monotonic `Instant` afterwards.
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
    start_millis: u64,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let start_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        SystemClock {
            start: Instant::now(),
            start_millis,
        }
    }

    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self::new())
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Millis {
        let elapsed = self.start.elapsed().as_millis() as u64;
        Millis(self.start_millis + elapsed)
    }
}

/// Virtual clock for deterministic tests.
///
/// Clones share the same time source.
#[derive(Debug, Clone)]
pub struct ManualClock {
    time_ms: Arc<AtomicU64>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        ManualClock {
            time_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.time_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, time_ms: u64) {
        self.time_ms.store(time_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Millis {
        Millis(self.time_ms.load(Ordering::SeqCst))
    }
}
