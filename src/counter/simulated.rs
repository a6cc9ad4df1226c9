//! Simulated Counter Backend with Fault Injection
//!
//! Wraps any [`CounterBackend`] and fails calls with configured
//! probabilities drawn from a seeded RNG, so a failing schedule replays
//! exactly from its seed.

use super::backend::{CounterBackend, CounterBatch, CounterRef};
use super::error::{BackendError, BackendResult};
use super::item::CounterItem;
use crate::label::KeyRange;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedBackendConfig {
    /// Probability of a load failing
    pub load_fail_prob: f64,
    /// Probability of a bulk update failing before writing anything
    pub update_fail_prob: f64,
    /// Probability of a bulk update writing only a prefix of the batch
    pub partial_batch_prob: f64,
    /// Probability of an insert_new failing
    pub insert_fail_prob: f64,
    /// Probability of a scan failing
    pub scan_fail_prob: f64,
}

impl Default for SimulatedBackendConfig {
    fn default() -> Self {
        SimulatedBackendConfig {
            load_fail_prob: 0.01,
            update_fail_prob: 0.05,
            partial_batch_prob: 0.02,
            insert_fail_prob: 0.05,
            scan_fail_prob: 0.01,
        }
    }
}

impl SimulatedBackendConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedBackendConfig {
            load_fail_prob: 0.1,
            update_fail_prob: 0.3,
            partial_batch_prob: 0.1,
            insert_fail_prob: 0.3,
            scan_fail_prob: 0.1,
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedBackendConfig {
            load_fail_prob: 0.0,
            update_fail_prob: 0.0,
            partial_batch_prob: 0.0,
            insert_fail_prob: 0.0,
            scan_fail_prob: 0.0,
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatedBackendStats {
    pub load_attempts: u64,
    pub load_failures: u64,
    pub update_attempts: u64,
    pub update_failures: u64,
    pub partial_batches: u64,
    pub insert_attempts: u64,
    pub insert_failures: u64,
    pub scan_attempts: u64,
    pub scan_failures: u64,
}

struct SimulatedState {
    rng: ChaCha8Rng,
    stats: SimulatedBackendStats,
    config: SimulatedBackendConfig,
}

impl SimulatedState {
    fn roll(&mut self, prob: impl Fn(&SimulatedBackendConfig) -> f64) -> bool {
        let prob = prob(&self.config);
        prob > 0.0 && self.rng.gen_bool(prob.min(1.0))
    }
}

pub struct SimulatedBackend<B> {
    inner: B,
    state: Mutex<SimulatedState>,
}

impl<B: CounterBackend> SimulatedBackend<B> {
    pub fn new(inner: B, seed: u64, config: SimulatedBackendConfig) -> Self {
        SimulatedBackend {
            inner,
            state: Mutex::new(SimulatedState {
                rng: ChaCha8Rng::seed_from_u64(seed),
                stats: SimulatedBackendStats::default(),
                config,
            }),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn stats(&self) -> SimulatedBackendStats {
        self.state.lock().stats
    }

    pub fn reset_stats(&self) {
        self.state.lock().stats = SimulatedBackendStats::default();
    }

    /// Swaps fault probabilities, for healing a run before checking it.
    pub fn set_config(&self, config: SimulatedBackendConfig) {
        self.state.lock().config = config;
    }
}

impl<B: CounterBackend> CounterBackend for SimulatedBackend<B> {
    fn load(&self, counter: CounterRef<'_>, id: &str) -> BackendResult<Option<CounterItem>> {
        {
            let mut s = self.state.lock();
            s.stats.load_attempts += 1;
            if s.roll(|c| c.load_fail_prob) {
                s.stats.load_failures += 1;
                return Err(BackendError::Unavailable("simulated load failure".into()));
            }
        }
        self.inner.load(counter, id)
    }

    fn bulk_update(
        &self,
        counter: CounterRef<'_>,
        batch: &mut CounterBatch<'_>,
    ) -> BackendResult<()> {
        let expected = batch.len();
        let partial_at = {
            let mut s = self.state.lock();
            s.stats.update_attempts += 1;
            if s.roll(|c| c.update_fail_prob) {
                s.stats.update_failures += 1;
                return Err(BackendError::Unavailable("simulated update failure".into()));
            }
            if expected > 1 && s.roll(|c| c.partial_batch_prob) {
                s.stats.partial_batches += 1;
                Some(s.rng.gen_range(1..expected))
            } else {
                None
            }
        };

        match partial_at {
            Some(matched) => {
                for entry in &batch.entries()[..matched] {
                    self.inner.insert_new(counter, &entry.value)?;
                }
                Err(BackendError::PartialBatch { expected, matched })
            }
            None => self.inner.bulk_update(counter, batch),
        }
    }

    fn insert_new(&self, counter: CounterRef<'_>, item: &CounterItem) -> BackendResult<()> {
        {
            let mut s = self.state.lock();
            s.stats.insert_attempts += 1;
            if s.roll(|c| c.insert_fail_prob) {
                s.stats.insert_failures += 1;
                return Err(BackendError::Unavailable("simulated insert failure".into()));
            }
        }
        self.inner.insert_new(counter, item)
    }

    fn scan(&self, counter: CounterRef<'_>, range: &KeyRange) -> BackendResult<Vec<CounterItem>> {
        {
            let mut s = self.state.lock();
            s.stats.scan_attempts += 1;
            if s.roll(|c| c.scan_fail_prob) {
                s.stats.scan_failures += 1;
                return Err(BackendError::Unavailable("simulated scan failure".into()));
            }
        }
        self.inner.scan(counter, range)
    }

    fn check_counter(&self, counter: CounterRef<'_>) -> BackendResult<()> {
        self.inner.check_counter(counter)
    }
}
