//! Background Flusher
//!
//! A tokio task that drains every counter of a factory to its backend.
//! Flush cycles do blocking backend I/O, so they run on the blocking pool.
//!
//! - `FlushPolicy::Interval`: one cycle per fixed tick
//! - `FlushPolicy::Debounced`: one cycle `delay` after the first dirty
//!   signal, so a burst of writes is coalesced into one cycle

use super::backend::CounterBackend;
use super::factory::{DbCounterFactory, FlushReport};
use crate::config::FlushPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

/// Messages for the flusher task
pub enum FlusherMessage {
    /// Run a cycle now and report it
    FlushNow {
        response_tx: oneshot::Sender<FlushReport>,
    },
    /// Run a final cycle and stop
    Shutdown {
        response_tx: oneshot::Sender<FlushReport>,
    },
}

pub struct Flusher<B> {
    factory: Arc<DbCounterFactory<B>>,
    policy: FlushPolicy,
    rx: mpsc::UnboundedReceiver<FlusherMessage>,
}

impl<B: CounterBackend> Flusher<B> {
    fn new(
        factory: Arc<DbCounterFactory<B>>,
        policy: FlushPolicy,
        rx: mpsc::UnboundedReceiver<FlusherMessage>,
    ) -> Self {
        Flusher {
            factory,
            policy,
            rx,
        }
    }

    /// Run the flusher loop
    pub async fn run(mut self) {
        info!(server_id = %self.factory.server_id(), policy = ?self.policy, "flusher started");
        match self.policy {
            FlushPolicy::Interval { .. } => self.run_interval(self.policy.period()).await,
            FlushPolicy::Debounced { .. } => self.run_debounced(self.policy.period()).await,
        }
        info!(server_id = %self.factory.server_id(), "flusher stopped");
    }

    async fn run_interval(&mut self, period: Duration) {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.cycle().await;
                }
                msg = self.rx.recv() => {
                    if self.handle_message(msg).await {
                        return;
                    }
                }
            }
        }
    }

    async fn run_debounced(&mut self, delay: Duration) {
        let signal = self.factory.dirty_signal();
        loop {
            tokio::select! {
                _ = signal.notified() => {
                    tokio::time::sleep(delay).await;
                    self.cycle().await;
                }
                msg = self.rx.recv() => {
                    if self.handle_message(msg).await {
                        return;
                    }
                }
            }
        }
    }

    /// Returns true if the flusher should stop.
    async fn handle_message(&mut self, msg: Option<FlusherMessage>) -> bool {
        match msg {
            Some(FlusherMessage::FlushNow { response_tx }) => {
                let report = self.cycle().await;
                let _ = response_tx.send(report);
                false
            }
            Some(FlusherMessage::Shutdown { response_tx }) => {
                let report = self.cycle().await;
                let _ = response_tx.send(report);
                true
            }
            // Every handle is gone; flush what is left and stop.
            None => {
                self.cycle().await;
                true
            }
        }
    }

    async fn cycle(&self) -> FlushReport {
        let factory = self.factory.clone();
        match tokio::task::spawn_blocking(move || factory.flush_all()).await {
            Ok(report) => report,
            Err(e) => {
                error!("flush cycle panicked: {}", e);
                FlushReport::default()
            }
        }
    }
}

// ============================================================================
// FlusherHandle - public interface for the flusher task
// ============================================================================

#[derive(Clone)]
pub struct FlusherHandle {
    tx: mpsc::UnboundedSender<FlusherMessage>,
    policy: FlushPolicy,
}

impl FlusherHandle {
    /// Runs a cycle immediately. `None` if the flusher has stopped.
    pub async fn flush_now(&self) -> Option<FlushReport> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(FlusherMessage::FlushNow { response_tx })
            .ok()?;
        response_rx.await.ok()
    }

    /// Graceful shutdown; waits for the final flush.
    pub async fn shutdown(&self) -> Option<FlushReport> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(FlusherMessage::Shutdown { response_tx })
            .ok()?;
        response_rx.await.ok()
    }

    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }
}

/// Spawn a flusher for `factory` and return its handle + join handle
pub fn spawn_flusher<B: CounterBackend>(
    factory: Arc<DbCounterFactory<B>>,
    policy: FlushPolicy,
) -> (FlusherHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let flusher = Flusher::new(factory, policy, rx);
    let task = tokio::spawn(flusher.run());
    (FlusherHandle { tx, policy }, task)
}
