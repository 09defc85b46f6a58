//! Dispatch loop with statum state machine for outbox delivery
//!
//! Periodically moves claimed outbox rows to the broker and records the
//! outcome. Together with the broker client this gives at-least-once
//! delivery: a row is only marked sent after the broker acknowledged it.
//!
//! # State Machine
//!
//! ```text
//! Recovering ──► Polling ──► Stopped
//!  (reset all     (tick every poll interval
//!   old claims)    until cancelled)
//! ```
//!
//! # Tick
//!
//! ```text
//! connected? ──no──► skip
//!     │yes
//! stale sweep (every stale_sweep_interval)
//!     │
//! claim_pending(batch_size) ──► publish ──ok──► mark_sent
//!                                  │
//!                                  └──err/panic──► release
//! ```

pub mod heartbeat;

use crate::config::DispatchSettings;
use crate::mqtt::{BrokerClient, BrokerError};
use crate::persistence::{run_blocking, OutboxError, OutboxStore, PendingMessage};
use serde::Serialize;
use statum::{machine, state};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Publish failed: {0}")]
    Publish(#[from] BrokerError),

    #[error("Storage error: {0}")]
    Storage(#[from] OutboxError),

    #[error("Publish task panicked: {0}")]
    Panicked(String),
}

/// Outcome of a single tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub skipped: bool,
    pub claimed: usize,
    pub sent: usize,
    pub released: usize,
    pub errors: usize,
}

/// Running totals across ticks, shared with the supervisor.
#[derive(Debug, Default)]
pub struct DispatchStats {
    ticks: AtomicU64,
    skipped_ticks: AtomicU64,
    sent: AtomicU64,
    released: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSnapshot {
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub sent: u64,
    pub released: u64,
    pub errors: u64,
}

impl DispatchStats {
    fn record(&self, report: &TickReport) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        if report.skipped {
            self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
        }
        self.sent.fetch_add(report.sent as u64, Ordering::Relaxed);
        self.released
            .fetch_add(report.released as u64, Ordering::Relaxed);
        self.errors.fetch_add(report.errors as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum DispatchState {
    Recovering, // Clearing claims left behind by a previous run
    Polling,    // Ticking on the poll interval
    Stopped,    // Cancelled, no further ticks
}

#[machine]
pub struct DispatchLoop<S: DispatchState> {
    store: Arc<dyn OutboxStore>,
    broker: BrokerClient,
    settings: DispatchSettings,
    processing_timeout: Duration,
    stats: Arc<DispatchStats>,
    last_sweep: Instant,
}

impl<S: DispatchState> DispatchLoop<S> {
    pub fn stats(&self) -> DispatchSnapshot {
        self.stats.snapshot()
    }
}

impl DispatchLoop<Recovering> {
    pub fn create(
        store: Arc<dyn OutboxStore>,
        broker: BrokerClient,
        settings: DispatchSettings,
        processing_timeout: Duration,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self::new(
            store,
            broker,
            settings,
            processing_timeout,
            stats,
            Instant::now(), // last_sweep
        )
    }

    /// Releases every claim left in `processing`. Nothing else can own a
    /// claim at startup, so no age threshold applies.
    pub async fn recover(mut self) -> DispatchLoop<Polling> {
        match run_blocking(&self.store, |store| store.reset_stale_processing(None)).await {
            Ok(0) => debug!("No interrupted deliveries to recover"),
            Ok(reset) => info!("Recovered {} interrupted deliveries", reset),
            Err(e) => error!("Crash-recovery sweep failed: {}", e),
        }
        self.last_sweep = Instant::now();
        self.transition()
    }
}

impl DispatchLoop<Polling> {
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        if !self.broker.is_connected() {
            debug!("Broker not connected, skipping dispatch tick");
            report.skipped = true;
            self.stats.record(&report);
            return report;
        }

        self.sweep_if_due().await;

        let batch_size = self.settings.batch_size.max(1);
        let claimed = run_blocking(&self.store, move |store| store.claim_pending(batch_size)).await;
        let batch = match claimed {
            Ok(batch) => batch,
            Err(e) => {
                error!("Failed to claim pending messages: {}", e);
                report.errors += 1;
                self.stats.record(&report);
                return report;
            }
        };
        report.claimed = batch.len();

        for message in batch {
            let id = message.id;
            match self.publish(message).await {
                Ok(()) => match run_blocking(&self.store, move |store| store.mark_sent(id)).await {
                    Ok(()) => report.sent += 1,
                    Err(e) => {
                        error!("Message {} delivered but not marked sent: {}", id, e);
                        report.errors += 1;
                    }
                },
                Err(e) => {
                    warn!("Delivery of message {} failed, will retry: {}", id, e);
                    match run_blocking(&self.store, move |store| store.release(id)).await {
                        Ok(()) => report.released += 1,
                        Err(e) => {
                            error!("Failed to release message {}: {}", id, e);
                            report.errors += 1;
                        }
                    }
                }
            }
        }

        if report.claimed > 0 {
            info!(
                "Dispatch tick: {} claimed, {} sent, {} released, {} errors",
                report.claimed, report.sent, report.released, report.errors
            );
        }
        self.stats.record(&report);
        report
    }

    /// Publishes on a separate task so a panic fails only this message.
    async fn publish(&self, message: PendingMessage) -> Result<(), DispatchError> {
        let broker = self.broker.clone();
        let task = tokio::spawn(async move {
            broker.publish(&message.topic, &message.payload).await
        });
        match task.await {
            Ok(result) => Ok(result?),
            Err(e) => Err(DispatchError::Panicked(describe_join_error(e))),
        }
    }

    async fn sweep_if_due(&mut self) {
        if self.last_sweep.elapsed() < self.settings.stale_sweep_interval() {
            return;
        }
        self.last_sweep = Instant::now();

        let timeout = self.processing_timeout;
        if let Err(e) = run_blocking(&self.store, move |store| {
            store.reset_stale_processing(Some(timeout))
        })
        .await
        {
            warn!("Stale claim sweep failed: {}", e);
        }
    }

    /// Ticks on the poll interval until `token` is cancelled.
    ///
    /// Cancellation is observed between ticks; a running tick always
    /// finishes its batch.
    pub async fn run_until_shutdown(mut self, token: CancellationToken) -> DispatchLoop<Stopped> {
        let interval = self.settings.poll_interval().max(MIN_POLL_INTERVAL);
        info!("Dispatch loop started, polling every {:?}", interval);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    info!("Dispatch loop received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        self.transition()
    }
}

/// Runs recovery and the polling loop on a new task.
pub fn spawn_dispatch_loop(
    store: Arc<dyn OutboxStore>,
    broker: BrokerClient,
    settings: DispatchSettings,
    processing_timeout: Duration,
    stats: Arc<DispatchStats>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let polling = DispatchLoop::create(store, broker, settings, processing_timeout, stats)
            .recover()
            .await;
        let stopped = polling.run_until_shutdown(token).await;
        info!("Dispatch loop stopped: {:?}", stopped.stats());
    })
}

fn describe_join_error(e: JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }
    let panic = e.into_panic();
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests;
