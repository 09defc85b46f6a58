//! # Lifecycle Supervisor
//!
//! Runs the outbox, broker client and background tasks as one unit that a
//! service host can start, stop and restart.
//!
//! ## Task Layout
//!
//! ```text
//! SyncService::start()
//! ├── open + migrate SQLite outbox   (fatal on error)
//! ├── BrokerClient::connect()         (spawned, never awaited by start)
//! ├── dispatch loop                   (Recovering ──► Polling)
//! ├── dedup pruner
//! └── heartbeat                       (when enabled)
//! ```
//!
//! `stop()` cancels the shared token, disconnects the broker cleanly and gives
//! the tasks `service.stop_timeout_ms` to finish before aborting them.
//!
//! The [`control`] submodule wraps any [`ServiceComponent`] in a command
//! worker so external control surfaces can drive it through a handle.

pub mod control;

use crate::config::SyncConfig;
use crate::dedup::{extractor_from_settings, DedupCache, IdExtractor};
use crate::dispatch::heartbeat::spawn_heartbeat;
use crate::dispatch::{spawn_dispatch_loop, DispatchSnapshot, DispatchStats};
use crate::mqtt::transport::Transport;
use crate::mqtt::{BrokerClient, BrokerStatus, ConnectionState};
use crate::persistence::{run_blocking, OutboxError, OutboxStore, Payload, SqliteOutbox};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Storage unavailable: {0}")]
    Storage(#[from] OutboxError),

    #[error("Service is not running")]
    NotRunning,

    #[error("Service task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub pending: usize,
    /// A pending message is older than `health.old_pending_age_secs`.
    pub backlog_stale: bool,
    pub connection: ConnectionState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub running: bool,
    pub connection: Option<BrokerStatus>,
    pub health: Option<HealthReport>,
    pub dispatch: DispatchSnapshot,
}

/// A unit the service host can control.
#[async_trait]
pub trait ServiceComponent: Send + Sync {
    fn name(&self) -> &str;

    /// Starts the component. Calling it while running is a no-op.
    async fn start(&mut self) -> Result<(), ServiceError>;

    /// Stops the component within a bounded time. Calling it while stopped is a no-op.
    async fn stop(&mut self) -> Result<(), ServiceError>;

    async fn restart(&mut self) -> Result<(), ServiceError> {
        self.stop().await?;
        self.start().await
    }

    async fn status(&self) -> ServiceStatus;
}

struct RunningPipeline {
    store: Arc<dyn OutboxStore>,
    broker: BrokerClient,
    token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

/// The sync manager's store-and-forward pipeline.
pub struct SyncService {
    config: Arc<SyncConfig>,
    transport: Arc<dyn Transport>,
    id_extractor: Arc<dyn IdExtractor>,
    stats: Arc<DispatchStats>,
    running: Option<RunningPipeline>,
}

impl SyncService {
    pub fn new(config: Arc<SyncConfig>, transport: Arc<dyn Transport>) -> Self {
        let id_extractor = extractor_from_settings(&config.dedup);
        Self {
            config,
            transport,
            id_extractor,
            stats: Arc::new(DispatchStats::default()),
            running: None,
        }
    }

    /// Replaces the configured dedup ID extraction. Takes effect on the next start.
    pub fn with_id_extractor(mut self, id_extractor: Arc<dyn IdExtractor>) -> Self {
        self.id_extractor = id_extractor;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn outbox(&self) -> Option<Arc<dyn OutboxStore>> {
        self.running.as_ref().map(|p| Arc::clone(&p.store))
    }

    pub fn broker(&self) -> Option<BrokerClient> {
        self.running.as_ref().map(|p| p.broker.clone())
    }

    /// Stores a message for delivery, recording the current broker state.
    pub async fn enqueue(&self, topic: &str, payload: Payload) -> Result<i64, ServiceError> {
        let pipeline = self.running.as_ref().ok_or(ServiceError::NotRunning)?;
        let connected = pipeline.broker.is_connected();
        let topic = topic.to_string();
        Ok(run_blocking(&pipeline.store, move |store| {
            store.enqueue(&topic, &payload, connected)
        })
        .await?)
    }

    async fn open_store(path: PathBuf) -> Result<Arc<dyn OutboxStore>, ServiceError> {
        let outbox = tokio::task::spawn_blocking(move || -> Result<SqliteOutbox, OutboxError> {
            let outbox = SqliteOutbox::open(&path)?;
            outbox.migrate()?;
            Ok(outbox)
        })
        .await
        .map_err(|e| ServiceError::Task(e.to_string()))??;
        Ok(Arc::new(outbox))
    }
}

#[async_trait]
impl ServiceComponent for SyncService {
    fn name(&self) -> &str {
        &self.config.service.name
    }

    async fn start(&mut self) -> Result<(), ServiceError> {
        if self.running.is_some() {
            debug!("{} already running", self.name());
            return Ok(());
        }
        info!("Starting {}", self.name());

        let config = Arc::clone(&self.config);
        let store = Self::open_store(config.outbox.database_path.clone()).await?;
        let dedup = Arc::new(DedupCache::from_settings(&config.dedup));
        let broker = BrokerClient::new(
            Arc::clone(&self.transport),
            config.mqtt.clone(),
            Arc::clone(&dedup),
            Arc::clone(&self.id_extractor),
        );
        let token = CancellationToken::new();

        let mut tasks = Vec::new();
        let connecting = broker.clone();
        tasks.push((
            "connect",
            tokio::spawn(async move { connecting.connect().await }),
        ));
        tasks.push((
            "dispatch",
            spawn_dispatch_loop(
                Arc::clone(&store),
                broker.clone(),
                config.dispatch.clone(),
                config.outbox.processing_timeout(),
                Arc::clone(&self.stats),
                token.clone(),
            ),
        ));
        tasks.push((
            "dedup-pruner",
            Arc::clone(&dedup).spawn_pruner(token.clone(), config.dedup.prune_interval()),
        ));
        if config.heartbeat.enabled {
            tasks.push((
                "heartbeat",
                spawn_heartbeat(
                    broker.clone(),
                    Arc::clone(&store),
                    config.heartbeat.clone(),
                    token.clone(),
                ),
            ));
        }

        self.running = Some(RunningPipeline {
            store,
            broker,
            token,
            tasks,
        });
        info!("{} started", self.name());
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ServiceError> {
        let Some(pipeline) = self.running.take() else {
            debug!("{} already stopped", self.name());
            return Ok(());
        };
        info!("Stopping {}", self.name());

        pipeline.token.cancel();
        pipeline.broker.disconnect().await;

        let timeout = self.config.service.stop_timeout();
        let deadline = Instant::now() + timeout;
        for (task_name, mut task) in pipeline.tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{} task ended abnormally: {}", task_name, e),
                Err(_) => {
                    warn!("{} task did not stop within {:?}, aborting", task_name, timeout);
                    task.abort();
                }
            }
        }

        info!("{} stopped", self.name());
        Ok(())
    }

    async fn status(&self) -> ServiceStatus {
        let dispatch = self.stats.snapshot();
        let Some(pipeline) = self.running.as_ref() else {
            return ServiceStatus {
                name: self.name().to_string(),
                running: false,
                connection: None,
                health: None,
                dispatch,
            };
        };

        let connection = pipeline.broker.status();
        let age = self.config.health.old_pending_age();
        let health = match run_blocking(&pipeline.store, move |store| {
            Ok((store.count_pending()?, store.has_old_pending(age)?))
        })
        .await
        {
            Ok((pending, backlog_stale)) => Some(HealthReport {
                pending,
                backlog_stale,
                connection: connection.connection_state,
            }),
            Err(e) => {
                warn!("Health check could not read outbox: {}", e);
                None
            }
        };

        ServiceStatus {
            name: self.name().to_string(),
            running: true,
            connection: Some(connection),
            health,
            dispatch,
        }
    }
}

#[cfg(test)]
mod tests;
