use crate::config::HeartbeatSettings;
use crate::mqtt::{BrokerClient, ConnectionState};
use crate::persistence::{run_blocking, OutboxStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize)]
struct Heartbeat {
    client_id: String,
    state: ConnectionState,
    /// Absent when the outbox could not be read.
    pending: Option<usize>,
    timestamp: DateTime<Utc>,
}

/// Publishes a liveness message every `settings.interval` while connected.
pub fn spawn_heartbeat(
    broker: BrokerClient,
    store: Arc<dyn OutboxStore>,
    settings: HeartbeatSettings,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(settings.interval().max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Heartbeat publishing to {} every {:?}", settings.topic, settings.interval());

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => beat(&broker, &store, &settings.topic).await,
            }
        }
        debug!("Heartbeat task stopped");
    })
}

async fn beat(broker: &BrokerClient, store: &Arc<dyn OutboxStore>, topic: &str) {
    if !broker.is_connected() {
        return;
    }

    let pending = match run_blocking(store, |store| store.count_pending()).await {
        Ok(count) => Some(count),
        Err(e) => {
            warn!("Heartbeat could not read outbox: {}", e);
            None
        }
    };
    let heartbeat = Heartbeat {
        client_id: broker.client_id(),
        state: broker.state(),
        pending,
        timestamp: Utc::now(),
    };

    let payload = match serde_json::to_vec(&heartbeat) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Failed to encode heartbeat: {}", e);
            return;
        }
    };
    if let Err(e) = broker.publish_heartbeat(topic, &payload).await {
        debug!("Heartbeat not delivered: {}", e);
    }
}
