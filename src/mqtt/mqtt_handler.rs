use super::backoff::Backoff;
use super::config::MqttSettings;
use super::transport::{ConnectOptions, Transport, TransportError, TransportEvent};
use crate::dedup::{DedupCache, IdExtractor};
use chrono::{DateTime, Utc};
use rumqttc::QoS;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    /// Transport reported success, waiting out the stabilization delay.
    Stabilizing,
    Connected,
}

/// Point-in-time view of the broker link.
#[derive(Clone, Debug, Serialize)]
pub struct BrokerStatus {
    pub connection_state: ConnectionState,
    pub client_id: String,
    pub connect_attempts: u64,
    pub consecutive_failures: u32,
    pub next_backoff_ms: u64,
    pub messages_sent: u64,
    pub duplicates_suppressed: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Not connected to MQTT broker")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Resilient MQTT publisher.
///
/// Cloning is cheap; all clones share one connection state machine:
///
/// ```text
/// Disconnected ──connect──► Connecting ──callback──► Stabilizing ──delay──► Connected
///      ▲                        │                        │                     │
///      └────────────────────────┴──── failure / loss ────┴─────────────────────┘
///      └── backoff timer re-enters Connecting unless disconnect() was called
/// ```
///
/// Every connect attempt gets a new generation number. Callbacks and timers
/// carry the generation they were created for and are ignored once it is
/// outdated, so a late callback can never resurrect an abandoned session.
#[derive(Clone)]
pub struct BrokerClient {
    shared: Arc<Shared>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    settings: MqttSettings,
    dedup: Arc<DedupCache>,
    id_extractor: Arc<dyn IdExtractor>,
    inner: Mutex<ClientInner>,
}

struct ClientInner {
    state: ConnectionState,
    backoff: Backoff,
    clean_disconnect: bool,
    generation: u64,
    attempts: u64,
    client_id: String,
    reconnect_timer: Option<JoinHandle<()>>,
    stabilize_timer: Option<JoinHandle<()>>,
    event_listener: Option<JoinHandle<()>>,
    last_activity: Option<DateTime<Utc>>,
    messages_sent: u64,
    duplicates_suppressed: u64,
}

impl ClientInner {
    fn abort_timers(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.stabilize_timer.take() {
            timer.abort();
        }
    }
}

impl BrokerClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: MqttSettings,
        dedup: Arc<DedupCache>,
        id_extractor: Arc<dyn IdExtractor>,
    ) -> Self {
        let inner = ClientInner {
            state: ConnectionState::Disconnected,
            backoff: Backoff::new(&settings.backoff),
            clean_disconnect: false,
            generation: 0,
            attempts: 0,
            client_id: settings.client_id.clone(),
            reconnect_timer: None,
            stabilize_timer: None,
            event_listener: None,
            last_activity: None,
            messages_sent: 0,
            duplicates_suppressed: 0,
        };
        Self {
            shared: Arc::new(Shared {
                transport,
                settings,
                dedup,
                id_extractor,
                inner: Mutex::new(inner),
            }),
        }
    }

    /// Starts connecting. A failed attempt is logged and arms the backoff
    /// reconnect timer; watch [`state`](Self::state) for the outcome.
    pub async fn connect(&self) {
        self.shared.lock().clean_disconnect = false;
        Shared::connect_attempt(&self.shared, false).await;
    }

    /// Deliberate close. Cancels pending timers and suppresses reconnects
    /// until the next [`connect`](Self::connect).
    pub async fn disconnect(&self) {
        let listener = {
            let mut inner = self.shared.lock();
            inner.clean_disconnect = true;
            inner.abort_timers();
            inner.state = ConnectionState::Disconnected;
            inner.generation += 1;
            inner.backoff.reset();
            inner.event_listener.take()
        };

        self.shared
            .transport
            .disconnect(self.shared.settings.disconnect_wait())
            .await;
        if let Some(listener) = listener {
            listener.abort();
        }
        info!("MQTT client disconnected");
    }

    /// Publishes a durable message at the configured QoS and waits for the
    /// broker's acknowledgement.
    ///
    /// Messages whose ID was published within the dedup TTL are skipped and
    /// reported as success.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }

        let message_id = self.shared.id_extractor.extract(payload);
        if let Some(id) = message_id.as_deref() {
            if self.shared.dedup.contains(id) {
                debug!("Skipping duplicate message {}", id);
                self.shared.lock().duplicates_suppressed += 1;
                return Ok(());
            }
        }

        let topic = self.shared.settings.qualify(topic);
        self.shared
            .transport
            .publish(&topic, payload, self.shared.settings.durable_qos())
            .await?;

        if let Some(id) = message_id.as_deref() {
            self.shared.dedup.insert(id);
        }
        self.shared.record_activity();
        Ok(())
    }

    /// Fire-and-forget publish at QoS 0, bypassing dedup.
    pub async fn publish_heartbeat(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        let topic = self.shared.settings.qualify(topic);
        self.shared
            .transport
            .publish(&topic, payload, QoS::AtMostOnce)
            .await?;
        self.shared.lock().last_activity = Some(Utc::now());
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn client_id(&self) -> String {
        self.shared.lock().client_id.clone()
    }

    pub fn status(&self) -> BrokerStatus {
        let inner = self.shared.lock();
        BrokerStatus {
            connection_state: inner.state,
            client_id: inner.client_id.clone(),
            connect_attempts: inner.attempts,
            consecutive_failures: inner.backoff.failures(),
            next_backoff_ms: inner.backoff.current().as_millis() as u64,
            messages_sent: inner.messages_sent,
            duplicates_suppressed: inner.duplicates_suppressed,
            last_activity: inner.last_activity,
        }
    }
}

impl Shared {
    // Every critical section is short and never awaits; a poisoned lock
    // still holds a consistent state machine.
    fn lock(&self) -> MutexGuard<'_, ClientInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_activity(&self) {
        let mut inner = self.lock();
        inner.last_activity = Some(Utc::now());
        inner.messages_sent += 1;
    }

    fn connect_options(&self, client_id: &str) -> ConnectOptions {
        let settings = &self.settings;
        ConnectOptions {
            host: settings.host.clone(),
            port: settings.port,
            use_tls: settings.use_tls,
            username: (!settings.username.is_empty()).then(|| settings.username.clone()),
            password: (!settings.password.is_empty()).then(|| settings.password.clone()),
            client_id: client_id.to_string(),
            keep_alive: settings.keep_alive(),
            clean_session: settings.clean_session,
            connect_timeout: settings.connect_timeout(),
        }
    }

    /// Fresh client ID for every attempt after the first.
    fn next_client_id(&self, attempt: u64) -> String {
        let seed = if self.settings.client_id.is_empty() {
            "sync-manager"
        } else {
            self.settings.client_id.as_str()
        };
        if attempt <= 1 {
            seed.to_string()
        } else {
            format!("{}-{}", seed, uuid::Uuid::new_v4().simple())
        }
    }

    async fn connect_attempt(shared: &Arc<Shared>, reconnect: bool) {
        let (generation, options, events) = {
            let mut inner = shared.lock();
            if reconnect && inner.clean_disconnect {
                debug!("Reconnect skipped after deliberate disconnect");
                return;
            }
            if inner.reconnect_timer.as_ref().is_some_and(|t| !t.is_finished()) {
                debug!("Reconnect already scheduled, not connecting now");
                return;
            }
            if inner.state != ConnectionState::Disconnected {
                debug!("Connect ignored in state {:?}", inner.state);
                return;
            }

            inner.state = ConnectionState::Connecting;
            inner.generation += 1;
            inner.attempts += 1;
            inner.client_id = shared.next_client_id(inner.attempts);

            let (events, rx) = mpsc::unbounded_channel();
            let listener = Self::spawn_listener(Arc::downgrade(shared), inner.generation, rx);
            if let Some(previous) = inner.event_listener.replace(listener) {
                previous.abort();
            }

            (
                inner.generation,
                shared.connect_options(&inner.client_id),
                events,
            )
        };

        match shared.transport.connect(options, events).await {
            Ok(()) => {
                let stale = shared.lock().generation != generation;
                if stale {
                    debug!("Connect finished after the attempt was abandoned, closing it");
                    shared
                        .transport
                        .disconnect(shared.settings.disconnect_wait())
                        .await;
                }
            }
            Err(e) => {
                let mut inner = shared.lock();
                if inner.generation == generation && inner.state == ConnectionState::Connecting {
                    warn!("MQTT connect attempt {} failed: {}", inner.attempts, e);
                    inner.state = ConnectionState::Disconnected;
                    if !inner.clean_disconnect {
                        Self::schedule_reconnect(shared, &mut inner);
                    }
                }
            }
        }
    }

    fn spawn_listener(
        shared: Weak<Shared>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                Self::handle_event(&shared, generation, event);
            }
        })
    }

    fn handle_event(shared: &Arc<Shared>, generation: u64, event: TransportEvent) {
        let mut inner = shared.lock();
        if inner.generation != generation {
            debug!("Ignoring {:?} from an outdated session", event);
            return;
        }

        match event {
            TransportEvent::Connected => {
                if inner.clean_disconnect || inner.state != ConnectionState::Connecting {
                    return;
                }
                let delay = shared.settings.stabilization_delay();
                info!("Connected to MQTT broker, stabilizing for {:?}", delay);
                inner.state = ConnectionState::Stabilizing;

                let weak = Arc::downgrade(shared);
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(shared) = weak.upgrade() {
                        shared.finish_stabilization(generation);
                    }
                });
                if let Some(previous) = inner.stabilize_timer.replace(timer) {
                    previous.abort();
                }
            }
            TransportEvent::ConnectionLost(reason) => {
                if inner.state == ConnectionState::Disconnected {
                    return;
                }
                if let Some(timer) = inner.stabilize_timer.take() {
                    timer.abort();
                }
                warn!("Lost connection to MQTT broker: {}", reason);
                inner.state = ConnectionState::Disconnected;
                inner.generation += 1;
                if !inner.clean_disconnect {
                    Self::schedule_reconnect(shared, &mut inner);
                }
            }
        }
    }

    fn finish_stabilization(&self, generation: u64) {
        let mut inner = self.lock();
        inner.stabilize_timer = None;
        if inner.generation != generation || inner.state != ConnectionState::Stabilizing {
            return;
        }
        inner.state = ConnectionState::Connected;
        inner.backoff.reset();
        inner.last_activity = Some(Utc::now());
        info!("MQTT connection stable as {}", inner.client_id);
    }

    /// Arms the single reconnect timer. Called with the state lock held.
    fn schedule_reconnect(shared: &Arc<Shared>, inner: &mut ClientInner) {
        if inner.reconnect_timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let delay = inner.backoff.next_delay();
        info!(
            "Reconnecting to MQTT broker in {:.1}s (failure {})",
            delay.as_secs_f64(),
            inner.backoff.failures()
        );

        let weak = Arc::downgrade(shared);
        inner.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            shared.lock().reconnect_timer = None;
            Self::connect_attempt(&shared, true).await;
        }));
    }
}
