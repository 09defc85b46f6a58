//! In-memory [`Transport`] for exercising the broker client, dispatch loop
//! and supervisor without a broker.

use crate::dedup::{DedupCache, JsonPointerExtractor};
use crate::mqtt::config::{BackoffSettings, MqttSettings};
use crate::mqtt::transport::{ConnectOptions, Transport, TransportError, TransportEvent};
use crate::mqtt::BrokerClient;
use crate::persistence::{OutboxStore, SqliteOutbox};
use async_trait::async_trait;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

pub struct MockTransport {
    fail_connect: AtomicBool,
    fail_publish: AtomicBool,
    auto_connect: AtomicBool,
    client_ids: Mutex<Vec<String>>,
    published: Mutex<Vec<Published>>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    disconnects: AtomicUsize,
}

impl MockTransport {
    /// A transport that accepts every connection and reports it right away.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_connect: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            auto_connect: AtomicBool::new(true),
            client_ids: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            disconnects: AtomicUsize::new(0),
        })
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_auto_connect(&self, auto: bool) {
        self.auto_connect.store(auto, Ordering::SeqCst);
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.client_ids.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.client_ids.lock().unwrap().len()
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Fires the connect callback of the current session.
    pub fn emit_connected(&self) -> bool {
        match self.events.lock().unwrap().as_ref() {
            Some(events) => events.send(TransportEvent::Connected).is_ok(),
            None => false,
        }
    }

    /// Simulates an I/O failure on the current session.
    pub fn drop_connection(&self, reason: &str) -> bool {
        match self.events.lock().unwrap().take() {
            Some(events) => events
                .send(TransportEvent::ConnectionLost(reason.to_string()))
                .is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        options: ConnectOptions,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        self.client_ids.lock().unwrap().push(options.client_id);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        if self.auto_connect.load(Ordering::SeqCst) {
            let _ = events.send(TransportEvent::Connected);
        }
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), TransportError> {
        if self.events.lock().unwrap().is_none() {
            return Err(TransportError::NotConnected);
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish("broker rejected message".to_string()));
        }
        self.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
        });
        Ok(())
    }

    async fn disconnect(&self, _wait: Duration) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().take();
    }
}

/// Migrated in-memory outbox behind the store trait.
pub fn memory_store() -> Arc<dyn OutboxStore> {
    let outbox = SqliteOutbox::open_in_memory().unwrap();
    outbox.migrate().unwrap();
    Arc::new(outbox)
}

/// Settings that stabilize quickly enough for real-time tests.
pub fn fast_mqtt_settings() -> MqttSettings {
    MqttSettings {
        stabilization_delay_ms: 10,
        backoff: BackoffSettings {
            initial_ms: 20,
            max_ms: 100,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn broker(mock: &Arc<MockTransport>) -> BrokerClient {
    BrokerClient::new(
        mock.clone(),
        fast_mqtt_settings(),
        Arc::new(DedupCache::new(Duration::from_secs(30), 1000)),
        Arc::new(JsonPointerExtractor::new("/data/id")),
    )
}

pub async fn connected_broker(mock: &Arc<MockTransport>) -> BrokerClient {
    let client = broker(mock);
    client.connect().await;
    wait_until(|| client.is_connected()).await;
    client
}

/// Polls `condition` every 10ms, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}
