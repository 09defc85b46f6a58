use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker connection settings for the sync manager's MQTT link.
///
/// All delays are stored as plain integers so the TOML file stays readable;
/// the accessor methods hand out [`Duration`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub username: String,
    pub password: String,
    /// Seed for the MQTT client ID. Reconnect attempts derive fresh IDs from it.
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    /// QoS level for durable messages (0, 1 or 2). Heartbeats always use 0.
    pub qos: u8,
    /// Prefix applied to every published topic, empty to disable.
    pub topic_namespace: String,
    pub connect_timeout_ms: u64,
    pub publish_timeout_ms: u64,
    pub stabilization_delay_ms: u64,
    pub disconnect_wait_ms: u64,
    pub backoff: BackoffSettings,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            use_tls: false,
            username: String::new(),
            password: String::new(),
            client_id: "sync-manager".to_string(),
            keep_alive_secs: 30,
            clean_session: true,
            qos: 1,
            topic_namespace: String::new(),
            connect_timeout_ms: 10_000,
            publish_timeout_ms: 10_000,
            stabilization_delay_ms: 3_000,
            disconnect_wait_ms: 250,
            backoff: BackoffSettings::default(),
        }
    }
}

impl MqttSettings {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn stabilization_delay(&self) -> Duration {
        Duration::from_millis(self.stabilization_delay_ms)
    }

    pub fn disconnect_wait(&self) -> Duration {
        Duration::from_millis(self.disconnect_wait_ms)
    }

    /// QoS for durable publishes. Out-of-range values fall back to at-least-once.
    pub fn durable_qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }

    /// Applies the configured namespace to a topic.
    ///
    /// Topics that already carry the namespace are returned unchanged.
    pub fn qualify(&self, topic: &str) -> String {
        let namespace = self.topic_namespace.trim_end_matches('/');
        if namespace.is_empty() {
            return topic.to_string();
        }
        let prefix = format!("{}/", namespace);
        if topic.starts_with(&prefix) {
            topic.to_string()
        } else {
            format!("{}{}", prefix, topic.trim_start_matches('/'))
        }
    }
}

/// Reconnect backoff tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    /// Multiplicative jitter fraction, 0.2 means ±20%.
    pub jitter: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 60_000,
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffSettings {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}
