use async_trait::async_trait;
use rumqttc::QoS;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Everything a transport needs to open one session.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub connect_timeout: Duration,
}

/// Asynchronous connection callbacks, delivered on the channel passed to
/// [`Transport::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    ConnectionLost(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Broker refused connection: {0}")]
    Refused(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Timed out waiting for broker")]
    Timeout,

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Connection closed before acknowledgement")]
    ConnectionClosed,
}

/// Seam between the broker client and the MQTT library.
///
/// A transport owns at most one session. `connect` returns once the session
/// is established or has failed; later connection losses are reported as
/// [`TransportEvent::ConnectionLost`] on the event channel of that session.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        options: ConnectOptions,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError>;

    /// Sends one message and waits for the acknowledgement required by `qos`.
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), TransportError>;

    /// Closes the session, waiting at most `wait` for in-flight work.
    async fn disconnect(&self, wait: Duration);
}
