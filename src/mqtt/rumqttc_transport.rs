use super::transport::{ConnectOptions, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const REQUEST_CAPACITY: usize = 64;
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

type AckSender = oneshot::Sender<Result<(), TransportError>>;

/// Matches publish requests to broker acknowledgements.
///
/// rumqttc assigns packet IDs inside the event loop, so requests wait in
/// `awaiting` (in send order) until the loop reports the outgoing packet ID.
/// QoS 0 publishes complete at that point, the rest move to `inflight`
/// until their PubAck / PubComp arrives.
#[derive(Default)]
struct AckTracker {
    state: StdMutex<AckState>,
    settled: Notify,
}

#[derive(Default)]
struct AckState {
    awaiting: VecDeque<AckSender>,
    inflight: HashMap<u16, AckSender>,
}

impl AckState {
    fn is_empty(&self) -> bool {
        self.awaiting.is_empty() && self.inflight.is_empty()
    }
}

impl AckTracker {
    fn state(&self) -> MutexGuard<'_, AckState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, tx: AckSender) {
        self.state().awaiting.push_back(tx);
    }

    fn abandon_last(&self) {
        self.state().awaiting.pop_back();
        self.settled.notify_waiters();
    }

    fn sent(&self, pkid: u16) {
        {
            let mut state = self.state();
            let Some(tx) = state.awaiting.pop_front() else {
                debug!("Outgoing publish {} has no waiting caller", pkid);
                return;
            };
            if pkid == 0 {
                let _ = tx.send(Ok(()));
            } else {
                state.inflight.insert(pkid, tx);
            }
        }
        self.settled.notify_waiters();
    }

    fn acknowledge(&self, pkid: u16) {
        if let Some(tx) = self.state().inflight.remove(&pkid) {
            let _ = tx.send(Ok(()));
        }
        self.settled.notify_waiters();
    }

    fn fail_all(&self) {
        {
            let mut state = self.state();
            for tx in state.awaiting.drain(..) {
                let _ = tx.send(Err(TransportError::ConnectionClosed));
            }
            for (_, tx) in state.inflight.drain() {
                let _ = tx.send(Err(TransportError::ConnectionClosed));
            }
        }
        self.settled.notify_waiters();
    }

    /// Resolves once no publish is waiting for a packet ID or an ack.
    async fn drained(&self) {
        loop {
            let settled = self.settled.notified();
            if self.state().is_empty() {
                return;
            }
            settled.await;
        }
    }
}

struct Session {
    client: AsyncClient,
    driver: JoinHandle<()>,
    acks: Arc<AckTracker>,
}

/// [`Transport`] backed by rumqttc's MQTT 3.1.1 async client.
pub struct RumqttcTransport {
    session: Mutex<Option<Session>>,
    /// Keeps the ack queue in the same order as the request channel.
    send_lock: Mutex<()>,
    publish_timeout: Duration,
}

impl RumqttcTransport {
    pub fn new(publish_timeout: Duration) -> Self {
        Self {
            session: Mutex::new(None),
            send_lock: Mutex::new(()),
            publish_timeout,
        }
    }

    fn mqtt_options(options: &ConnectOptions) -> MqttOptions {
        let mut mqtt_options =
            MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
        mqtt_options
            .set_keep_alive(options.keep_alive.max(MIN_KEEP_ALIVE))
            .set_clean_session(options.clean_session);

        if let Some(username) = options.username.as_deref().filter(|u| !u.is_empty()) {
            mqtt_options.set_credentials(username, options.password.clone().unwrap_or_default());
        }
        if options.use_tls {
            mqtt_options.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        mqtt_options
    }

    /// Polls until the broker answers the CONNECT packet.
    async fn handshake(eventloop: &mut EventLoop) -> Result<(), TransportError> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return if ack.code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(TransportError::Refused(format!("{:?}", ack.code)))
                    };
                }
                Ok(_) => continue,
                Err(e) => return Err(TransportError::Connect(e.to_string())),
            }
        }
    }

    async fn drive(
        mut eventloop: EventLoop,
        acks: Arc<AckTracker>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) {
        let reason = loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.sent(pkid),
                Ok(Event::Incoming(Packet::PubAck(ack))) => acks.acknowledge(ack.pkid),
                Ok(Event::Incoming(Packet::PubComp(comp))) => acks.acknowledge(comp.pkid),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    break "disconnect requested".to_string();
                }
                Ok(_) => {}
                Err(e) => break e.to_string(),
            }
        };

        acks.fail_all();
        debug!("MQTT event loop stopped: {}", reason);
        let _ = events.send(TransportEvent::ConnectionLost(reason));
    }

    /// Lets in-flight publishes collect their acks, then sends DISCONNECT.
    /// Both phases share one `wait` budget.
    async fn teardown(session: Session, wait: Duration) {
        let Session {
            client,
            mut driver,
            acks,
        } = session;
        let deadline = Instant::now() + wait;

        if tokio::time::timeout_at(deadline, acks.drained()).await.is_err() {
            debug!("Publishes still unacknowledged after {:?}", wait);
        }
        if let Err(e) = client.try_disconnect() {
            debug!("Disconnect request not delivered: {}", e);
        }
        if tokio::time::timeout_at(deadline, &mut driver).await.is_err() {
            warn!("MQTT event loop did not stop within {:?}, aborting", wait);
            driver.abort();
        }
        acks.fail_all();
    }
}

#[async_trait]
impl Transport for RumqttcTransport {
    async fn connect(
        &self,
        options: ConnectOptions,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        if let Some(previous) = self.session.lock().await.take() {
            Self::teardown(previous, Duration::ZERO).await;
        }

        info!(
            "Connecting to MQTT broker {}:{} as {}",
            options.host, options.port, options.client_id
        );
        let (client, mut eventloop) =
            AsyncClient::new(Self::mqtt_options(&options), REQUEST_CAPACITY);

        match tokio::time::timeout(options.connect_timeout, Self::handshake(&mut eventloop)).await
        {
            Err(_) => return Err(TransportError::Timeout),
            Ok(result) => result?,
        }

        let acks = Arc::new(AckTracker::default());
        let _ = events.send(TransportEvent::Connected);
        let driver = tokio::spawn(Self::drive(eventloop, Arc::clone(&acks), events));

        *self.session.lock().await = Some(Session {
            client,
            driver,
            acks,
        });
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        {
            let _ordered = self.send_lock.lock().await;
            let (client, acks) = {
                let session = self.session.lock().await;
                let session = session.as_ref().ok_or(TransportError::NotConnected)?;
                (session.client.clone(), Arc::clone(&session.acks))
            };

            acks.register(tx);
            if let Err(e) = client.publish(topic, qos, false, payload.to_vec()).await {
                acks.abandon_last();
                return Err(TransportError::Publish(e.to_string()));
            }
        }

        match tokio::time::timeout(self.publish_timeout, rx).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Ok(Ok(result)) => result,
        }
    }

    async fn disconnect(&self, wait: Duration) {
        if let Some(session) = self.session.lock().await.take() {
            Self::teardown(session, wait).await;
            info!("Disconnected from MQTT broker");
        }
    }
}
