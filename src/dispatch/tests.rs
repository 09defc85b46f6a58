use super::*;
use crate::config::DispatchSettings;
use crate::dedup::{DedupCache, NoIdExtractor};
use crate::mqtt::transport::{ConnectOptions, Transport, TransportError, TransportEvent};
use crate::persistence::Payload;
use crate::testing::{broker, connected_broker, memory_store, wait_until, MockTransport};
use async_trait::async_trait;
use rumqttc::QoS;
use tokio::sync::mpsc;

fn settings() -> DispatchSettings {
    DispatchSettings {
        poll_interval_ms: 20,
        batch_size: 10,
        stale_sweep_interval_secs: 60,
    }
}

fn polling_loop(
    store: &Arc<dyn OutboxStore>,
    broker: &BrokerClient,
) -> DispatchLoop<Recovering> {
    DispatchLoop::create(
        Arc::clone(store),
        broker.clone(),
        settings(),
        Duration::from_secs(300),
        Arc::new(DispatchStats::default()),
    )
}

fn enqueue(store: &Arc<dyn OutboxStore>, topic: &str, body: &str) -> i64 {
    store.enqueue(topic, &Payload::from(body), false).unwrap()
}

#[tokio::test]
async fn tick_skips_without_connection() {
    let store = memory_store();
    let mock = MockTransport::new();
    let id = enqueue(&store, "events/motion", "a");

    let mut dispatch = polling_loop(&store, &broker(&mock)).recover().await;
    let report = dispatch.tick().await;

    assert!(report.skipped);
    assert_eq!(report.claimed, 0);
    let message = store.get(id).unwrap().unwrap();
    assert!(!message.is_processing());
    assert_eq!(message.retry_count, 0);
    assert_eq!(dispatch.stats().skipped_ticks, 1);
}

#[tokio::test]
async fn tick_delivers_in_claim_order() {
    let store = memory_store();
    let mock = MockTransport::new();
    let broker = connected_broker(&mock).await;
    let ids: Vec<i64> = ["first", "second", "third"]
        .iter()
        .map(|body| enqueue(&store, &format!("events/{}", body), body))
        .collect();

    let mut dispatch = polling_loop(&store, &broker).recover().await;
    let report = dispatch.tick().await;

    assert_eq!(
        report,
        TickReport {
            claimed: 3,
            sent: 3,
            ..Default::default()
        }
    );
    let topics: Vec<String> = mock.published().into_iter().map(|p| p.topic).collect();
    assert_eq!(topics, vec!["events/first", "events/second", "events/third"]);
    for id in ids {
        let message = store.get(id).unwrap().unwrap();
        assert!(message.sent);
        assert_eq!(message.retry_count, 1);
    }
    assert_eq!(store.count_pending().unwrap(), 0);
}

#[tokio::test]
async fn failed_publish_releases_for_next_tick() {
    let store = memory_store();
    let mock = MockTransport::new();
    let broker = connected_broker(&mock).await;
    let id = enqueue(&store, "events/motion", "a");

    mock.set_fail_publish(true);
    let mut dispatch = polling_loop(&store, &broker).recover().await;
    let report = dispatch.tick().await;
    assert_eq!(report.released, 1);
    assert_eq!(report.sent, 0);

    let message = store.get(id).unwrap().unwrap();
    assert!(!message.sent);
    assert!(!message.is_processing());
    assert_eq!(message.retry_count, 1);

    mock.set_fail_publish(false);
    let report = dispatch.tick().await;
    assert_eq!(report.sent, 1);
    assert!(store.get(id).unwrap().unwrap().sent);
    assert_eq!(dispatch.stats().released, 1);
    assert_eq!(dispatch.stats().sent, 1);
}

#[tokio::test]
async fn recovery_releases_claims_from_a_crashed_run() {
    let store = memory_store();
    enqueue(&store, "events/motion", "a");
    enqueue(&store, "events/motion", "b");

    // A previous process claimed both and died before publishing.
    assert_eq!(store.claim_pending(10).unwrap().len(), 2);
    assert!(store.claim_pending(10).unwrap().is_empty());

    let mock = MockTransport::new();
    let broker = connected_broker(&mock).await;
    let mut dispatch = polling_loop(&store, &broker).recover().await;
    let report = dispatch.tick().await;

    assert_eq!(report.sent, 2);
    assert_eq!(mock.published().len(), 2);
}

#[tokio::test]
async fn messages_queued_offline_are_delivered_after_connect() {
    let store = memory_store();
    let mock = MockTransport::new();
    let broker = broker(&mock);
    for i in 0..5 {
        enqueue(&store, "events/motion", &format!("offline-{}", i));
    }

    let token = CancellationToken::new();
    let stats = Arc::new(DispatchStats::default());
    let handle = spawn_dispatch_loop(
        Arc::clone(&store),
        broker.clone(),
        settings(),
        Duration::from_secs(300),
        Arc::clone(&stats),
        token.clone(),
    );

    wait_until(|| stats.snapshot().skipped_ticks >= 2).await;
    assert!(mock.published().is_empty());

    broker.connect().await;
    wait_until(|| store.count_pending().unwrap() == 0).await;
    assert_eq!(mock.published().len(), 5);

    token.cancel();
    handle.await.unwrap();
    assert_eq!(stats.snapshot().sent, 5);
}

#[tokio::test]
async fn duplicate_ids_in_backlog_reach_the_broker_once() {
    let store = memory_store();
    let mock = MockTransport::new();
    let broker = connected_broker(&mock).await;
    let body = r#"{"data": {"id": "evt-1"}}"#;
    let first = enqueue(&store, "events/motion", body);
    let second = enqueue(&store, "events/motion", body);

    let mut dispatch = polling_loop(&store, &broker).recover().await;
    let report = dispatch.tick().await;

    assert_eq!(report.sent, 2);
    assert_eq!(mock.published().len(), 1);
    assert!(store.get(first).unwrap().unwrap().sent);
    assert!(store.get(second).unwrap().unwrap().sent);
}

/// Transport whose publish path panics.
struct PanickingTransport;

#[async_trait]
impl Transport for PanickingTransport {
    async fn connect(
        &self,
        _options: ConnectOptions,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let _ = events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn publish(
        &self,
        _topic: &str,
        _payload: &[u8],
        _qos: QoS,
    ) -> Result<(), TransportError> {
        panic!("encoder exploded");
    }

    async fn disconnect(&self, _wait: Duration) {}
}

#[tokio::test]
async fn panic_during_publish_releases_the_message() {
    let store = memory_store();
    let broker = BrokerClient::new(
        Arc::new(PanickingTransport),
        crate::testing::fast_mqtt_settings(),
        Arc::new(DedupCache::new(Duration::from_secs(30), 10)),
        Arc::new(NoIdExtractor),
    );
    broker.connect().await;
    wait_until(|| broker.is_connected()).await;
    let id = enqueue(&store, "events/motion", "a");

    let mut dispatch = polling_loop(&store, &broker).recover().await;
    let report = dispatch.tick().await;
    assert_eq!(report.released, 1);

    let message = store.get(id).unwrap().unwrap();
    assert!(!message.sent);
    assert!(!message.is_processing());

    // The loop keeps working after the panic.
    let report = dispatch.tick().await;
    assert_eq!(report.claimed, 1);
}

#[tokio::test]
async fn shutdown_returns_stopped_machine() {
    let store = memory_store();
    let mock = MockTransport::new();
    let broker = connected_broker(&mock).await;
    let token = CancellationToken::new();

    let polling = polling_loop(&store, &broker).recover().await;
    let runner = tokio::spawn(polling.run_until_shutdown(token.clone()));
    tokio::time::sleep(Duration::from_millis(60)).await;
    token.cancel();

    let stopped = runner.await.unwrap();
    assert!(stopped.stats().ticks >= 1);
}

#[tokio::test]
async fn periodic_sweep_reclaims_only_expired_claims() {
    let store = memory_store();
    let mock = MockTransport::new();
    let broker = connected_broker(&mock).await;

    let mut dispatch = DispatchLoop::create(
        Arc::clone(&store),
        broker,
        DispatchSettings {
            stale_sweep_interval_secs: 0,
            ..settings()
        },
        Duration::from_millis(100),
        Arc::new(DispatchStats::default()),
    )
    .recover()
    .await;

    // A worker that claimed `stuck` went silent; `busy` was claimed just now.
    let stuck = enqueue(&store, "events/stuck", "stuck");
    assert_eq!(store.claim_pending(10).unwrap().len(), 1);
    tokio::time::sleep(Duration::from_millis(150)).await;
    let busy = enqueue(&store, "events/busy", "busy");
    assert_eq!(store.claim_pending(10).unwrap().len(), 1);

    let report = dispatch.tick().await;

    assert_eq!(report.claimed, 1);
    assert_eq!(report.sent, 1);
    assert!(store.get(stuck).unwrap().unwrap().sent);
    let busy = store.get(busy).unwrap().unwrap();
    assert!(!busy.sent);
    assert!(busy.is_processing());
    let topics: Vec<String> = mock.published().into_iter().map(|p| p.topic).collect();
    assert_eq!(topics, vec!["events/stuck"]);
}
