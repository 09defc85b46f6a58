use super::control::spawn_control_worker;
use super::*;
use crate::persistence::Payload;
use crate::testing::{fast_mqtt_settings, wait_until, MockTransport};
use std::path::Path;

fn config(dir: &Path) -> Arc<SyncConfig> {
    let mut config = SyncConfig::default();
    config.mqtt = fast_mqtt_settings();
    config.outbox.database_path = dir.join("outbox.db");
    config.dispatch.poll_interval_ms = 20;
    config.heartbeat.enabled = false;
    config.service.stop_timeout_ms = 1_000;
    Arc::new(config)
}

async fn pending(service: &SyncService) -> usize {
    let store = service.outbox().unwrap();
    run_blocking(&store, |store| store.count_pending())
        .await
        .unwrap()
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockTransport::new();
    let mut service = SyncService::new(config(dir.path()), mock.clone());

    service.start().await.unwrap();
    service.start().await.unwrap();
    assert!(service.is_running());
    assert!(dir.path().join("outbox.db").exists());

    let broker = service.broker().unwrap();
    wait_until(|| broker.is_connected()).await;
    assert_eq!(mock.connect_count(), 1);

    service.stop().await.unwrap();
    service.stop().await.unwrap();
    assert!(!service.is_running());
    assert_eq!(mock.disconnect_count(), 1);
    assert!(!broker.is_connected());

    let status = service.status().await;
    assert!(!status.running);
    assert!(status.connection.is_none());
}

#[tokio::test]
async fn enqueued_messages_are_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockTransport::new();
    let mut service = SyncService::new(config(dir.path()), mock.clone());

    assert!(matches!(
        service.enqueue("events", Payload::from("early")).await,
        Err(ServiceError::NotRunning)
    ));

    service.start().await.unwrap();
    let id = service
        .enqueue("events/motion", Payload::from(r#"{"data": {"id": "evt-1"}}"#))
        .await
        .unwrap();

    wait_until(|| mock.published().len() == 1).await;
    let store = service.outbox().unwrap();
    wait_until(|| store.get(id).unwrap().unwrap().sent).await;
    assert_eq!(pending(&service).await, 0);

    let status = service.status().await;
    assert!(status.running);
    let health = status.health.unwrap();
    assert_eq!(health.pending, 0);
    assert!(!health.backlog_stale);
    assert_eq!(health.connection, ConnectionState::Connected);
    assert!(status.dispatch.sent >= 1);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn outage_keeps_messages_until_broker_returns() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockTransport::new();
    mock.set_fail_connect(true);
    let mut service = SyncService::new(config(dir.path()), mock.clone());
    service.start().await.unwrap();

    for i in 0..3 {
        service
            .enqueue("events/motion", Payload::from(format!("queued-{}", i)))
            .await
            .unwrap();
    }
    wait_until(|| mock.connect_count() >= 3).await;
    assert!(mock.published().is_empty());
    assert_eq!(pending(&service).await, 3);

    mock.set_fail_connect(false);
    wait_until(|| mock.published().len() == 3).await;
    service.stop().await.unwrap();
}

#[tokio::test]
async fn interrupted_claims_are_delivered_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    // A previous run claimed the row and died before publishing.
    {
        let outbox = SqliteOutbox::open(&config.outbox.database_path).unwrap();
        outbox.migrate().unwrap();
        outbox
            .enqueue("events/motion", &Payload::from("orphan"), true)
            .unwrap();
        assert_eq!(outbox.claim_pending(10).unwrap().len(), 1);
    }

    let mock = MockTransport::new();
    let mut service = SyncService::new(Arc::clone(&config), mock.clone());
    service.start().await.unwrap();

    wait_until(|| mock.published().len() == 1).await;
    assert_eq!(mock.published()[0].payload, b"orphan");
    service.stop().await.unwrap();
}

#[tokio::test]
async fn restart_through_control_handle_resumes_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockTransport::new();
    mock.set_fail_publish(true);
    let mut service = SyncService::new(config(dir.path()), mock.clone());
    service.start().await.unwrap();
    service
        .enqueue("events/motion", Payload::from("retry-me"))
        .await
        .unwrap();
    service.stop().await.unwrap();

    let (control, worker) = spawn_control_worker(Box::new(service));
    mock.set_fail_publish(false);
    control.restart().await.unwrap();
    wait_until(|| mock.published().len() == 1).await;

    let status = control.status().await.unwrap();
    assert!(status.running);

    control.stop().await.unwrap();
    drop(control);
    worker.await.unwrap();
}

#[tokio::test]
async fn unusable_database_path_fails_start() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = (*config(dir.path())).clone();
    // A directory cannot be opened as a database file.
    config.outbox.database_path = dir.path().to_path_buf();
    let mut service = SyncService::new(Arc::new(config), MockTransport::new());

    assert!(matches!(
        service.start().await,
        Err(ServiceError::Storage(_))
    ));
    assert!(!service.is_running());
}

#[tokio::test]
async fn heartbeat_runs_when_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = (*config(dir.path())).clone();
    config.heartbeat.enabled = true;
    config.heartbeat.interval_secs = 1;
    let mock = MockTransport::new();
    let mut service = SyncService::new(Arc::new(config), mock.clone());
    service.start().await.unwrap();

    wait_until(|| {
        mock.published()
            .iter()
            .any(|p| p.topic == "sync-manager/heartbeat")
    })
    .await;
    service.stop().await.unwrap();
}
