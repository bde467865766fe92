use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use syndesis_api::api::changes::testing::{RecordingListener, ScriptedGateway, ScriptedTransport};
use syndesis_api::api::changes::{
    ChangeConfig, ErrorKind, NotificationSource, ResourceKey, StreamState, SubscriberRegistry,
    Suppression,
};
use tokio::time::{Instant, sleep, timeout};

const POLL: Duration = Duration::from_secs(5);

fn config() -> ChangeConfig {
    ChangeConfig {
        poll_interval: POLL,
        freshness_window: Duration::from_secs(30),
        suppression: Suppression::Skip,
        idle_timeout: None,
        ..Default::default()
    }
}

fn registry(gateway: Arc<ScriptedGateway>, transport: Arc<ScriptedTransport>) -> SubscriberRegistry {
    SubscriberRegistry::builder(gateway)
        .transport(transport)
        .config(config())
        .build()
        .unwrap()
}

async fn wait_connected(registry: &SubscriberRegistry) {
    let mut state = registry.stream().unwrap().watch_state();
    state.wait_for(|s| *s == StreamState::Connected).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_poller_takes_over_within_one_interval_when_stream_drops() {
    let gateway = Arc::new(ScriptedGateway::new());
    let transport = Arc::new(ScriptedTransport::new());
    let key = ResourceKey::integrations();
    gateway.set(&key, 1u64, json!([]));
    let conn = transport.open();

    let registry = registry(gateway.clone(), transport.clone());
    let listener = Arc::new(RecordingListener::default());
    let _sub = registry.subscribe(&key, listener.clone());

    let initial = listener.next().await.unwrap();
    assert_eq!(initial.source(), NotificationSource::Poller);
    wait_connected(&registry).await;

    // Pushed and polled copies of the same version collapse into one
    gateway.set(&key, 2u64, json!([{"id": "i1"}]));
    conn.send_change("updated", "integration", None, 2);
    let pushed = listener.next().await.unwrap();
    assert_eq!(pushed.source(), NotificationSource::EventStream);

    // Stream is fresh, so polling stands down
    sleep(POLL * 2 + Duration::from_millis(10)).await;
    assert_eq!(gateway.calls(&key), 1);
    assert!(registry.stats().poller.skipped >= 2);

    gateway.set(&key, 3u64, json!([]));
    conn.close();
    let dropped_at = Instant::now();

    let recovered = timeout(POLL + Duration::from_secs(1), listener.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recovered.version().as_str(), "3");
    assert_eq!(recovered.source(), NotificationSource::Poller);
    assert!(dropped_at.elapsed() <= POLL);
    assert_eq!(listener.versions(), vec!["1", "2", "3"]);
}

#[tokio::test(start_paused = true)]
async fn test_entity_events_refresh_the_collection() {
    let gateway = Arc::new(ScriptedGateway::new());
    let transport = Arc::new(ScriptedTransport::new());
    let key = ResourceKey::connections();
    gateway.set(&key, 2u64, json!([{"id": "c1"}, {"id": "c2"}]));
    let conn = transport.open();

    let registry = registry(gateway.clone(), transport);
    let listener = Arc::new(RecordingListener::default());
    let _sub = registry.subscribe(&key, listener.clone());
    assert_eq!(listener.next().await.unwrap().version().as_str(), "2");
    wait_connected(&registry).await;

    // Entity versions never stand in for the collection's version
    gateway.set(&key, 3u64, json!([{"id": "c1"}, {"id": "c2", "name": "renamed"}]));
    conn.send_change("updated", "connection", Some("c1"), 12);
    conn.send_change("updated", "connection", Some("c2"), 3);
    let refreshed = timeout(POLL / 2, listener.next()).await.unwrap().unwrap();
    assert_eq!(refreshed.version().as_str(), "3");
    assert_eq!(refreshed.source(), NotificationSource::Poller);

    gateway.set(&key, 4u64, json!([]));
    conn.close();
    let caught_up = timeout(POLL + Duration::from_secs(1), listener.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(caught_up.version().as_str(), "4");
    assert_eq!(listener.versions(), vec!["2", "3", "4"]);
    assert!(registry.stats().poller.refreshes >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_alone_do_not_suppress_polling() {
    let gateway = Arc::new(ScriptedGateway::new());
    let transport = Arc::new(ScriptedTransport::new());
    let metrics = ResourceKey::integration_metrics();
    let integrations = ResourceKey::integrations();
    gateway.set(&metrics, 1u64, json!({"errors": 0}));
    gateway.set(&integrations, 1u64, json!([]));
    let conn = transport.open();

    let registry = registry(gateway.clone(), transport);
    let listener = Arc::new(RecordingListener::default());
    let _metrics = registry.subscribe(&metrics, listener.clone());
    let _integrations = registry.subscribe(&integrations, Arc::new(RecordingListener::default()));
    assert_eq!(listener.next().await.unwrap().version().as_str(), "1");
    wait_connected(&registry).await;

    gateway.set(&metrics, 2u64, json!({"errors": 1}));
    for version in 2..5u64 {
        conn.heartbeat();
        conn.send_change("updated", "integration", None, version);
        sleep(Duration::from_secs(2)).await;
    }

    assert_eq!(listener.versions(), vec!["1", "2"]);
    assert!(gateway.calls(&metrics) >= 2);
    assert_eq!(gateway.calls(&integrations), 1);
    assert!(registry.stats().poller.skipped >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_failing_subscriber_does_not_affect_others() {
    let gateway = Arc::new(ScriptedGateway::new());
    let transport = Arc::new(ScriptedTransport::new());
    let key = ResourceKey::connection("c9");
    gateway.set(&key, 1u64, json!({"id": "c9"}));
    let conn = transport.open();

    let registry = registry(gateway, transport);
    let mut errors = registry.errors();
    let bad = Arc::new(RecordingListener::failing());
    let good = Arc::new(RecordingListener::default());
    let _bad = registry.subscribe(&key, bad.clone());
    let _good = registry.subscribe(&key, good.clone());

    good.next().await.unwrap();
    wait_connected(&registry).await;
    conn.send_change("created", "connection", Some("c9"), 2);
    conn.send_change("updated", "connection", Some("c9"), 3);
    good.next().await.unwrap();
    good.next().await.unwrap();

    assert_eq!(good.versions(), vec!["1", "2", "3"]);
    assert_eq!(bad.versions(), vec!["1", "2", "3"]);
    for _ in 0..3 {
        assert_eq!(errors.recv().await.unwrap().kind, ErrorKind::Subscriber);
    }
    assert_eq!(registry.stats().broker.subscriber_failures, 3);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_stops_work_for_the_key() {
    let gateway = Arc::new(ScriptedGateway::new());
    let transport = Arc::new(ScriptedTransport::new());
    let key = ResourceKey::extensions();
    gateway.set(&key, 1u64, json!([]));
    let _conn = transport.open();

    let registry = registry(gateway.clone(), transport);
    let listener = Arc::new(RecordingListener::default());
    let sub = registry.subscribe(&key, listener.clone());
    listener.next().await.unwrap();
    assert_eq!(registry.stream().unwrap().topics(), vec![key.clone()]);

    assert!(sub.dispose());
    assert!(!sub.dispose());
    assert!(registry.stream().unwrap().topics().is_empty());

    let calls = gateway.calls(&key);
    gateway.set(&key, 2u64, json!([]));
    sleep(POLL * 10).await;
    assert_eq!(gateway.calls(&key), calls);
    assert_eq!(listener.versions(), vec!["1"]);

    let stats = registry.stats();
    assert_eq!(stats.active_keys, 0);
    assert_eq!(stats.broker.tracked_keys, 0);
    assert_eq!(stats.poller.active_keys, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_the_stream() {
    let gateway = Arc::new(ScriptedGateway::new());
    let transport = Arc::new(ScriptedTransport::new());
    let key = ResourceKey::integrations();
    gateway.set(&key, 1u64, json!([]));
    let _conn = transport.open();

    let registry = registry(gateway, transport.clone());
    let _sub = registry.subscribe(&key, Arc::new(RecordingListener::default()));
    wait_connected(&registry).await;

    registry.shutdown();
    assert_eq!(registry.stream().unwrap().state(), StreamState::Stopped);
    sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.attempts(), 1);
}
