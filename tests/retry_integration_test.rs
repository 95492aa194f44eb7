mod common;

use common::{FakeTransport, Reply, batch, endpoint, eventually, pipeline_config, wait_for_pending};
use rask_event_forwarder::app::config::PipelineConfig;
use rask_event_forwarder::domain::{BatteryStatus, ConnectionState, DeviceSignals, Priority};
use rask_event_forwarder::network::{ConnectionHandle, ConnectionManager, Transport};
use rask_event_forwarder::reliability::{PipelineMetrics, RetryHandle, RetryMechanism};
use rask_event_forwarder::sender::AckCode;
use rask_event_forwarder::storage::Database;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

struct Harness {
    retry: RetryHandle,
    connection: ConnectionHandle,
    signals: DeviceSignals,
    metrics: Arc<PipelineMetrics>,
    tasks: Vec<JoinHandle<()>>,
}

impl Harness {
    fn start(config: &PipelineConfig, db: &Database, transport: Arc<FakeTransport>) -> Self {
        Self::start_with(config, db, transport, DeviceSignals::new())
    }

    fn start_with(
        config: &PipelineConfig,
        db: &Database,
        transport: Arc<FakeTransport>,
        signals: DeviceSignals,
    ) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let (connection, connection_task) = ConnectionManager::spawn(
            endpoint(),
            Transport::PubSub(transport),
            &config.constraints,
            signals.watch(),
            events_tx,
            Arc::clone(&metrics),
        );
        let (retry, retry_task) = RetryMechanism::spawn(
            config,
            db,
            connection.clone(),
            events_rx,
            signals.watch(),
            Arc::clone(&metrics),
        )
        .unwrap();
        Self {
            retry,
            connection,
            signals,
            metrics,
            tasks: vec![retry_task, connection_task],
        }
    }

    async fn shutdown(self) {
        self.retry.stop().await;
        self.connection.stop().await;
        for task in self.tasks {
            task.await.unwrap();
        }
    }
}

fn config() -> PipelineConfig {
    pipeline_config(vec![Priority::new("realTime")])
}

fn low_battery() -> BatteryStatus {
    BatteryStatus {
        level_percent: 4.0,
        charging: Some(false),
    }
}

#[tokio::test(start_paused = true)]
async fn test_acknowledged_request_is_deleted() {
    let transport = FakeTransport::new();
    let db = Database::temporary().unwrap();
    let h = Harness::start(&config(), &db, transport.clone());
    h.connection.connect();

    let sent = batch("realTime", "tap", 64);
    let uuid = sent.uuid();
    h.retry.enqueue(sent);
    wait_for_pending(&h.retry, 0).await;

    let writes = transport.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].req_guid, uuid.to_string());
    assert_eq!(writes[0].events[0].payload.len(), 64);

    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.requests_persisted, 1);
    assert_eq!(snapshot.requests_acked, 1);
    assert_eq!(snapshot.persisted_bytes, 0);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_request_is_dropped_after_retry_budget() {
    let mut config = config();
    config.constraints.max_retries_per_batch = 2;
    let transport = FakeTransport::replying(Reply::Reject(None));
    let db = Database::temporary().unwrap();
    let h = Harness::start(&config, &db, transport.clone());
    h.connection.connect();

    h.retry.enqueue(batch("realTime", "tap", 32));
    wait_for_pending(&h.retry, 0).await;

    // The original send plus two retries.
    assert_eq!(transport.write_count(), 3);
    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.requests_retried, 2);
    assert_eq!(snapshot.requests_dropped, 1);
    assert_eq!(snapshot.requests_acked, 0);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_bad_request_is_dropped_without_retry() {
    let transport = FakeTransport::replying(Reply::BadRequest);
    let db = Database::temporary().unwrap();
    let h = Harness::start(&config(), &db, transport.clone());
    h.connection.connect();

    h.retry.enqueue(batch("realTime", "tap", 32));
    wait_for_pending(&h.retry, 0).await;

    assert_eq!(transport.write_count(), 1);
    assert_eq!(h.metrics.snapshot().requests_retried, 0);
    assert_eq!(h.metrics.snapshot().requests_dropped, 1);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_error_code_follows_failure_path() {
    let transport = FakeTransport::new();
    transport.script([Reply::Reject(Some(AckCode::Unknown))]);
    let db = Database::temporary().unwrap();
    let h = Harness::start(&config(), &db, transport.clone());
    h.connection.connect();

    h.retry.enqueue(batch("realTime", "tap", 32));
    wait_for_pending(&h.retry, 0).await;

    assert_eq!(transport.write_count(), 2);
    assert_eq!(h.metrics.snapshot().requests_retried, 1);
    assert_eq!(h.metrics.snapshot().requests_acked, 1);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_connection_limit_reconnects_without_spending_a_retry() {
    let transport = FakeTransport::new();
    transport.script([Reply::ConnectionLimit]);
    let db = Database::temporary().unwrap();
    let h = Harness::start(&config(), &db, transport.clone());
    h.connection.connect();

    h.retry.enqueue(batch("realTime", "tap", 32));
    wait_for_pending(&h.retry, 0).await;

    assert_eq!(transport.write_count(), 2);
    assert_eq!(transport.connects(), 2);
    assert_eq!(h.metrics.snapshot().requests_retried, 0);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_missing_ack_times_out_and_retries() {
    let mut config = config();
    config.constraints.max_retries_per_batch = 1;
    let transport = FakeTransport::replying(Reply::Silent);
    let db = Database::temporary().unwrap();
    let h = Harness::start(&config, &db, transport.clone());
    h.connection.connect();

    let started = tokio::time::Instant::now();
    h.retry.enqueue(batch("realTime", "tap", 32));
    wait_for_pending(&h.retry, 0).await;

    assert_eq!(transport.write_count(), 2);
    assert!(started.elapsed() >= config.constraints.max_request_ack_timeout * 2);
    assert_eq!(h.metrics.snapshot().requests_dropped, 1);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_low_battery_suppresses_sending_until_recovered() {
    let transport = FakeTransport::new();
    let db = Database::temporary().unwrap();
    let signals = DeviceSignals::new();
    signals.set_battery(low_battery());
    let h = Harness::start_with(&config(), &db, transport.clone(), signals);
    h.connection.connect();

    h.retry.enqueue(batch("realTime", "tap", 32));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.retry.pending().await, 1);
    assert_eq!(transport.write_count(), 0);
    assert_ne!(h.connection.state(), ConnectionState::Connected);

    h.signals.set_battery(BatteryStatus::default());
    wait_for_pending(&h.retry, 0).await;
    assert_eq!(transport.write_count(), 1);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_low_battery_teardown_does_not_spend_retries() {
    let mut config = config();
    config.constraints.max_retries_per_batch = 1;
    let transport = FakeTransport::new();
    transport.hold_writes();
    let db = Database::temporary().unwrap();
    let h = Harness::start(&config, &db, transport.clone());
    h.connection.connect();

    h.retry.enqueue(batch("realTime", "tap", 32));
    for sent in 1..=3 {
        eventually("the request to be in flight", || transport.write_count() == sent).await;
        h.signals.set_battery(low_battery());
        let mut state = h.connection.subscribe();
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        h.signals.set_battery(BatteryStatus::default());
    }

    eventually("the request to be resent", || transport.write_count() == 4).await;
    transport.release_writes();
    wait_for_pending(&h.retry, 0).await;

    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.requests_retried, 0);
    assert_eq!(snapshot.requests_dropped, 0);
    assert_eq!(snapshot.requests_acked, 1);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_requests_are_sent_one_at_a_time_in_order() {
    let transport = FakeTransport::new();
    let db = Database::temporary().unwrap();
    let h = Harness::start(&config(), &db, transport.clone());

    let batches: Vec<_> = (0..4).map(|i| batch("realTime", &format!("e{i}"), 16)).collect();
    let expected: Vec<String> = batches.iter().map(|b| b.uuid().to_string()).collect();
    for b in batches {
        h.retry.enqueue(b);
    }
    assert_eq!(h.retry.pending().await, 4);

    h.connection.connect();
    wait_for_pending(&h.retry, 0).await;

    let sent: Vec<String> = transport.writes().into_iter().map(|e| e.req_guid).collect();
    assert_eq!(sent, expected);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_priority_cache_size_evicts_oldest_requests() {
    // Each single-event request encodes to roughly 150 bytes.
    let config = pipeline_config(vec![Priority::new("realTime").with_max_cache_size(400)]);
    let transport = FakeTransport::new();
    let db = Database::temporary().unwrap();
    let h = Harness::start(&config, &db, transport.clone());

    let batches: Vec<_> = (0..5).map(|i| batch("realTime", &format!("e{i}"), 100)).collect();
    let newest: Vec<String> = batches[3..].iter().map(|b| b.uuid().to_string()).collect();
    for b in batches {
        h.retry.enqueue(b);
    }
    assert_eq!(h.retry.pending().await, 2);
    assert_eq!(h.metrics.snapshot().requests_evicted, 3);
    assert!(h.metrics.snapshot().persisted_bytes <= 400);

    h.connection.connect();
    wait_for_pending(&h.retry, 0).await;
    let sent: Vec<String> = transport.writes().into_iter().map(|e| e.req_guid).collect();
    assert_eq!(sent, newest);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_cache_size_bounds_all_priorities() {
    let mut config = pipeline_config(vec![Priority::new("realTime"), Priority::new("bulk")]);
    config.constraints.max_retry_cache_size = 400;
    let transport = FakeTransport::new();
    let db = Database::temporary().unwrap();
    let h = Harness::start(&config, &db, transport);

    for i in 0..4 {
        let priority = if i % 2 == 0 { "realTime" } else { "bulk" };
        h.retry.enqueue(batch(priority, "tap", 100));
    }

    assert_eq!(h.retry.pending().await, 2);
    assert_eq!(h.metrics.snapshot().requests_evicted, 2);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_requests_survive_restart() {
    let dir = TempDir::new().unwrap();
    let config = config();
    let first = batch("realTime", "first", 16);
    let second = batch("realTime", "second", 16);
    let expected = vec![first.uuid().to_string(), second.uuid().to_string()];

    {
        let db = Database::open(dir.path()).unwrap();
        let h = Harness::start(&config, &db, FakeTransport::unreachable());
        h.retry.enqueue(first);
        h.retry.enqueue(second);
        assert_eq!(h.retry.pending().await, 2);
        h.shutdown().await;
        db.flush().unwrap();
    }

    let db = Database::open(dir.path()).unwrap();
    let transport = FakeTransport::new();
    let h = Harness::start(&config, &db, transport.clone());
    assert_eq!(h.retry.pending().await, 2);

    h.connection.connect();
    wait_for_pending(&h.retry, 0).await;
    let sent: Vec<String> = transport.writes().into_iter().map(|e| e.req_guid).collect();
    assert_eq!(sent, expected);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent() {
    let db = Database::temporary().unwrap();
    let h = Harness::start(&config(), &db, FakeTransport::new());
    h.retry.stop().await;
    h.retry.stop().await;
    assert_eq!(h.retry.pending().await, 0);
    h.shutdown().await;
}
