mod common;

use bytes::Bytes;
use common::{FakeTransport, endpoint, eventually, pipeline_config};
use rask_event_forwarder::app::Pipeline;
use rask_event_forwarder::app::config::PipelineConfig;
use rask_event_forwarder::domain::{
    AppState, BatteryStatus, ConnectionState, DeviceSignals, Event, Priority, PriorityId, Urgency,
};
use rask_event_forwarder::network::Transport;
use rask_event_forwarder::processor::TrackedEvent;
use rask_event_forwarder::storage::Database;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn one_second_priority() -> Priority {
    Priority::new("realTime").with_interval(Some(Duration::from_secs(1)))
}

fn start(
    config: PipelineConfig,
    db: Database,
    transport: Arc<FakeTransport>,
    signals: &DeviceSignals,
) -> Pipeline {
    Pipeline::start(
        config,
        endpoint(),
        Transport::PubSub(transport),
        db,
        signals.watch(),
    )
    .unwrap()
}

async fn wait_connected(pipeline: &Pipeline) {
    let mut state = pipeline.connection().subscribe();
    state
        .wait_for(|s| *s == ConnectionState::Connected)
        .await
        .unwrap();
}

fn tracked(name: &str) -> TrackedEvent {
    TrackedEvent::new(name, Bytes::from(format!(r#"{{"event":"{name}"}}"#)))
}

#[tokio::test(start_paused = true)]
async fn test_timer_delivers_buffered_events_in_one_request() {
    let transport = FakeTransport::new();
    let signals = DeviceSignals::new();
    let pipeline = start(
        pipeline_config(vec![one_second_priority()]),
        Database::temporary().unwrap(),
        transport.clone(),
        &signals,
    );
    wait_connected(&pipeline).await;

    for name in ["open", "tap", "close"] {
        pipeline.track(tracked(name));
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(transport.write_count(), 0);

    eventually("the timer-cut request", || transport.write_count() == 1).await;
    assert_eq!(transport.received_tags(), vec!["open", "tap", "close"]);
    eventually("the acknowledgement", || {
        pipeline.metrics().snapshot().requests_acked == 1
    })
    .await;
    assert_eq!(pipeline.pending_requests().await, 0);

    pipeline.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_drain_flushes_untimed_priority() {
    let transport = FakeTransport::new();
    let signals = DeviceSignals::new();
    let priority = Priority::new("bulk")
        .with_interval(None)
        .with_max_batch_size(None);
    let pipeline = start(
        pipeline_config(vec![priority]),
        Database::temporary().unwrap(),
        transport.clone(),
        &signals,
    );
    wait_connected(&pipeline).await;

    pipeline.store(Event::new("bulk", "first", Bytes::from_static(b"1")));
    pipeline.store(Event::new("bulk", "second", Bytes::from_static(b"2")));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.write_count(), 0);

    assert_eq!(pipeline.drain(Duration::from_secs(5)).await, 0);
    assert_eq!(transport.write_count(), 1);
    assert_eq!(transport.received_tags(), vec!["first", "second"]);

    pipeline.stop().await.unwrap();
    pipeline.stop().await.unwrap();
    assert!(pipeline.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn test_unclassified_and_sampled_out_events_are_not_stored() {
    let transport = FakeTransport::new();
    let signals = DeviceSignals::new();
    let mut config = pipeline_config(vec![one_second_priority()]);
    config.classification.default_priority = None;
    config
        .classification
        .events
        .insert("tap".to_string(), PriorityId::from("realTime"));
    config
        .classification
        .events
        .insert("scroll".to_string(), PriorityId::from("realTime"));
    config.sampling.overrides.insert("scroll".to_string(), 0);

    let pipeline = start(config, Database::temporary().unwrap(), transport.clone(), &signals);
    wait_connected(&pipeline).await;

    pipeline.track(tracked("unknown"));
    pipeline.track(tracked("scroll"));
    pipeline.track(TrackedEvent::new("tap", Bytes::new()));
    pipeline.track(tracked("tap"));
    assert_eq!(pipeline.metrics().snapshot().events_dropped, 2);

    eventually("the tap request", || transport.write_count() == 1).await;
    assert_eq!(transport.received_tags(), vec!["tap"]);
    assert_eq!(pipeline.metrics().snapshot().events_stored, 1);

    pipeline.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_events_tracked_offline_are_delivered_after_restart() {
    let dir = TempDir::new().unwrap();
    let config = pipeline_config(vec![one_second_priority()]);
    let signals = DeviceSignals::new();

    {
        let offline = FakeTransport::unreachable();
        let pipeline = start(
            config.clone(),
            Database::open(dir.path()).unwrap(),
            offline.clone(),
            &signals,
        );
        for name in ["a", "b", "c"] {
            pipeline.track(tracked(name));
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(offline.write_count(), 0);
        assert!(offline.connects() >= 1);

        pipeline.stop().await.unwrap();
    }

    let transport = FakeTransport::new();
    let pipeline = start(
        config,
        Database::open(dir.path()).unwrap(),
        transport.clone(),
        &signals,
    );
    eventually("redelivery", || transport.received_tags().len() == 3).await;
    assert_eq!(transport.received_tags(), vec!["a", "b", "c"]);
    eventually("the acknowledgements", || {
        pipeline.metrics().snapshot().persisted_bytes == 0
    })
    .await;
    assert_eq!(pipeline.pending_requests().await, 0);

    pipeline.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_low_battery_holds_delivery_until_charging() {
    let transport = FakeTransport::new();
    let signals = DeviceSignals::new();
    let pipeline = start(
        pipeline_config(vec![one_second_priority()]),
        Database::temporary().unwrap(),
        transport.clone(),
        &signals,
    );
    wait_connected(&pipeline).await;

    signals.set_battery(BatteryStatus {
        level_percent: 3.0,
        charging: Some(false),
    });
    pipeline.track(tracked("tap"));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.write_count(), 0);
    assert_ne!(pipeline.connection_state(), ConnectionState::Connected);

    signals.set_battery(BatteryStatus {
        level_percent: 3.0,
        charging: Some(true),
    });
    eventually("delivery once charging", || transport.write_count() == 1).await;

    pipeline.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_background_flushes_and_terminates_connection() {
    let transport = FakeTransport::new();
    let signals = DeviceSignals::new();
    let priority = Priority::new("realTime").with_interval(Some(Duration::from_secs(60)));
    let pipeline = start(
        pipeline_config(vec![priority]),
        Database::temporary().unwrap(),
        transport.clone(),
        &signals,
    );
    wait_connected(&pipeline).await;

    pipeline.track(tracked("tap"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    signals.set_app_state(AppState::Background);

    eventually("the background flush", || transport.write_count() == 1).await;
    // Torn down once the termination countdown expires.
    eventually("the connection teardown", || {
        pipeline.connection_state() == ConnectionState::Disconnected
    })
    .await;

    signals.set_app_state(AppState::Active);
    wait_connected(&pipeline).await;
    pipeline.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_urgent_priorities_skip_the_timer() {
    let transport = FakeTransport::new();
    let signals = DeviceSignals::new();
    let mut config = pipeline_config(vec![
        Priority::new("realTime").with_interval(Some(Duration::from_secs(3600))),
        Priority::new("p0")
            .with_urgency(Urgency::Immediate)
            .with_interval(Some(Duration::from_secs(3600))),
        Priority::new("instant").with_urgency(Urgency::Instant),
    ]);
    config
        .classification
        .events
        .insert("purchase".to_string(), PriorityId::from("p0"));
    config
        .classification
        .events
        .insert("crash".to_string(), PriorityId::from("instant"));

    let pipeline = start(config, Database::temporary().unwrap(), transport.clone(), &signals);
    wait_connected(&pipeline).await;

    pipeline.track(tracked("scroll"));
    pipeline.track(tracked("purchase"));
    pipeline.track(tracked("crash"));
    eventually("both urgent requests", || transport.write_count() == 2).await;

    let mut tags = transport.received_tags();
    tags.sort();
    assert_eq!(tags, vec!["crash", "purchase"]);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.write_count(), 2);

    assert_eq!(pipeline.drain(Duration::from_secs(5)).await, 0);
    assert_eq!(transport.received_tags().len(), 3);
    pipeline.stop().await.unwrap();
}
