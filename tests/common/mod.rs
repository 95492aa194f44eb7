#![allow(dead_code)]

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rask_event_forwarder::app::config::{ClassificationConfig, PipelineConfig};
use rask_event_forwarder::buffer::{BatchTrigger, EventBatch};
use rask_event_forwarder::domain::{Event, Priority, PriorityId};
use rask_event_forwarder::network::{Connectable, TransportError, TransportEvents};
use rask_event_forwarder::reliability::RetryHandle;
use rask_event_forwarder::sender::{AckCode, AckResponse, RequestEnvelope};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use url::Url;
use uuid::Uuid;

/// How the fake collector answers a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Reject(Option<AckCode>),
    BadRequest,
    ConnectionLimit,
    Silent,
    /// Fails the write as if the link went down.
    Drop,
}

/// In-memory collector: scripted connect failures, recorded envelopes and
/// inline acknowledgements.
pub struct FakeTransport {
    connect_failures: AtomicU32,
    connects: AtomicU32,
    connect_times: Mutex<Vec<Instant>>,
    disconnects: AtomicU32,
    default_reply: Mutex<Reply>,
    scripted: Mutex<VecDeque<Reply>>,
    writes: Mutex<Vec<RequestEnvelope>>,
    write_gate: Mutex<Option<Arc<Semaphore>>>,
    pings: Mutex<Vec<Instant>>,
    fail_pings: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Self::replying(Reply::Ack)
    }

    pub fn replying(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            connect_failures: AtomicU32::new(0),
            connects: AtomicU32::new(0),
            connect_times: Mutex::new(Vec::new()),
            disconnects: AtomicU32::new(0),
            default_reply: Mutex::new(reply),
            scripted: Mutex::new(VecDeque::new()),
            writes: Mutex::new(Vec::new()),
            write_gate: Mutex::new(None),
            pings: Mutex::new(Vec::new()),
            fail_pings: AtomicBool::new(false),
        })
    }

    /// A collector that refuses every connection.
    pub fn unreachable() -> Arc<Self> {
        let transport = Self::new();
        transport.fail_connects(u32::MAX);
        transport
    }

    pub fn fail_connects(&self, count: u32) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Replies used, in order, before falling back to the default one.
    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.scripted.lock().extend(replies);
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.default_reply.lock() = reply;
    }

    /// Writes are recorded but not answered until [`Self::release_writes`].
    pub fn hold_writes(&self) {
        *self.write_gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_writes(&self) {
        if let Some(gate) = self.write_gate.lock().take() {
            gate.close();
        }
    }

    /// Makes every ping fail as if the link went down.
    pub fn fail_pings(&self, fail: bool) {
        self.fail_pings.store(fail, Ordering::SeqCst);
    }

    pub fn ping_times(&self) -> Vec<Instant> {
        self.pings.lock().clone()
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Gaps between consecutive connect attempts, in milliseconds.
    pub fn connect_gaps_ms(&self) -> Vec<u128> {
        self.connect_times
            .lock()
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis())
            .collect()
    }

    pub fn last_connect_at(&self) -> Option<Instant> {
        self.connect_times.lock().last().copied()
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<RequestEnvelope> {
        self.writes.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    /// Every event type tag received, in arrival order.
    pub fn received_tags(&self) -> Vec<String> {
        self.writes
            .lock()
            .iter()
            .flat_map(|envelope| envelope.events.iter().map(|e| e.type_tag.clone()))
            .collect()
    }

    fn next_reply(&self) -> Reply {
        self.scripted
            .lock()
            .pop_front()
            .unwrap_or(*self.default_reply.lock())
    }
}

impl Connectable for FakeTransport {
    fn connect(&self, _endpoint: Url, events: TransportEvents) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.connect_times.lock().push(Instant::now());
            let remaining = self.connect_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                if remaining != u32::MAX {
                    self.connect_failures.fetch_sub(1, Ordering::SeqCst);
                }
                return Err(TransportError::ConnectionFailed("connection refused".into()));
            }
            events.connected();
            Ok(())
        })
    }

    fn write(&self, payload: Bytes) -> BoxFuture<'_, Result<Option<Bytes>, TransportError>> {
        Box::pin(async move {
            let envelope = RequestEnvelope::decode(&payload)
                .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
            let guid: Uuid = envelope
                .req_guid
                .parse()
                .map_err(|_| TransportError::InvalidConfig("bad request guid".into()))?;
            self.writes.lock().push(envelope);

            let gate = self.write_gate.lock().clone();
            if let Some(gate) = gate {
                let _ = gate.acquire().await;
            }

            let ack = match self.next_reply() {
                Reply::Ack => AckResponse::success(guid),
                Reply::Reject(code) => AckResponse::error(guid, code),
                Reply::BadRequest => AckResponse::error(guid, Some(AckCode::BadRequest)),
                Reply::ConnectionLimit => {
                    AckResponse::error(guid, Some(AckCode::MaxConnectionLimitReached))
                }
                Reply::Silent => return Ok(None),
                Reply::Drop => return Err(TransportError::ConnectionLost("reset by peer".into())),
            };
            Ok(Some(ack.to_bytes()))
        })
    }

    fn send_ping(&self, _payload: Bytes) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.pings.lock().push(Instant::now());
            if self.fail_pings.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectionLost("ping unanswered".into()));
            }
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        })
    }
}

pub fn endpoint() -> Url {
    Url::parse("http://collector.test").unwrap()
}

/// A pipeline config over `priorities`; every event name maps to the first
/// one.
pub fn pipeline_config(priorities: Vec<Priority>) -> PipelineConfig {
    let default_priority = priorities.first().map(|p| p.identifier.clone());
    PipelineConfig {
        priorities,
        classification: ClassificationConfig {
            default_priority,
            ..ClassificationConfig::default()
        },
        ..PipelineConfig::default()
    }
}

/// A single-event batch whose payload is `payload_len` bytes.
pub fn batch(priority: &str, tag: &str, payload_len: usize) -> EventBatch {
    EventBatch::new(
        PriorityId::from(priority),
        vec![Event::new(priority, tag, Bytes::from(vec![b'x'; payload_len]))],
        BatchTrigger::Timer,
    )
}

/// The wire encoding of `batch`, as the retry mechanism would send it.
pub fn encoded(batch: &EventBatch) -> Bytes {
    RequestEnvelope::from_batch(batch, chrono::Utc::now())
        .encode()
        .unwrap()
}

/// Polls `condition` until it holds, advancing (paused) time in small steps.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut condition: F) {
    for _ in 0..2_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn wait_for_pending(retry: &RetryHandle, expected: usize) {
    for _ in 0..2_000 {
        if retry.pending().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "expected {expected} pending requests, found {}",
        retry.pending().await
    );
}
