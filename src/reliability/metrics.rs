#[cfg(feature = "metrics")]
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[cfg(feature = "metrics")]
    #[error("Prometheus error: {0}")]
    PrometheusError(#[from] prometheus::Error),
    #[error("Metrics encoding error: {0}")]
    EncodingError(String),
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub events_stored: u64,
    pub events_dropped: u64,
    pub batches_cut: u64,
    pub batches_forwarded: u64,
    pub requests_persisted: u64,
    pub requests_sent: u64,
    pub requests_acked: u64,
    pub requests_retried: u64,
    pub requests_dropped: u64,
    pub requests_evicted: u64,
    pub connect_attempts: u64,
    pub connections_established: u64,
    pub persisted_bytes: u64,
}

/// Lock-free counters shared by every pipeline component.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    events_stored: AtomicU64,
    events_dropped: AtomicU64,
    batches_cut: AtomicU64,
    batches_forwarded: AtomicU64,
    requests_persisted: AtomicU64,
    requests_sent: AtomicU64,
    requests_acked: AtomicU64,
    requests_retried: AtomicU64,
    requests_dropped: AtomicU64,
    requests_evicted: AtomicU64,
    connect_attempts: AtomicU64,
    connections_established: AtomicU64,
    persisted_bytes: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event_stored(&self) {
        self.events_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_cut(&self) {
        self.batches_cut.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_forwarded(&self) {
        self.batches_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_persisted(&self) {
        self.requests_persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_acked(&self) {
        self.requests_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_retried(&self) {
        self.requests_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_dropped(&self) {
        self.requests_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requests_evicted(&self, count: usize) {
        self.requests_evicted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_persisted_bytes(&self, bytes: u64) {
        self.persisted_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_stored: self.events_stored.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            batches_cut: self.batches_cut.load(Ordering::Relaxed),
            batches_forwarded: self.batches_forwarded.load(Ordering::Relaxed),
            requests_persisted: self.requests_persisted.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            requests_acked: self.requests_acked.load(Ordering::Relaxed),
            requests_retried: self.requests_retried.load(Ordering::Relaxed),
            requests_dropped: self.requests_dropped.load(Ordering::Relaxed),
            requests_evicted: self.requests_evicted.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            persisted_bytes: self.persisted_bytes.load(Ordering::Relaxed),
        }
    }

    /// Renders the current counters in Prometheus text format.
    #[cfg(feature = "metrics")]
    pub fn export_prometheus(&self) -> Result<String, MetricsError> {
        let snapshot = self.snapshot();
        let registry = Registry::new();

        let counters = [
            ("rask_events_stored_total", "Events accepted into a buffer", snapshot.events_stored),
            ("rask_events_dropped_total", "Events dropped before buffering", snapshot.events_dropped),
            ("rask_batches_cut_total", "Batches cut from event buffers", snapshot.batches_cut),
            ("rask_batches_forwarded_total", "Batches handed to the retry mechanism", snapshot.batches_forwarded),
            ("rask_requests_persisted_total", "Requests written to the retry store", snapshot.requests_persisted),
            ("rask_requests_sent_total", "Request transmissions, including resends", snapshot.requests_sent),
            ("rask_requests_acked_total", "Requests acknowledged by the collector", snapshot.requests_acked),
            ("rask_requests_retried_total", "Failed or timed out transmissions requeued", snapshot.requests_retried),
            ("rask_requests_dropped_total", "Requests dropped after exhausting retries", snapshot.requests_dropped),
            ("rask_requests_evicted_total", "Requests evicted by cache bounds", snapshot.requests_evicted),
            ("rask_connect_attempts_total", "Transport connect attempts", snapshot.connect_attempts),
            ("rask_connections_established_total", "Successful transport connections", snapshot.connections_established),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::new(name, help)?;
            counter.inc_by(value);
            registry.register(Box::new(counter))?;
        }

        let persisted = IntGauge::new("rask_persisted_request_bytes", "Bytes held in the retry store")?;
        persisted.set(snapshot.persisted_bytes as i64);
        registry.register(Box::new(persisted))?;

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = PipelineMetrics::new();
        metrics.record_event_stored();
        metrics.record_event_stored();
        metrics.record_requests_evicted(3);
        metrics.set_persisted_bytes(1024);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_stored, 2);
        assert_eq!(snapshot.requests_evicted, 3);
        assert_eq!(snapshot.persisted_bytes, 1024);
        assert_eq!(snapshot.requests_acked, 0);
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_prometheus_export_contains_counters() {
        let metrics = PipelineMetrics::new();
        metrics.record_request_acked();
        let text = metrics.export_prometheus().unwrap();
        assert!(text.contains("rask_requests_acked_total 1"));
        assert!(text.contains("rask_persisted_request_bytes 0"));
    }
}
