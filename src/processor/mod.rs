//! Producer-facing boundary: classify, sample and hand events to the
//! warehouser.

pub mod classifier;
pub mod sampler;

pub use classifier::EventClassifier;
pub use sampler::EventSampler;

use crate::app::config::PipelineConfig;
use crate::domain::Event;
use crate::reliability::PipelineMetrics;
use crate::warehouse::WarehouseHandle;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// An event as submitted by application code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedEvent {
    pub name: String,
    /// Serialized event body.
    pub payload: Bytes,
    /// Defaults to the time of tracking.
    pub timestamp: Option<DateTime<Utc>>,
}

impl TrackedEvent {
    pub fn new(name: impl Into<String>, payload: Bytes) -> Self {
        Self {
            name: name.into(),
            payload,
            timestamp: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Turns tracked events into classified [`Event`]s. Never fails towards the
/// caller; rejected events are counted and dropped.
#[derive(Debug, Clone)]
pub struct EventProcessor {
    classifier: EventClassifier,
    sampler: EventSampler,
    warehouse: WarehouseHandle,
    metrics: Arc<PipelineMetrics>,
}

impl EventProcessor {
    pub fn new(
        config: &PipelineConfig,
        warehouse: WarehouseHandle,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            classifier: EventClassifier::new(&config.classification),
            sampler: EventSampler::new(&config.sampling),
            warehouse,
            metrics,
        }
    }

    pub fn track(&self, tracked: TrackedEvent) {
        let Some(priority) = self.classifier.classify(&tracked.name) else {
            debug!("Dropping unclassified event '{}'", tracked.name);
            self.metrics.record_event_dropped();
            return;
        };
        if !self.sampler.should_track(&tracked.name) {
            return;
        }
        if tracked.payload.is_empty() {
            warn!("Dropping event '{}' with empty payload", tracked.name);
            self.metrics.record_event_dropped();
            return;
        }

        let mut event = Event::new(priority, tracked.name, tracked.payload);
        if let Some(timestamp) = tracked.timestamp {
            event = event.at(timestamp);
        }
        self.warehouse.store(event);
    }
}
