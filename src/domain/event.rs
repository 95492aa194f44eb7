use super::priority::PriorityId;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single telemetry event after classification.
///
/// Immutable once constructed. Events of one priority are ordered by
/// `timestamp`, ties broken by arrival.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub guid: Uuid,
    pub timestamp: DateTime<Utc>,
    pub priority: PriorityId,
    /// Opaque type tag carried on the wire next to the payload.
    pub type_tag: String,
    #[serde(with = "crate::app::config::serde_helpers::hex_bytes")]
    pub payload: Bytes,
}

impl Event {
    pub fn new(priority: impl Into<PriorityId>, type_tag: impl Into<String>, payload: Bytes) -> Self {
        Self {
            guid: Uuid::new_v4(),
            timestamp: Utc::now(),
            priority: priority.into(),
            type_tag: type_tag.into(),
            payload,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Estimated wire size used for batching decisions.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
