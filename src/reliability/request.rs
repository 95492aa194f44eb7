use crate::app::config::serde_helpers::hex_bytes;
use crate::domain::PriorityId;
use crate::storage::{Migration, Persistable, add_column};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The persisted, retry-tracked unit of delivery for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRequest {
    pub guid: Uuid,
    pub priority: PriorityId,
    /// Encoded request envelope.
    #[serde(with = "hex_bytes")]
    pub payload: Bytes,
    /// Last time the request was touched (sent or requeued).
    pub time_stamp: DateTime<Utc>,
    pub retries_made: u32,
    pub created_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub event_count: u32,
}

impl EventRequest {
    pub fn new(
        guid: Uuid,
        priority: PriorityId,
        payload: Bytes,
        event_count: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            guid,
            priority,
            payload,
            time_stamp: now,
            retries_made: 0,
            created_timestamp: now,
            event_count: u32::try_from(event_count).unwrap_or(u32::MAX),
        }
    }

    /// Bytes this request contributes to the cache footprint.
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

fn add_event_count(row: &mut serde_json::Map<String, Value>) {
    add_column(row, "event_count", Value::from(0u32));
}

static MIGRATIONS: [Migration; 1] = [Migration {
    version: "0001_add_event_count",
    apply: add_event_count,
}];

impl Persistable for EventRequest {
    const TABLE: &'static str = "event_requests";

    fn primary_key(&self) -> String {
        self.guid.to_string()
    }

    fn column(&self, name: &str) -> Option<String> {
        match name {
            "guid" => Some(self.guid.to_string()),
            "priority" => Some(self.priority.to_string()),
            "retries_made" => Some(self.retries_made.to_string()),
            _ => None,
        }
    }

    fn migrations() -> &'static [Migration] {
        &MIGRATIONS
    }
}
