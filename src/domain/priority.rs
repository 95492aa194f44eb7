use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifier of a delivery class, e.g. `realTime`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriorityId(String);

impl PriorityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PriorityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PriorityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for PriorityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How urgently events of a priority leave the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    /// Buffered and cut by the size or timer trigger.
    #[default]
    Normal,
    /// Buffered, then the whole buffer is cut as soon as an event arrives.
    Immediate,
    /// Sent on its own without buffering or persistence. Dropped when the
    /// link is down.
    Instant,
}

/// One classification channel with its own batching and cache bounds.
///
/// The set of priorities is fixed for the lifetime of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Priority {
    /// Ordering rank, lower is more urgent.
    #[serde(default)]
    pub priority: u32,
    pub identifier: PriorityId,
    /// Byte budget of a single batch. `None` disables the size trigger.
    #[serde(default)]
    pub max_batch_size: Option<usize>,
    /// Timer trigger interval. `None` means the priority is never timer-cut.
    #[serde(default, with = "crate::app::config::serde_helpers::option")]
    pub max_time_between_batches: Option<Duration>,
    /// Bound on persisted request bytes for this priority.
    pub max_cache_size: u64,
    #[serde(default)]
    pub urgency: Urgency,
}

impl Default for Priority {
    fn default() -> Self {
        Self {
            priority: 0,
            identifier: PriorityId::from("realTime"),
            max_batch_size: Some(50_000),
            max_time_between_batches: Some(Duration::from_secs(10)),
            max_cache_size: 5_000_000,
            urgency: Urgency::Normal,
        }
    }
}

impl Priority {
    pub fn new(identifier: impl Into<PriorityId>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    pub fn with_rank(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_batch_size(mut self, bytes: Option<usize>) -> Self {
        self.max_batch_size = bytes;
        self
    }

    pub fn with_interval(mut self, interval: Option<Duration>) -> Self {
        self.max_time_between_batches = interval;
        self
    }

    pub fn with_max_cache_size(mut self, bytes: u64) -> Self {
        self.max_cache_size = bytes;
        self
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }
}
