use crate::domain::{Priority, PriorityId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Delivery, retry and connection limits shared by every pipeline component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    pub max_connection_retries: u32,
    #[serde(with = "super::serde_helpers")]
    pub max_connection_retry_interval: Duration,
    #[serde(with = "super::serde_helpers")]
    pub max_retry_interval_post_premature_disconnection: Duration,
    pub max_retries_post_premature_disconnection: u32,
    #[serde(with = "super::serde_helpers")]
    pub max_ping_interval: Duration,
    pub flush_on_background: bool,
    #[serde(with = "super::serde_helpers")]
    pub connection_termination_timer_wait_time: Duration,
    #[serde(with = "super::serde_helpers")]
    pub max_request_ack_timeout: Duration,
    pub max_retries_per_batch: u32,
    /// Bound on persisted request bytes across all priorities.
    pub max_retry_cache_size: u64,
    #[serde(with = "super::serde_helpers")]
    pub connection_retry_duration: Duration,
    pub min_battery_level_percent: u8,
    pub flush_on_app_launch: bool,
    /// Base of the reconnection backoff, multiplied by the network coefficient.
    pub connection_retry_coefficient: f64,
    #[serde(with = "super::serde_helpers")]
    pub connect_timeout: Duration,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            max_connection_retries: 30,
            max_connection_retry_interval: Duration::from_secs(30),
            max_retry_interval_post_premature_disconnection: Duration::from_secs(30),
            max_retries_post_premature_disconnection: 10,
            max_ping_interval: Duration::from_secs(15),
            flush_on_background: true,
            connection_termination_timer_wait_time: Duration::from_secs(8),
            max_request_ack_timeout: Duration::from_secs(6),
            max_retries_per_batch: 20,
            max_retry_cache_size: 5_000_000,
            connection_retry_duration: Duration::from_secs(3),
            min_battery_level_percent: 10,
            flush_on_app_launch: false,
            connection_retry_coefficient: 1.3,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Event name to priority mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub events: BTreeMap<String, PriorityId>,
    /// Priority for names without an explicit mapping. `None` drops them.
    pub default_priority: Option<PriorityId>,
}

/// Sampling rates in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub default_rate: u8,
    pub overrides: BTreeMap<String, u8>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            default_rate: 100,
            overrides: BTreeMap::new(),
        }
    }
}

/// Everything the pipeline needs, constructed once and handed to each
/// component at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub priorities: Vec<Priority>,
    pub constraints: Constraints,
    pub classification: ClassificationConfig,
    pub sampling: SamplingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            priorities: vec![Priority::default()],
            constraints: Constraints::default(),
            classification: ClassificationConfig {
                events: BTreeMap::new(),
                default_priority: Some(PriorityId::from("realTime")),
            },
            sampling: SamplingConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn priority(&self, id: &PriorityId) -> Option<&Priority> {
        self.priorities.iter().find(|p| &p.identifier == id)
    }
}
