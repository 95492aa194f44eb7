use super::groups::PipelineConfig;
use super::{Config, ConfigError};
use std::collections::HashSet;
use std::time::Duration;

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint_url()?;

        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "Request timeout must be greater than 0".to_string(),
            ));
        }

        self.pipeline.validate()
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.priorities.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "At least one priority must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for priority in &self.priorities {
            if !seen.insert(&priority.identifier) {
                return Err(ConfigError::InvalidConfig(format!(
                    "Duplicate priority identifier '{}'",
                    priority.identifier
                )));
            }
            if priority.max_cache_size == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "Priority '{}' needs a max_cache_size greater than 0",
                    priority.identifier
                )));
            }
            if priority.max_batch_size == Some(0) {
                return Err(ConfigError::InvalidConfig(format!(
                    "Priority '{}' has a max_batch_size of 0",
                    priority.identifier
                )));
            }
            if priority.max_time_between_batches == Some(Duration::ZERO) {
                return Err(ConfigError::InvalidConfig(format!(
                    "Priority '{}' has a zero batch interval",
                    priority.identifier
                )));
            }
        }

        let constraints = &self.constraints;
        if constraints.max_request_ack_timeout.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "max_request_ack_timeout must be greater than 0".to_string(),
            ));
        }
        if constraints.connection_retry_duration.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "connection_retry_duration must be greater than 0".to_string(),
            ));
        }
        if constraints.min_battery_level_percent > 100 {
            return Err(ConfigError::InvalidConfig(format!(
                "min_battery_level_percent must be at most 100, got {}",
                constraints.min_battery_level_percent
            )));
        }
        let coefficient = constraints.connection_retry_coefficient;
        if coefficient.is_nan() || coefficient < 1.0 {
            return Err(ConfigError::InvalidConfig(format!(
                "connection_retry_coefficient must be at least 1.0, got {}",
                constraints.connection_retry_coefficient
            )));
        }

        let classified = self
            .classification
            .events
            .values()
            .chain(self.classification.default_priority.iter());
        for priority in classified {
            if self.priority(priority).is_none() {
                return Err(ConfigError::InvalidConfig(format!(
                    "Classification refers to unknown priority '{priority}'"
                )));
            }
        }

        let rates = std::iter::once(("default", self.sampling.default_rate)).chain(
            self.sampling
                .overrides
                .iter()
                .map(|(name, rate)| (name.as_str(), *rate)),
        );
        for (name, rate) in rates {
            if rate > 100 {
                return Err(ConfigError::InvalidConfig(format!(
                    "Sampling rate for '{name}' must be at most 100, got {rate}"
                )));
            }
        }

        Ok(())
    }
}
