use crate::app::config::SamplingConfig;
use rand::Rng;
use std::collections::HashMap;

/// Per-event-name sampling, rates in percent.
#[derive(Debug, Clone)]
pub struct EventSampler {
    default_rate: u8,
    overrides: HashMap<String, u8>,
}

impl EventSampler {
    pub fn new(config: &SamplingConfig) -> Self {
        Self {
            default_rate: config.default_rate.min(100),
            overrides: config
                .overrides
                .iter()
                .map(|(name, rate)| (name.clone(), (*rate).min(100)))
                .collect(),
        }
    }

    pub fn rate(&self, name: &str) -> u8 {
        self.overrides
            .get(name)
            .copied()
            .unwrap_or(self.default_rate)
    }

    pub fn should_track(&self, name: &str) -> bool {
        match self.rate(name) {
            0 => false,
            100 => true,
            rate => rand::rng().random_range(1..=100u8) <= rate,
        }
    }
}
