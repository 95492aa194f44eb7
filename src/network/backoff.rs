use crate::app::config::Constraints;
use crate::domain::NetworkType;
use std::time::Duration;

/// Bounds of one reconnection sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub max_interval: Duration,
    pub coefficient: f64,
}

impl BackoffPolicy {
    /// Used until the first connection succeeds.
    pub fn initial(constraints: &Constraints) -> Self {
        Self {
            max_retries: constraints.max_connection_retries,
            max_interval: constraints.max_connection_retry_interval,
            coefficient: constraints.connection_retry_coefficient,
        }
    }

    /// Used after an established connection dropped.
    pub fn post_premature_disconnection(constraints: &Constraints) -> Self {
        Self {
            max_retries: constraints.max_retries_post_premature_disconnection,
            max_interval: constraints.max_retry_interval_post_premature_disconnection,
            coefficient: constraints.connection_retry_coefficient,
        }
    }

    /// `min((coefficient * network)^attempt seconds, max_interval)`.
    pub fn delay(&self, attempt: u32, network: NetworkType) -> Duration {
        let base = self.coefficient * network.coefficient();
        let seconds = base.powi(attempt.min(i32::MAX as u32) as i32);
        if !seconds.is_finite() || seconds >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(seconds.max(0.0))
        }
    }
}

/// Attempt counter over a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.policy.max_retries
    }

    /// Delay before the next attempt, or `None` once the policy's retry
    /// budget is spent.
    pub fn next_delay(&mut self, network: NetworkType) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.policy.delay(self.attempt, network);
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Switches policy and starts counting from zero.
    pub fn reset_with(&mut self, policy: BackoffPolicy) {
        self.policy = policy;
        self.attempt = 0;
    }
}
