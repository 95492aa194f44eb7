//! Durable delivery: persisted requests, acknowledgement tracking, retries
//! and pipeline counters.

pub mod metrics;
pub mod request;
pub mod retry;
pub mod store;

pub use metrics::{MetricsError, MetricsSnapshot, PipelineMetrics};
pub use request::EventRequest;
pub use retry::{RetryCommand, RetryHandle, RetryMechanism};
pub use store::RequestStore;
