//! Per-priority event buffering and batch formation.

pub mod batch;
pub mod queue;
pub mod regulator;

pub use batch::{BatchTrigger, EventBatch};
pub use queue::{CutLimit, EventBuffer};
pub use regulator::BatchSizeRegulator;
