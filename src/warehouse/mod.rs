//! The event warehouser: buffering, batch cutting and the forwarding gate.

pub mod sink;
pub mod warehouser;

pub use sink::BatchSink;
#[cfg(test)]
pub use sink::MockBatchSink;
pub use warehouser::{WarehouseCommand, WarehouseHandle, Warehouser};
