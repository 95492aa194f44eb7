//! Domain layer for rask-event-forwarder.
//!
//! Contains the canonical types shared across all modules:
//! - `Event`: a classified telemetry event
//! - `Priority` / `PriorityId`: delivery classes
//! - `ConnectionState`: transport lifecycle as observed by the pipeline
//! - device signals (`AppState`, `BatteryStatus`, `Reachability`)
//! - `PipelineError`: Top-level error type

pub mod connection;
pub mod device;
pub mod error;
pub mod event;
pub mod priority;

pub use connection::ConnectionState;
pub use device::{AppState, BatteryStatus, DeviceSignals, DeviceWatch, NetworkType, Reachability};
pub use error::PipelineError;
pub use event::Event;
pub use priority::{Priority, PriorityId, Urgency};
