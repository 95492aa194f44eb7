pub mod service;
pub mod timer;

pub use service::SchedulerService;
pub use timer::{Timer, TimerError, TimerState, TimerTick};
