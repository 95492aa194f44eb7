use thiserror::Error;

/// Top-level error type for the event pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::app::config::ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::network::TransportError),

    #[error("Component stopped: {0}")]
    Stopped(&'static str),

    #[error("Shutdown error: {0}")]
    Shutdown(String),
}
