use super::config::{LogFormat, LogLevel};
use clap::ValueEnum;
use parking_lot::RwLock;
use std::sync::OnceLock;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoggingError {
    #[error("Invalid log directive '{directive}': {reason}")]
    InvalidDirective { directive: String, reason: String },
    #[error("Failed to initialize logging: {0}")]
    InitFailed(String),
}

/// A `target=level` filter entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDirective {
    pub target: String,
    pub level: LogLevel,
}

impl LogDirective {
    pub fn new(target: impl Into<String>, level: LogLevel) -> Self {
        Self {
            target: target.into(),
            level,
        }
    }

    pub fn parse(directive: &str) -> Result<Self, LoggingError> {
        let invalid = |reason: &str| LoggingError::InvalidDirective {
            directive: directive.to_string(),
            reason: reason.to_string(),
        };
        let (target, level) = directive
            .split_once('=')
            .ok_or_else(|| invalid("expected target=level"))?;
        if target.trim().is_empty() {
            return Err(invalid("empty target"));
        }
        let level = LogLevel::from_str(level.trim(), true).map_err(|_| invalid("unknown level"))?;
        Ok(Self::new(target.trim(), level))
    }

    pub fn to_filter_string(&self) -> String {
        format!("{}={}", self.target, self.level.as_str())
    }
}

/// Collects per-target directives and installs the global subscriber.
pub struct LoggingSystem {
    directives: RwLock<Vec<LogDirective>>,
}

impl LoggingSystem {
    pub fn new() -> Self {
        Self {
            directives: RwLock::new(Vec::new()),
        }
    }

    /// Adds a `target=level` directive. Malformed directives are skipped
    /// with a warning on stderr, since logging is not up yet.
    pub fn add_directive(&self, directive: &str) -> Result<(), LoggingError> {
        match LogDirective::parse(directive) {
            Ok(parsed) => {
                self.directives.write().push(parsed);
                Ok(())
            }
            Err(e) => {
                eprintln!("Warning: {}, skipping directive", e);
                Err(e)
            }
        }
    }

    /// Quiets chatty dependencies.
    pub fn add_default_directives(&self) {
        let mut directives = self.directives.write();
        for target in ["sled", "reqwest", "hyper", "hyper_util"] {
            directives.push(LogDirective::new(target, LogLevel::Warn));
        }
    }

    pub fn build_filter_string(&self, default_level: LogLevel) -> String {
        let directives = self.directives.read();
        std::iter::once(default_level.as_str().to_string())
            .chain(directives.iter().map(LogDirective::to_filter_string))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Installs the global subscriber. `RUST_LOG`, when set, replaces the
    /// built filter.
    pub fn initialize(&self, level: LogLevel, format: LogFormat) -> Result<(), LoggingError> {
        let filter = match std::env::var("RUST_LOG") {
            Ok(from_env) if !from_env.trim().is_empty() => EnvFilter::try_new(&from_env),
            _ => EnvFilter::try_new(self.build_filter_string(level)),
        }
        .map_err(|e| LoggingError::InitFailed(format!("invalid filter: {e}")))?;

        let registry = tracing_subscriber::registry().with(filter);
        let installed = match format {
            LogFormat::Compact => registry
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_level(true)
                        .compact(),
                )
                .try_init(),
            LogFormat::Json => registry
                .with(fmt::layer().json().with_target(true).with_current_span(false))
                .try_init(),
        };
        installed.map_err(|e| LoggingError::InitFailed(e.to_string()))
    }

    pub fn directive_count(&self) -> usize {
        self.directives.read().len()
    }
}

impl Default for LoggingSystem {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs logging at most once per process. Later calls return the
/// outcome of the first one.
pub fn setup_logging_safe(level: LogLevel, format: LogFormat) -> Result<(), LoggingError> {
    static INIT: OnceLock<Result<(), LoggingError>> = OnceLock::new();

    INIT.get_or_init(|| {
        let system = LoggingSystem::new();
        system.add_default_directives();
        system.initialize(level, format)
    })
    .clone()
}
