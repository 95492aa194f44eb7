use super::groups::PipelineConfig;
use super::serde_helpers::{load_env_path, load_env_path_opt, load_env_string, load_env_var};
use super::{ConfigError, LogFormat, LogLevel, TransportKind};
use crate::sender::PublisherConfig;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Collector endpoint URL
    #[arg(long, env = "RASK_ENDPOINT", default_value = "http://rask-collector:9700")]
    pub endpoint: String,

    /// Directory of the persistent event and request store
    #[arg(
        long,
        env = "RASK_STORAGE_PATH",
        default_value = "/tmp/rask-event-forwarder/store"
    )]
    pub storage_path: PathBuf,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", default_value = "compact")]
    pub log_format: LogFormat,

    /// Transport used to reach the collector
    #[arg(long, env = "RASK_TRANSPORT", default_value = "pubsub")]
    pub transport: TransportKind,

    /// Configuration file path (optional); supplies the pipeline section
    #[arg(long, env = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Enable gzip compression of request bodies
    #[arg(long, env = "ENABLE_COMPRESSION")]
    pub enable_compression: bool,

    /// Per-request timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "30000")]
    pub request_timeout_ms: u64,

    /// Derived from `request_timeout_ms`
    #[serde(skip)]
    #[arg(skip)]
    pub request_timeout: Duration,

    /// Priorities, constraints, classification and sampling (file only)
    #[arg(skip)]
    pub pipeline: PipelineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "http://rask-collector:9700".to_string(),
            storage_path: PathBuf::from("/tmp/rask-event-forwarder/store"),
            log_level: LogLevel::Info,
            log_format: LogFormat::Compact,
            transport: TransportKind::Pubsub,
            config_file: None,
            enable_compression: false,
            request_timeout_ms: 30_000,
            request_timeout: Duration::from_secs(30),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Config {
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Config::parse_from(args);
        config.load_pipeline_file()?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        // Inline TOML takes precedence over individual variables.
        if let Ok(rask_config) = std::env::var("RASK_CONFIG") {
            return Self::from_rask_config_env(&rask_config);
        }

        let mut config = Config::default();
        load_env_string("RASK_ENDPOINT", &mut config.endpoint);
        load_env_path("RASK_STORAGE_PATH", &mut config.storage_path);

        if let Ok(log_level) = std::env::var("LOG_LEVEL") {
            config.log_level = LogLevel::from_str(&log_level, true)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {log_level}")))?;
        }
        if let Ok(log_format) = std::env::var("LOG_FORMAT") {
            config.log_format = LogFormat::from_str(&log_format, true).map_err(|_| {
                ConfigError::EnvError(format!(
                    "Invalid LOG_FORMAT: {log_format}. Valid values: compact, json"
                ))
            })?;
        }
        if let Ok(transport) = std::env::var("RASK_TRANSPORT") {
            config.transport = TransportKind::from_str(&transport, true).map_err(|_| {
                ConfigError::EnvError(format!(
                    "Invalid RASK_TRANSPORT: {transport}. Valid values: pubsub, websocket"
                ))
            })?;
        }

        load_env_path_opt("CONFIG_FILE", &mut config.config_file);
        load_env_var("ENABLE_COMPRESSION", &mut config.enable_compression)?;
        load_env_var("REQUEST_TIMEOUT_MS", &mut config.request_timeout_ms)?;

        config.load_pipeline_file()?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_rask_config_env(rask_config: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(rask_config)?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn post_process(&mut self) -> Result<(), ConfigError> {
        self.request_timeout = Duration::from_millis(self.request_timeout_ms);
        Ok(())
    }

    pub fn endpoint_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.endpoint).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid endpoint URL '{}': {}", self.endpoint, e))
        })
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            timeout: self.request_timeout,
            connect_timeout: self.pipeline.constraints.connect_timeout,
            enable_compression: self.enable_compression,
            ..PublisherConfig::default()
        }
    }

    /// Replaces the pipeline section with the one from `config_file`, if set.
    fn load_pipeline_file(&mut self) -> Result<(), ConfigError> {
        let Some(path) = &self.config_file else {
            return Ok(());
        };
        let content = std::fs::read_to_string(path)?;
        let file: Config = toml::from_str(&content)?;
        self.pipeline = file.pipeline;
        Ok(())
    }
}
