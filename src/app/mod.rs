pub mod config;
pub mod logging_system;
pub mod pipeline;
pub mod shutdown;

pub use config::{Config, ConfigError, LogFormat, LogLevel, TransportKind};
pub use logging_system::{LoggingError, LoggingSystem, setup_logging_safe};
pub use pipeline::Pipeline;
pub use shutdown::{ShutdownReason, SignalHandler};

use crate::domain::{AppState, BatteryStatus, DeviceWatch, PipelineError, Reachability};
use crate::network::Transport;
use crate::processor::TrackedEvent;
use crate::sender::HttpPublisher;
use crate::storage::Database;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// How long shutdown waits for in-flight requests to be acknowledged.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// One line of the newline-delimited JSON input.
#[derive(Debug, Deserialize)]
struct InputEvent {
    name: String,
    #[serde(default)]
    properties: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Parses one input line into a tracked event whose payload is the JSON
/// encoding of `properties`.
pub fn parse_input_line(line: &str) -> Result<TrackedEvent, serde_json::Error> {
    let input: InputEvent = serde_json::from_str(line)?;
    let payload = serde_json::to_vec(&input.properties)?;
    let mut event = TrackedEvent::new(input.name, Bytes::from(payload));
    if let Some(timestamp) = input.timestamp {
        event = event.at(timestamp);
    }
    Ok(event)
}

/// Builds the transport selected by `config.transport`. Both kinds are
/// served by the HTTP publisher; `websocket` additionally enables
/// keep-alive pings.
pub fn build_transport(config: &Config) -> Result<Transport, PipelineError> {
    let publisher = Arc::new(HttpPublisher::new(config.publisher_config())?);
    Ok(match config.transport {
        TransportKind::Pubsub => Transport::PubSub(publisher),
        TransportKind::Websocket => Transport::Websocket(publisher),
    })
}

/// The forwarder process: stdin in, collector out.
pub struct App {
    pipeline: Pipeline,
}

impl App {
    pub fn from_config(config: Config) -> Result<Self, PipelineError> {
        info!("Starting rask-event-forwarder v{}", crate::VERSION);
        info!(
            "Configuration: endpoint={}, transport={:?}, storage={}",
            config.endpoint,
            config.transport,
            config.storage_path.display()
        );

        let endpoint = config.endpoint_url()?;
        let transport = build_transport(&config)?;
        let db = Database::open(&config.storage_path)?;
        // A headless forwarder has no device signal sources.
        let device = DeviceWatch::fixed(
            AppState::Active,
            BatteryStatus::default(),
            Reachability::default(),
        );

        let pipeline = Pipeline::start(config.pipeline, endpoint, transport, db, device)?;
        Ok(Self { pipeline })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Tracks stdin lines until EOF or a shutdown signal, then drains and
    /// stops the pipeline.
    pub async fn run(self) -> Result<(), PipelineError> {
        let mut shutdown = SignalHandler::install();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        info!("rask-event-forwarder is reading events from stdin");

        let reason = loop {
            tokio::select! {
                reason = shutdown.wait() => break reason,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.ingest(&line),
                    Ok(None) => break ShutdownReason::InputClosed,
                    Err(e) => {
                        error!("Failed to read stdin: {}", e);
                        break ShutdownReason::InputClosed;
                    }
                },
            }
        };

        info!("Shutting down ({:?})", reason);
        let pending = self.pipeline.drain(DRAIN_TIMEOUT).await;
        if pending > 0 {
            warn!(
                "{} requests still unacknowledged, kept for the next start",
                pending
            );
        }
        self.pipeline.stop().await?;
        info!("rask-event-forwarder stopped.");
        Ok(())
    }

    fn ingest(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match parse_input_line(line) {
            Ok(event) => self.pipeline.track(event),
            Err(e) => warn!("Skipping malformed input line: {}", e),
        }
    }
}
