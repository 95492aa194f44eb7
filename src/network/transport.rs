use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Request timeout: {0}")]
    Timeout(String),
    #[error("HTTP error: {status}")]
    Http { status: u16 },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TransportError {
    /// Errors that mean the link itself is gone rather than a single request
    /// being rejected.
    pub fn is_connectivity_loss(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed(_)
                | TransportError::ConnectionLost(_)
                | TransportError::NotConnected
                | TransportError::Timeout(_)
        )
    }
}

/// Asynchronous status reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: Option<String> },
    Error(TransportError),
    Message(Bytes),
    Pong,
}

/// A transport event tagged with the connect attempt it belongs to.
#[derive(Debug, Clone)]
pub struct TransportSignal {
    pub attempt: u64,
    pub event: TransportEvent,
}

/// Status sink handed to [`Connectable::connect`].
///
/// Events from an attempt the connection manager has since abandoned are
/// discarded on arrival.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    attempt: u64,
    sink: mpsc::UnboundedSender<TransportSignal>,
}

impl TransportEvents {
    pub fn new(attempt: u64, sink: mpsc::UnboundedSender<TransportSignal>) -> Self {
        Self { attempt, sink }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.sink.send(TransportSignal {
            attempt: self.attempt,
            event,
        });
    }

    pub fn connected(&self) {
        self.emit(TransportEvent::Connected);
    }

    pub fn disconnected(&self, reason: Option<String>) {
        self.emit(TransportEvent::Disconnected { reason });
    }

    pub fn error(&self, error: TransportError) {
        self.emit(TransportEvent::Error(error));
    }

    pub fn message(&self, payload: Bytes) {
        self.emit(TransportEvent::Message(payload));
    }

    pub fn pong(&self) {
        self.emit(TransportEvent::Pong);
    }
}

/// A concrete wire transport.
///
/// `connect` reports success through `events.connected()`; returning an error
/// fails the attempt. `write` may hand back an inline response body, which is
/// treated like an inbound message.
pub trait Connectable: Send + Sync + 'static {
    fn connect(&self, endpoint: Url, events: TransportEvents) -> BoxFuture<'_, Result<(), TransportError>>;

    fn write(&self, payload: Bytes) -> BoxFuture<'_, Result<Option<Bytes>, TransportError>>;

    fn send_ping(&self, payload: Bytes) -> BoxFuture<'_, Result<(), TransportError>>;

    fn disconnect(&self) -> BoxFuture<'_, ()>;
}

/// The supported transports, selected at construction.
#[derive(Clone)]
pub enum Transport {
    /// Persistent socket; kept alive with pings.
    Websocket(Arc<dyn Connectable>),
    /// Request/response publisher; no pings.
    PubSub(Arc<dyn Connectable>),
}

impl Transport {
    pub fn connectable(&self) -> Arc<dyn Connectable> {
        match self {
            Transport::Websocket(inner) | Transport::PubSub(inner) => Arc::clone(inner),
        }
    }

    pub fn uses_ping(&self) -> bool {
        matches!(self, Transport::Websocket(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Transport::Websocket(_) => "websocket",
            Transport::PubSub(_) => "pubsub",
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Transport").field(&self.kind()).finish()
    }
}
