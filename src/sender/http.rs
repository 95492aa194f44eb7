use crate::network::{Connectable, TransportError, TransportEvents};
use bytes::Bytes;
use flate2::{Compression, write::GzEncoder};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderValue};
use reqwest::{Client, ClientBuilder};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_connections: usize,
    pub keep_alive_timeout: Duration,
    pub user_agent: String,
    pub enable_compression: bool,
    pub publish_path: String,
    pub health_path: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_connections: 4,
            keep_alive_timeout: Duration::from_secs(60),
            user_agent: format!("rask-event-forwarder/{}", env!("CARGO_PKG_VERSION")),
            enable_compression: false,
            publish_path: "/v1/events".to_string(),
            health_path: "/health".to_string(),
        }
    }
}

/// Request/response transport over HTTP.
///
/// `connect` checks the collector's health endpoint; each `write` is one
/// POST whose response body (an ack) is handed back inline.
#[derive(Debug)]
pub struct HttpPublisher {
    client: Client,
    config: PublisherConfig,
    publish_url: RwLock<Option<Url>>,
    connected: AtomicBool,
    requests: AtomicU64,
    failures: AtomicU64,
}

impl HttpPublisher {
    pub fn new(config: PublisherConfig) -> Result<Self, TransportError> {
        let mut builder = ClientBuilder::new()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.max_connections)
            .pool_idle_timeout(config.keep_alive_timeout)
            .user_agent(&config.user_agent);
        if config.enable_compression {
            builder = builder.gzip(true);
        }
        let client = builder
            .build()
            .map_err(|e| TransportError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            publish_url: RwLock::new(None),
            connected: AtomicBool::new(false),
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// `(requests, failures)` since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.requests.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
        )
    }

    async fn check_health(&self, endpoint: &Url) -> Result<Url, TransportError> {
        let health = join(endpoint, &self.config.health_path)?;
        let response = self
            .client
            .get(health.clone())
            .timeout(self.config.connect_timeout)
            .send()
            .await
            .map_err(|e| map_request_error(&e, true))?;

        if !response.status().is_success() {
            return Err(TransportError::Http {
                status: response.status().as_u16(),
            });
        }
        debug!("Collector healthy at {}", health);
        join(endpoint, &self.config.publish_path)
    }

    async fn publish(&self, payload: Bytes) -> Result<Option<Bytes>, TransportError> {
        let url = self.publish_url.read().clone();
        let Some(url) = url else {
            return Err(TransportError::NotConnected);
        };
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        let body = if self.config.enable_compression {
            request = request.header(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            gzip(&payload)?
        } else {
            payload.to_vec()
        };

        self.requests.fetch_add(1, Ordering::Relaxed);
        let response = match request.body(body).send().await {
            Ok(response) => response,
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                return Err(map_request_error(&e, false));
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!("Collector answered HTTP {}", status.as_u16());
            return Err(TransportError::Http {
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| map_request_error(&e, false))?;
        Ok((!body.is_empty()).then_some(body))
    }
}

impl Connectable for HttpPublisher {
    fn connect(&self, endpoint: Url, events: TransportEvents) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let publish_url = self.check_health(&endpoint).await?;
            *self.publish_url.write() = Some(publish_url);
            self.connected.store(true, Ordering::Release);
            info!("HTTP publisher connected to {}", endpoint);
            events.connected();
            Ok(())
        })
    }

    fn write(&self, payload: Bytes) -> BoxFuture<'_, Result<Option<Bytes>, TransportError>> {
        Box::pin(self.publish(payload))
    }

    fn send_ping(&self, _payload: Bytes) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async { Ok(()) })
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.connected.swap(false, Ordering::AcqRel) {
                debug!("HTTP publisher disconnected");
            }
        })
    }
}

fn join(endpoint: &Url, path: &str) -> Result<Url, TransportError> {
    let joined = format!(
        "{}/{}",
        endpoint.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|e| TransportError::InvalidConfig(format!("{}: {}", joined, e)))
}

fn gzip(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(payload)
        .and_then(|()| encoder.finish())
        .map_err(|e| TransportError::InvalidConfig(format!("gzip: {}", e)))
}

fn map_request_error(error: &reqwest::Error, connecting: bool) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(error.to_string())
    } else if let Some(status) = error.status() {
        TransportError::Http {
            status: status.as_u16(),
        }
    } else if connecting {
        TransportError::ConnectionFailed(error.to_string())
    } else {
        TransportError::ConnectionLost(error.to_string())
    }
}
