use super::config::PipelineConfig;
use crate::domain::{ConnectionState, DeviceWatch, Event, PipelineError};
use crate::network::{ConnectionHandle, ConnectionManager, Transport};
use crate::processor::{EventProcessor, TrackedEvent};
use crate::reliability::{PipelineMetrics, RetryHandle, RetryMechanism};
use crate::storage::Database;
use crate::warehouse::{BatchSink, WarehouseHandle, Warehouser};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The running pipeline: processor, warehouser, retry mechanism and
/// connection manager sharing one store.
pub struct Pipeline {
    processor: EventProcessor,
    warehouse: WarehouseHandle,
    retry: RetryHandle,
    connection: ConnectionHandle,
    metrics: Arc<PipelineMetrics>,
    db: Database,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    stopped: AtomicBool,
}

impl Pipeline {
    /// Spawns every actor and starts connecting. Must be called inside a
    /// tokio runtime.
    pub fn start(
        config: PipelineConfig,
        endpoint: Url,
        transport: Transport,
        db: Database,
        device: DeviceWatch,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let metrics = Arc::new(PipelineMetrics::new());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (connection, connection_task) = ConnectionManager::spawn(
            endpoint,
            transport,
            &config.constraints,
            device.clone(),
            events_tx,
            Arc::clone(&metrics),
        );

        let (retry, retry_task) = RetryMechanism::spawn(
            &config,
            &db,
            connection.clone(),
            events_rx,
            device.clone(),
            Arc::clone(&metrics),
        )?;

        let sink: Arc<dyn BatchSink> = Arc::new(retry.clone());
        let (warehouse, warehouse_task) = Warehouser::spawn(
            &config,
            &db,
            sink,
            connection.subscribe(),
            device,
            Arc::clone(&metrics),
        )?;

        let processor = EventProcessor::new(&config, warehouse.clone(), Arc::clone(&metrics));
        connection.connect();

        info!(
            "Pipeline started with {} priorities",
            config.priorities.len()
        );

        Ok(Self {
            processor,
            warehouse,
            retry,
            connection,
            metrics,
            db,
            tasks: Mutex::new(vec![
                ("warehouser", warehouse_task),
                ("retry mechanism", retry_task),
                ("connection manager", connection_task),
            ]),
            stopped: AtomicBool::new(false),
        })
    }

    /// Classifies, samples and stores a producer event.
    pub fn track(&self, event: TrackedEvent) {
        self.processor.track(event);
    }

    /// Stores an already classified event.
    pub fn store(&self, event: Event) {
        self.warehouse.store(event);
    }

    pub fn flush(&self) {
        self.warehouse.flush();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn warehouse(&self) -> &WarehouseHandle {
        &self.warehouse
    }

    pub fn retry(&self) -> &RetryHandle {
        &self.retry
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Number of requests persisted but not yet acknowledged.
    pub async fn pending_requests(&self) -> usize {
        self.retry.pending().await
    }

    /// Stops accepting events, flushes every buffer and waits up to
    /// `timeout` for outstanding requests to be acknowledged. Returns the
    /// number still pending; those stay persisted for the next start.
    pub async fn drain(&self, timeout: Duration) -> usize {
        self.warehouse.stop().await;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let pending = self.retry.pending().await;
            if pending == 0 || tokio::time::Instant::now() >= deadline {
                return pending;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Flushes buffered events into requests, then stops every actor in
    /// upstream-to-downstream order. Repeated calls are no-ops.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Stopping pipeline");

        self.warehouse.stop().await;
        self.retry.stop().await;
        self.connection.stop().await;

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for (name, task) in tasks {
            match tokio::time::timeout(TASK_JOIN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{} task ended abnormally: {}", name, e),
                Err(_) => warn!("{} did not stop within {:?}", name, TASK_JOIN_TIMEOUT),
            }
        }

        self.db.flush()?;
        info!("Pipeline stopped");
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
