use super::metrics::PipelineMetrics;
use super::request::EventRequest;
use super::store::RequestStore;
use crate::app::config::{Constraints, PipelineConfig};
use crate::buffer::EventBatch;
use crate::domain::{ConnectionState, DeviceWatch, PipelineError, Priority, PriorityId};
use crate::network::{ConnectionEvent, ConnectionHandle};
use crate::scheduler::{Timer, TimerTick};
use crate::sender::{AckCode, AckResponse, AckStatus, RequestEnvelope};
use crate::storage::Database;
use crate::warehouse::BatchSink;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug)]
pub enum RetryCommand {
    Enqueue(EventBatch),
    AckTimeout { priority: PriorityId, tick: TimerTick },
    Pending(oneshot::Sender<usize>),
    Stop(oneshot::Sender<()>),
}

/// Sending side of a running [`RetryMechanism`].
#[derive(Debug, Clone)]
pub struct RetryHandle {
    commands: mpsc::UnboundedSender<RetryCommand>,
    connection: ConnectionHandle,
}

impl RetryHandle {
    /// Serializes, persists and (when possible) sends the batch.
    pub fn enqueue(&self, batch: EventBatch) {
        if self.commands.send(RetryCommand::Enqueue(batch)).is_err() {
            debug!("Retry mechanism stopped, batch discarded");
        }
    }

    /// Number of persisted requests not yet acknowledged.
    pub async fn pending(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(RetryCommand::Pending(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Cancels ack timers and ends the task. Unacknowledged requests stay
    /// persisted for the next start. Idempotent.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(RetryCommand::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl BatchSink for RetryHandle {
    fn forward(&self, batch: EventBatch) {
        self.enqueue(batch);
    }

    fn ensure_connected(&self) {
        self.connection.connect();
    }

    fn force_reconnect(&self) {
        self.connection.force_reconnect();
    }
}

struct InFlight {
    guid: Uuid,
}

/// Owns outgoing requests from persistence to acknowledgement.
///
/// Per priority, requests leave in creation order and at most one is in
/// flight; the in-flight request is always the oldest of its queue.
pub struct RetryMechanism {
    priorities: BTreeMap<PriorityId, Priority>,
    constraints: Constraints,
    store: RequestStore,
    in_flight: BTreeMap<PriorityId, InFlight>,
    ack_timers: BTreeMap<PriorityId, Timer<RetryCommand>>,
    connection: ConnectionHandle,
    connection_state: watch::Receiver<ConnectionState>,
    device: DeviceWatch,
    metrics: Arc<PipelineMetrics>,
}

impl RetryMechanism {
    pub fn spawn(
        config: &PipelineConfig,
        db: &Database,
        connection: ConnectionHandle,
        connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
        device: DeviceWatch,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<(RetryHandle, JoinHandle<()>), PipelineError> {
        let dao = db.create_table::<EventRequest>()?;
        let store = RequestStore::load(dao, &config.priorities);
        metrics.set_persisted_bytes(store.total_bytes());

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let ack_timers = config
            .priorities
            .iter()
            .map(|p| {
                (
                    p.identifier.clone(),
                    Timer::new("ack-timeout", commands_tx.clone()),
                )
            })
            .collect();

        let mechanism = Self {
            priorities: config
                .priorities
                .iter()
                .map(|p| (p.identifier.clone(), p.clone()))
                .collect(),
            constraints: config.constraints.clone(),
            store,
            in_flight: BTreeMap::new(),
            ack_timers,
            connection_state: connection.subscribe(),
            connection: connection.clone(),
            device,
            metrics,
        };

        let task = tokio::spawn(mechanism.run(commands_rx, connection_events));
        let handle = RetryHandle {
            commands: commands_tx,
            connection,
        };
        Ok((handle, task))
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<RetryCommand>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        info!(
            "Retry mechanism started with {} persisted requests",
            self.store.len()
        );
        let _ = self.connection_state.borrow_and_update();
        let _ = self.device.battery.borrow_and_update();
        self.pump_all();

        loop {
            tokio::select! {
                Some(command) = commands.recv() => match command {
                    RetryCommand::Enqueue(batch) => self.enqueue(batch),
                    RetryCommand::AckTimeout { priority, tick } => self.on_ack_timeout(priority, tick),
                    RetryCommand::Pending(reply) => {
                        let _ = reply.send(self.store.len());
                    }
                    RetryCommand::Stop(reply) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                },
                Some(event) = events.recv() => self.on_connection_event(event),
                Ok(()) = self.connection_state.changed() => {
                    let state = *self.connection_state.borrow_and_update();
                    self.on_connection_state(state);
                }
                Ok(()) = self.device.battery.changed() => {
                    let _ = self.device.battery.borrow_and_update();
                    if !self.battery_low() {
                        self.pump_all();
                    }
                }
                else => break,
            }
        }

        info!("Retry mechanism stopped");
    }

    fn enqueue(&mut self, batch: EventBatch) {
        if batch.is_empty() {
            return;
        }
        let priority = batch.priority().clone();
        let Some(config) = self.priorities.get(&priority) else {
            warn!("Dropping batch {} for unknown priority {}", batch.uuid(), priority);
            self.metrics.record_request_dropped();
            return;
        };
        let max_cache_size = config.max_cache_size;

        let now = Utc::now();
        let payload = match RequestEnvelope::from_batch(&batch, now).encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping batch {}: {}", batch.uuid(), e);
                self.metrics.record_request_dropped();
                return;
            }
        };

        let request = EventRequest::new(batch.uuid(), priority.clone(), payload, batch.len(), now);
        debug!(
            "Persisted request {} ({} events, {} bytes) for {}",
            request.guid,
            request.event_count,
            request.size(),
            priority
        );
        self.store.push(request);
        self.metrics.record_request_persisted();

        let mut evicted = self.store.evict_priority(&priority, max_cache_size);
        evicted.extend(self.store.evict_global(self.constraints.max_retry_cache_size));
        if !evicted.is_empty() {
            warn!(
                "Evicted {} requests to stay within cache bounds",
                evicted.len()
            );
            self.metrics.record_requests_evicted(evicted.len());
            for request in &evicted {
                self.release_if_in_flight(&request.priority, request.guid);
            }
        }
        self.metrics.set_persisted_bytes(self.store.total_bytes());

        self.pump(&priority);
        for request in &evicted {
            self.pump(&request.priority);
        }
    }

    /// Sends the oldest request of `priority` if the link allows it and
    /// nothing is in flight for it.
    fn pump(&mut self, priority: &PriorityId) {
        if !self.connection_state.borrow().is_connected() || self.battery_low() {
            return;
        }
        if self.in_flight.contains_key(priority) {
            return;
        }

        while let Some(mut request) = self.store.front(priority).cloned() {
            let now = Utc::now();
            let payload = match RequestEnvelope::refresh_sent_time(&request.payload, now) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Dropping undecodable request {}: {}", request.guid, e);
                    self.store.remove(request.guid);
                    self.metrics.record_request_dropped();
                    continue;
                }
            };
            request.payload = payload.clone();
            request.time_stamp = now;
            let guid = request.guid;
            self.store.update(request);

            self.connection.write(guid, payload);
            self.in_flight.insert(priority.clone(), InFlight { guid });
            if let Some(timer) = self.ack_timers.get_mut(priority) {
                let id = priority.clone();
                timer.rearm_once(self.constraints.max_request_ack_timeout, move |tick| {
                    RetryCommand::AckTimeout { priority: id, tick }
                });
            }
            self.metrics.record_request_sent();
            debug!("Sent request {} for {}", guid, priority);
            return;
        }
    }

    fn pump_all(&mut self) {
        for priority in self.store.priorities() {
            self.pump(&priority);
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Inbound(bytes) => match AckResponse::parse(&bytes) {
                Ok(ack) => self.on_ack(ack),
                Err(e) => debug!("Ignoring inbound message that is not an ack: {}", e),
            },
            ConnectionEvent::WriteFailed { guid, error } => {
                if let Some(priority) = self.in_flight_priority(guid) {
                    if self.battery_low() {
                        self.hold_for_battery(&priority, guid);
                    } else {
                        self.fail(&priority, guid, &error.to_string());
                    }
                }
            }
        }
    }

    fn on_ack(&mut self, ack: AckResponse) {
        let guid = ack.req_guid;
        let in_flight = self.in_flight_priority(guid);

        match (ack.status, ack.code) {
            (AckStatus::Success, _) => {
                if let Some(priority) = in_flight {
                    self.release_if_in_flight(&priority, guid);
                    self.resolve(guid);
                    self.pump(&priority);
                } else if self.store.get(guid).is_some() {
                    self.resolve(guid);
                } else {
                    debug!("Ack for unknown request {}", guid);
                }
            }
            (AckStatus::Error, Some(AckCode::BadRequest)) => {
                let Some(request) = self.store.get(guid) else {
                    return;
                };
                let priority = request.priority.clone();
                warn!("Collector rejected request {} as malformed, dropping", guid);
                self.release_if_in_flight(&priority, guid);
                self.drop_request(guid);
                self.pump(&priority);
            }
            (AckStatus::Error, Some(AckCode::MaxConnectionLimitReached)) => {
                if let Some(priority) = in_flight {
                    info!("Collector connection limit reached, reconnecting");
                    self.release_if_in_flight(&priority, guid);
                    self.connection.force_reconnect();
                }
            }
            (AckStatus::Error, code) => {
                if let Some(priority) = in_flight {
                    self.fail(&priority, guid, &format!("collector error {code:?}"));
                }
            }
        }
    }

    fn on_ack_timeout(&mut self, priority: PriorityId, tick: TimerTick) {
        let Some(timer) = self.ack_timers.get_mut(&priority) else {
            return;
        };
        if !timer.begin_fire(tick) {
            return;
        }
        if let Err(e) = timer.end_fire(tick) {
            warn!("{}", e);
        }
        if let Some(guid) = self.in_flight.get(&priority).map(|f| f.guid) {
            self.fail(&priority, guid, "ack timeout");
        }
    }

    fn on_connection_state(&mut self, state: ConnectionState) {
        if state.is_connected() {
            self.pump_all();
            return;
        }
        let lost: Vec<(PriorityId, Uuid)> = self
            .in_flight
            .iter()
            .map(|(p, f)| (p.clone(), f.guid))
            .collect();
        let battery_low = self.battery_low();
        for (priority, guid) in lost {
            if battery_low {
                self.hold_for_battery(&priority, guid);
            } else {
                self.fail(&priority, guid, "connection lost");
            }
        }
    }

    /// The link was dropped to save battery, not because the request
    /// failed: free the slot and keep the retry budget untouched.
    fn hold_for_battery(&mut self, priority: &PriorityId, guid: Uuid) {
        info!("Battery low, keeping request {} for later", guid);
        self.release_if_in_flight(priority, guid);
    }

    /// Failure path: requeue with one more retry, or drop once the budget is
    /// spent.
    fn fail(&mut self, priority: &PriorityId, guid: Uuid, reason: &str) {
        self.release_if_in_flight(priority, guid);
        let Some(mut request) = self.store.get(guid).cloned() else {
            return;
        };

        if request.retries_made >= self.constraints.max_retries_per_batch {
            warn!(
                "Dropping request {} after {} retries ({})",
                guid, request.retries_made, reason
            );
            self.drop_request(guid);
        } else {
            request.retries_made += 1;
            request.time_stamp = Utc::now();
            info!(
                "Request {} failed ({}), retry {}/{}",
                guid, reason, request.retries_made, self.constraints.max_retries_per_batch
            );
            self.store.update(request);
            self.metrics.record_request_retried();
        }
        self.pump(priority);
    }

    fn resolve(&mut self, guid: Uuid) {
        if self.store.remove(guid).is_some() {
            self.metrics.record_request_acked();
            self.metrics.set_persisted_bytes(self.store.total_bytes());
            debug!("Request {} acknowledged", guid);
        }
    }

    fn drop_request(&mut self, guid: Uuid) {
        if self.store.remove(guid).is_some() {
            self.metrics.record_request_dropped();
            self.metrics.set_persisted_bytes(self.store.total_bytes());
        }
    }

    /// Clears the in-flight slot and disarms its ack timer if `guid` holds it.
    fn release_if_in_flight(&mut self, priority: &PriorityId, guid: Uuid) {
        if self.in_flight.get(priority).is_some_and(|f| f.guid == guid) {
            self.in_flight.remove(priority);
            if let Some(timer) = self.ack_timers.get_mut(priority) {
                timer.cancel();
            }
        }
    }

    fn in_flight_priority(&self, guid: Uuid) -> Option<PriorityId> {
        self.in_flight
            .iter()
            .find(|(_, f)| f.guid == guid)
            .map(|(p, _)| p.clone())
    }

    fn battery_low(&self) -> bool {
        self.device
            .battery_low(self.constraints.min_battery_level_percent)
    }

    fn shutdown(&mut self) {
        for timer in self.ack_timers.values_mut() {
            timer.cancel();
        }
        self.in_flight.clear();
        debug!(
            "Retry mechanism leaving {} requests persisted",
            self.store.len()
        );
    }
}
