use super::sink::BatchSink;
use crate::app::config::{Constraints, PipelineConfig};
use crate::buffer::{BatchSizeRegulator, BatchTrigger, CutLimit, EventBatch, EventBuffer};
use crate::domain::{
    AppState, ConnectionState, DeviceWatch, Event, PipelineError, Priority, PriorityId, Urgency,
};
use crate::reliability::PipelineMetrics;
use crate::scheduler::{SchedulerService, TimerTick};
use crate::storage::{Dao, Database, Persistable};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

impl Persistable for Event {
    const TABLE: &'static str = "events";

    fn primary_key(&self) -> String {
        self.guid.to_string()
    }

    fn column(&self, name: &str) -> Option<String> {
        match name {
            "guid" => Some(self.guid.to_string()),
            "priority" => Some(self.priority.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum WarehouseCommand {
    Store(Event),
    Tick { priority: PriorityId, tick: TimerTick },
    Flush,
    Stop(oneshot::Sender<()>),
}

/// Producer-side handle to a running [`Warehouser`].
#[derive(Debug, Clone)]
pub struct WarehouseHandle {
    commands: mpsc::UnboundedSender<WarehouseCommand>,
}

impl WarehouseHandle {
    /// Queues the event and returns immediately.
    pub fn store(&self, event: Event) {
        if self.commands.send(WarehouseCommand::Store(event)).is_err() {
            debug!("Warehouser stopped, event discarded");
        }
    }

    /// Cuts and forwards everything buffered, ignoring timers and the
    /// forwarding gate.
    pub fn flush(&self) {
        let _ = self.commands.send(WarehouseCommand::Flush);
    }

    /// Flushes all buffers, forwards the batches and halts timers.
    /// Idempotent.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(WarehouseCommand::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Owns the per-priority event buffers and decides when batches are cut and
/// forwarded.
pub struct Warehouser {
    priorities: BTreeMap<PriorityId, Priority>,
    constraints: Constraints,
    buffers: BTreeMap<PriorityId, EventBuffer>,
    held: BTreeMap<PriorityId, VecDeque<EventBatch>>,
    regulator: BatchSizeRegulator,
    scheduler: SchedulerService<WarehouseCommand>,
    events: Dao<Event>,
    sink: Arc<dyn BatchSink>,
    connection_state: watch::Receiver<ConnectionState>,
    /// A background flush found the link down and waits for it.
    flush_on_connect: bool,
    device: DeviceWatch,
    metrics: Arc<PipelineMetrics>,
}

impl Warehouser {
    pub fn spawn(
        config: &PipelineConfig,
        db: &Database,
        sink: Arc<dyn BatchSink>,
        connection_state: watch::Receiver<ConnectionState>,
        device: DeviceWatch,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<(WarehouseHandle, JoinHandle<()>), PipelineError> {
        let events = db.create_table::<Event>()?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let warehouser = Self {
            priorities: config
                .priorities
                .iter()
                .map(|p| (p.identifier.clone(), p.clone()))
                .collect(),
            constraints: config.constraints.clone(),
            buffers: config
                .priorities
                .iter()
                .map(|p| (p.identifier.clone(), EventBuffer::new()))
                .collect(),
            held: BTreeMap::new(),
            regulator: BatchSizeRegulator::new(db.clone()),
            scheduler: SchedulerService::new(&config.priorities, commands_tx.clone()),
            events,
            sink,
            connection_state,
            flush_on_connect: false,
            device,
            metrics,
        };

        let task = tokio::spawn(warehouser.run(commands_rx));
        Ok((
            WarehouseHandle {
                commands: commands_tx,
            },
            task,
        ))
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<WarehouseCommand>) {
        self.restore();
        if self.constraints.flush_on_app_launch {
            self.flush("app launch");
        }

        let _ = self.connection_state.borrow_and_update();
        let _ = self.device.battery.borrow_and_update();
        let app_state = *self.device.app_state.borrow_and_update();
        if app_state == AppState::Active {
            self.start_scheduler();
        }
        info!(
            "Warehouser started with {} priorities",
            self.priorities.len()
        );

        loop {
            tokio::select! {
                Some(command) = commands.recv() => match command {
                    WarehouseCommand::Store(event) => self.store(event),
                    WarehouseCommand::Tick { priority, tick } => self.on_tick(priority, tick),
                    WarehouseCommand::Flush => self.flush("requested"),
                    WarehouseCommand::Stop(reply) => {
                        self.flush("stop");
                        self.scheduler.stop();
                        let _ = reply.send(());
                        break;
                    }
                },
                Ok(()) = self.connection_state.changed() => {
                    let state = *self.connection_state.borrow_and_update();
                    self.on_connection_state(state);
                }
                Ok(()) = self.device.battery.changed() => {
                    let _ = self.device.battery.borrow_and_update();
                    self.forward_held_if_open();
                }
                Ok(()) = self.device.app_state.changed() => {
                    let state = *self.device.app_state.borrow_and_update();
                    self.on_app_state(state);
                }
                else => break,
            }
        }

        info!("Warehouser stopped");
    }

    /// Reloads events persisted by an earlier run into their buffers.
    fn restore(&mut self) {
        let rows = match self.events.fetch_all() {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Could not restore pending events: {}", e);
                return;
            }
        };

        let mut restored = 0usize;
        let mut orphans = Vec::new();
        for event in rows {
            let regular = self
                .priorities
                .get(&event.priority)
                .is_some_and(|p| p.urgency == Urgency::Normal);
            match self.buffers.get_mut(&event.priority) {
                Some(buffer) => {
                    if regular {
                        self.regulator.observe(event.size());
                    }
                    buffer.push(event);
                    restored += 1;
                }
                None => orphans.push(event.primary_key()),
            }
        }
        if !orphans.is_empty() {
            warn!("Purging {} events for unknown priorities", orphans.len());
            if let Err(e) = self.events.delete_many(&orphans) {
                warn!("Could not purge orphaned events: {}", e);
            }
        }
        if restored > 0 {
            info!("Restored {} pending events", restored);
        }
    }

    fn store(&mut self, event: Event) {
        let Some((max_batch_size, urgency)) = self
            .priorities
            .get(&event.priority)
            .map(|p| (p.max_batch_size, p.urgency))
        else {
            debug!("Dropping event for unknown priority {}", event.priority);
            self.metrics.record_event_dropped();
            return;
        };
        if urgency == Urgency::Instant {
            self.send_instantly(event);
            return;
        }

        if let Err(e) = self.events.insert(&event) {
            warn!("Could not persist event {}: {}", event.guid, e);
        }
        let priority = event.priority.clone();
        // Urgent events would skew the average of regular traffic.
        if urgency == Urgency::Normal {
            self.regulator.observe(event.size());
        }
        if let Some(buffer) = self.buffers.get_mut(&priority) {
            buffer.push(event);
        }
        self.metrics.record_event_stored();

        match (urgency, max_batch_size) {
            (Urgency::Immediate, _) => self.cut_immediately(&priority),
            (_, Some(max_bytes)) => self.cut_oversized(&priority, max_bytes),
            _ => {}
        }
    }

    /// Forwards a lone event when the link is up; otherwise drops it and
    /// asks for a connection.
    fn send_instantly(&mut self, event: Event) {
        if !self.connection_state.borrow().is_connected() {
            warn!(
                "Dropping instant event {} ({}): not connected",
                event.guid, event.type_tag
            );
            self.metrics.record_event_dropped();
            self.request_urgent_connection();
            return;
        }
        let batch = EventBatch::new(event.priority.clone(), vec![event], BatchTrigger::Instant);
        debug!("Sending instant batch {}", batch.uuid());
        self.metrics.record_batch_cut();
        self.metrics.record_batch_forwarded();
        self.sink.forward(batch);
    }

    /// Cuts the whole buffer of an `Immediate` priority.
    fn cut_immediately(&mut self, priority: &PriorityId) {
        let limit = self.flush_limit(priority);
        while let Some(events) = self.cut(priority, limit) {
            self.dispatch(EventBatch::new(priority.clone(), events, BatchTrigger::Immediate));
        }
        self.request_urgent_connection();
    }

    fn request_urgent_connection(&self) {
        if *self.connection_state.borrow() == ConnectionState::Disconnected {
            info!("Urgent events waiting, forcing a reconnection");
            self.sink.force_reconnect();
        }
    }

    /// Size trigger: cuts until the buffer is back within `max_bytes`.
    fn cut_oversized(&mut self, priority: &PriorityId, max_bytes: usize) {
        loop {
            let over = self
                .buffers
                .get(priority)
                .is_some_and(|b| b.bytes() > max_bytes);
            if !over {
                break;
            }
            let regulated = self.regulator.regulated_count(priority, max_bytes);
            let max_events = if regulated > 0 { regulated } else { usize::MAX };
            let Some(events) = self.cut(priority, CutLimit::new(max_events, Some(max_bytes))) else {
                break;
            };
            self.dispatch(EventBatch::new(priority.clone(), events, BatchTrigger::Size));
        }
    }

    fn on_tick(&mut self, priority: PriorityId, tick: TimerTick) {
        if !self.scheduler.begin_fire(&priority, tick) {
            return;
        }
        self.cut_on_timer(&priority);
        self.scheduler.end_fire(&priority, tick);
    }

    /// Timer trigger: the first `min(regulated, len)` events within the
    /// byte budget. The cut happens whether or not the batch can be
    /// forwarded right away.
    fn cut_on_timer(&mut self, priority: &PriorityId) {
        let Some(max_batch_size) = self.priorities.get(priority).map(|p| p.max_batch_size) else {
            return;
        };
        let limit = match max_batch_size {
            Some(max_bytes) => {
                let regulated = self.regulator.regulated_count(priority, max_bytes);
                if regulated == 0 {
                    debug!("Regulated count for {} is 0, nothing to cut", priority);
                    return;
                }
                CutLimit::new(regulated, Some(max_bytes))
            }
            None => CutLimit::UNBOUNDED,
        };
        if let Some(events) = self.cut(priority, limit) {
            self.dispatch(EventBatch::new(priority.clone(), events, BatchTrigger::Timer));
        }
    }

    fn cut(&mut self, priority: &PriorityId, limit: CutLimit) -> Option<Vec<Event>> {
        let events = self.buffers.get_mut(priority)?.cut(limit);
        (!events.is_empty()).then_some(events)
    }

    fn dispatch(&mut self, batch: EventBatch) {
        self.metrics.record_batch_cut();
        debug!(
            "Cut batch {} for {} ({:?}, {} events, {} bytes)",
            batch.uuid(),
            batch.priority(),
            batch.trigger(),
            batch.len(),
            batch.estimated_size()
        );

        if self.gate_open() {
            let priority = batch.priority().clone();
            self.forward_held(&priority);
            self.forward(batch);
        } else {
            self.hold(batch);
        }
    }

    fn forward(&mut self, batch: EventBatch) {
        if let Err(e) = self.events.delete_many(&batch.event_guids()) {
            warn!("Could not delete forwarded events: {}", e);
        }
        self.metrics.record_batch_forwarded();
        self.sink.forward(batch);
    }

    /// Parks a batch until the gate opens, dropping the oldest held batches
    /// once they exceed the priority's cache size.
    fn hold(&mut self, batch: EventBatch) {
        let priority = batch.priority().clone();
        let max_bytes = self
            .priorities
            .get(&priority)
            .map_or(u64::MAX, |p| p.max_cache_size);
        let queue = self.held.entry(priority.clone()).or_default();
        queue.push_back(batch);

        let mut dropped = Vec::new();
        while queue.iter().map(|b| b.estimated_size() as u64).sum::<u64>() > max_bytes {
            match queue.pop_front() {
                Some(oldest) => dropped.push(oldest),
                None => break,
            }
        }
        debug!("Holding {} batches for {}", queue.len(), priority);

        for batch in dropped {
            warn!(
                "Dropping held batch {} ({} events) for {}: cache size exceeded",
                batch.uuid(),
                batch.len(),
                priority
            );
            for _ in 0..batch.len() {
                self.metrics.record_event_dropped();
            }
            if let Err(e) = self.events.delete_many(&batch.event_guids()) {
                warn!("Could not delete dropped events: {}", e);
            }
        }
    }

    fn forward_held(&mut self, priority: &PriorityId) {
        let Some(queue) = self.held.remove(priority) else {
            return;
        };
        for batch in queue {
            self.forward(batch);
        }
    }

    fn forward_held_if_open(&mut self) {
        if !self.gate_open() {
            return;
        }
        let priorities: Vec<PriorityId> = self.held.keys().cloned().collect();
        for priority in priorities {
            self.forward_held(&priority);
        }
    }

    /// Limit for cuts that empty a buffer: the byte budget still applies.
    fn flush_limit(&mut self, priority: &PriorityId) -> CutLimit {
        match self.priorities.get(priority).and_then(|p| p.max_batch_size) {
            Some(max_bytes) => {
                let regulated = self.regulator.regulated_count(priority, max_bytes);
                let max_events = if regulated > 0 { regulated } else { usize::MAX };
                CutLimit::new(max_events, Some(max_bytes))
            }
            None => CutLimit::UNBOUNDED,
        }
    }

    /// Forwards held batches and every buffered event regardless of the gate.
    fn flush(&mut self, reason: &str) {
        let priorities: Vec<PriorityId> = self.priorities.keys().cloned().collect();
        let mut batches = 0usize;
        for priority in priorities {
            self.forward_held(&priority);

            let limit = self.flush_limit(&priority);
            while let Some(events) = self.cut(&priority, limit) {
                let batch = EventBatch::new(priority.clone(), events, BatchTrigger::Flush);
                self.metrics.record_batch_cut();
                self.forward(batch);
                batches += 1;
            }
        }
        if batches > 0 {
            info!("Flushed {} batches ({})", batches, reason);
        }
    }

    fn on_app_state(&mut self, state: AppState) {
        match state {
            AppState::Active => {
                self.start_scheduler();
                self.forward_held_if_open();
            }
            AppState::Inactive => self.scheduler.stop(),
            AppState::Background => {
                self.scheduler.stop();
                if !self.constraints.flush_on_background {
                    return;
                }
                if self.connection_state.borrow().is_connected() {
                    self.flush("background");
                } else {
                    debug!("Background flush deferred until connected");
                    self.flush_on_connect = true;
                    self.sink.ensure_connected();
                }
            }
            AppState::Terminated => {
                self.scheduler.stop();
                self.flush("terminated");
            }
        }
    }

    fn on_connection_state(&mut self, state: ConnectionState) {
        if state.is_connected() && self.flush_on_connect {
            self.flush_on_connect = false;
            self.flush("connected");
        } else {
            self.forward_held_if_open();
        }
    }

    fn start_scheduler(&mut self) {
        self.scheduler
            .start(|priority, tick| WarehouseCommand::Tick { priority, tick });
    }

    fn gate_open(&self) -> bool {
        self.connection_state.borrow().is_connected()
            && !self
                .device
                .battery_low(self.constraints.min_battery_level_percent)
            && !self.device.app_state().is_backgrounded()
    }
}
