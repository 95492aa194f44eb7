use super::backoff::{Backoff, BackoffPolicy};
use super::keep_alive::KeepAlive;
use super::transport::{
    Connectable, Transport, TransportError, TransportEvent, TransportEvents, TransportSignal,
};
use crate::app::config::Constraints;
use crate::domain::{AppState, BatteryStatus, ConnectionState, DeviceWatch, Reachability};
use crate::reliability::PipelineMetrics;
use crate::scheduler::{Timer, TimerTick};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Upper bound on waiting for a transport to release its handle.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Notifications for the component that owns outgoing requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Bytes received from the collector (acks, inline responses).
    Inbound(Bytes),
    /// A write could not be handed to the transport.
    WriteFailed { guid: Uuid, error: TransportError },
}

#[derive(Debug)]
pub enum ConnectionCommand {
    Connect,
    ForceReconnect,
    Write { guid: Uuid, payload: Bytes },
    Disconnect(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    RetryTick(TimerTick),
    ConnectTimeout(TimerTick),
    PingTick(TimerTick),
    WatchdogTick(TimerTick),
    TerminationTick(TimerTick),
    ConnectFinished {
        attempt: u64,
        result: Result<(), TransportError>,
    },
    PingFinished {
        attempt: u64,
        result: Result<(), TransportError>,
    },
    WriteFinished {
        attempt: u64,
        guid: Uuid,
        result: Result<Option<Bytes>, TransportError>,
    },
}

/// Cheap, cloneable access to a running [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Starts a connect cycle unless one is running. Clears a previous
    /// give-up and revives a cancelled manager.
    pub fn connect(&self) {
        let _ = self.commands.send(ConnectionCommand::Connect);
    }

    /// Tears down the current connection, if any, and connects again.
    pub fn force_reconnect(&self) {
        let _ = self.commands.send(ConnectionCommand::ForceReconnect);
    }

    /// Fire-and-forget write. Failures come back as
    /// [`ConnectionEvent::WriteFailed`].
    pub fn write(&self, guid: Uuid, payload: Bytes) {
        let _ = self.commands.send(ConnectionCommand::Write { guid, payload });
    }

    /// Moves to `Cancelled` and releases the transport. Idempotent.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(ConnectionCommand::Disconnect(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Disconnects and ends the manager task. Idempotent.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(ConnectionCommand::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Why a connect cycle is being started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// Explicit caller request; revives `Cancelled`.
    Command,
    /// Foreground, reachability regained, battery recovered.
    Signal,
    /// Scheduled retry after a failure.
    Backoff,
    Watchdog,
}

/// Owns the transport and its connection state machine.
pub struct ConnectionManager {
    endpoint: Url,
    transport: Transport,
    constraints: Constraints,
    device: DeviceWatch,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    metrics: Arc<PipelineMetrics>,
    commands_tx: mpsc::UnboundedSender<ConnectionCommand>,
    signals_tx: mpsc::UnboundedSender<TransportSignal>,
    attempt: u64,
    backoff: Backoff,
    ever_connected: bool,
    exhausted: bool,
    suspended: bool,
    retry_timer: Timer<ConnectionCommand>,
    connect_timer: Timer<ConnectionCommand>,
    termination_timer: Timer<ConnectionCommand>,
    keep_alive: KeepAlive<ConnectionCommand>,
}

impl ConnectionManager {
    /// Spawns the manager task. The manager stays `Disconnected` until
    /// [`ConnectionHandle::connect`] is called.
    pub fn spawn(
        endpoint: Url,
        transport: Transport,
        constraints: &Constraints,
        device: DeviceWatch,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        metrics: Arc<PipelineMetrics>,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);

        let manager = Self {
            endpoint,
            transport,
            constraints: constraints.clone(),
            device,
            state,
            events,
            metrics,
            commands_tx: commands_tx.clone(),
            signals_tx,
            attempt: 0,
            backoff: Backoff::new(BackoffPolicy::initial(constraints)),
            ever_connected: false,
            exhausted: false,
            suspended: false,
            retry_timer: Timer::new("connection-retry", commands_tx.clone()),
            connect_timer: Timer::new("connect-timeout", commands_tx.clone()),
            termination_timer: Timer::new("connection-termination", commands_tx.clone()),
            keep_alive: KeepAlive::new(
                commands_tx.clone(),
                constraints.max_ping_interval,
                constraints.connection_retry_duration,
            ),
        };

        let task = tokio::spawn(manager.run(commands_rx, signals_rx));
        let handle = ConnectionHandle {
            commands: commands_tx,
            state: state_rx,
        };
        (handle, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ConnectionCommand>,
        mut signals: mpsc::UnboundedReceiver<TransportSignal>,
    ) {
        info!(
            "Connection manager started ({} transport, endpoint {})",
            self.transport.kind(),
            self.endpoint
        );
        let _ = self.device.app_state.borrow_and_update();
        let _ = self.device.battery.borrow_and_update();
        let mut reachability = *self.device.reachability.borrow_and_update();
        if !self.device.app_state().is_backgrounded() {
            self.start_watchdog();
        }

        loop {
            tokio::select! {
                Some(command) = commands.recv() => {
                    if let Some(reply) = self.handle_command(command).await {
                        let _ = reply.send(());
                        break;
                    }
                }
                Some(signal) = signals.recv() => self.handle_transport(signal),
                Ok(()) = self.device.app_state.changed() => {
                    let state = *self.device.app_state.borrow_and_update();
                    self.on_app_state(state);
                }
                Ok(()) = self.device.battery.changed() => {
                    let status = *self.device.battery.borrow_and_update();
                    self.on_battery(status);
                }
                Ok(()) = self.device.reachability.changed() => {
                    let next = *self.device.reachability.borrow_and_update();
                    self.on_reachability(reachability, next);
                    reachability = next;
                }
                else => break,
            }
        }

        info!("Connection manager stopped");
    }

    /// Returns the reply channel when the manager should exit.
    async fn handle_command(&mut self, command: ConnectionCommand) -> Option<oneshot::Sender<()>> {
        match command {
            ConnectionCommand::Connect => self.connect(Trigger::Command),
            ConnectionCommand::ForceReconnect => {
                if matches!(
                    self.current(),
                    ConnectionState::Connected | ConnectionState::Connecting
                ) {
                    info!("Forcing reconnection");
                    self.teardown(ConnectionState::Disconnected);
                }
                self.connect(Trigger::Command);
            }
            ConnectionCommand::Write { guid, payload } => self.write(guid, payload),
            ConnectionCommand::Disconnect(reply) => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            ConnectionCommand::Stop(reply) => {
                self.disconnect().await;
                return Some(reply);
            }
            ConnectionCommand::RetryTick(tick) => {
                if self.retry_timer.begin_fire(tick) {
                    self.end_fire(TimerSlot::Retry, tick);
                    self.connect(Trigger::Backoff);
                }
            }
            ConnectionCommand::ConnectTimeout(tick) => {
                if self.connect_timer.begin_fire(tick) {
                    self.end_fire(TimerSlot::Connect, tick);
                    if self.current() == ConnectionState::Connecting {
                        self.attempt_failed(TransportError::Timeout(format!(
                            "no connection within {:?}",
                            self.constraints.connect_timeout
                        )));
                    }
                }
            }
            ConnectionCommand::PingTick(tick) => {
                if self.keep_alive.ping_timer().begin_fire(tick) {
                    self.end_fire(TimerSlot::Ping, tick);
                    if self.current().is_connected() {
                        self.send_ping();
                    }
                }
            }
            ConnectionCommand::WatchdogTick(tick) => {
                if self.keep_alive.watchdog_timer().begin_fire(tick) {
                    self.end_fire(TimerSlot::Watchdog, tick);
                    self.connect(Trigger::Watchdog);
                }
            }
            ConnectionCommand::TerminationTick(tick) => {
                if self.termination_timer.begin_fire(tick) {
                    self.end_fire(TimerSlot::Termination, tick);
                    info!("Terminating connection after background grace period");
                    self.suspended = true;
                    self.retry_timer.cancel();
                    if self.current() != ConnectionState::Cancelled {
                        self.teardown(ConnectionState::Disconnected);
                    }
                }
            }
            ConnectionCommand::ConnectFinished { attempt, result } => {
                if attempt == self.attempt
                    && self.current() == ConnectionState::Connecting
                    && let Err(e) = result
                {
                    self.attempt_failed(e);
                }
            }
            ConnectionCommand::PingFinished { attempt, result } => {
                if let Err(e) = result
                    && attempt == self.attempt
                    && self.current().is_connected()
                {
                    let silent = self.keep_alive.is_silent(self.coefficient());
                    if e.is_connectivity_loss() && silent {
                        warn!("Ping failed, treating as connectivity loss: {}", e);
                        self.premature_disconnection();
                    } else {
                        debug!("Ping failed: {}", e);
                    }
                }
            }
            ConnectionCommand::WriteFinished {
                attempt,
                guid,
                result,
            } => {
                if attempt != self.attempt || !self.current().is_connected() {
                    debug!("Ignoring completion of write {} from a closed session", guid);
                    return None;
                }
                match result {
                    Ok(Some(response)) => {
                        self.keep_alive.record_activity();
                        let _ = self.events.send(ConnectionEvent::Inbound(response));
                    }
                    Ok(None) => {}
                    Err(error) => {
                        let connectivity_loss = error.is_connectivity_loss();
                        let _ = self.events.send(ConnectionEvent::WriteFailed { guid, error });
                        if connectivity_loss {
                            self.premature_disconnection();
                        }
                    }
                }
            }
        }
        None
    }

    fn handle_transport(&mut self, signal: TransportSignal) {
        if signal.attempt != self.attempt {
            debug!(
                "Ignoring transport event from abandoned attempt {}",
                signal.attempt
            );
            return;
        }

        match signal.event {
            TransportEvent::Connected => {
                if self.current() == ConnectionState::Connecting {
                    self.on_connected();
                }
            }
            TransportEvent::Disconnected { reason } => match self.current() {
                ConnectionState::Connecting => self.attempt_failed(TransportError::ConnectionFailed(
                    reason.unwrap_or_else(|| "closed during connect".to_string()),
                )),
                ConnectionState::Connected => {
                    warn!(
                        "Transport disconnected: {}",
                        reason.as_deref().unwrap_or("no reason given")
                    );
                    self.premature_disconnection();
                }
                _ => {}
            },
            TransportEvent::Error(error) => match self.current() {
                ConnectionState::Connecting => self.attempt_failed(error),
                ConnectionState::Connected if error.is_connectivity_loss() => {
                    warn!("Transport error, treating as connectivity loss: {}", error);
                    self.premature_disconnection();
                }
                _ => debug!("Transport error: {}", error),
            },
            TransportEvent::Message(payload) => {
                self.keep_alive.record_activity();
                let _ = self.events.send(ConnectionEvent::Inbound(payload));
            }
            TransportEvent::Pong => self.keep_alive.record_activity(),
        }
    }

    fn connect(&mut self, trigger: Trigger) {
        let state = self.current();
        if matches!(state, ConnectionState::Connecting | ConnectionState::Connected) {
            return;
        }

        match trigger {
            Trigger::Command => {
                if state == ConnectionState::Cancelled {
                    self.backoff.reset_with(BackoffPolicy::initial(&self.constraints));
                    self.ever_connected = false;
                    self.set_state(ConnectionState::Disconnected);
                    if !self.device.app_state().is_backgrounded() {
                        self.start_watchdog();
                    }
                } else {
                    self.backoff.reset();
                }
                self.exhausted = false;
            }
            Trigger::Signal => {
                if state == ConnectionState::Cancelled || self.suspended {
                    return;
                }
                self.backoff.reset();
                self.exhausted = false;
            }
            Trigger::Backoff => {
                if state == ConnectionState::Cancelled || self.suspended {
                    return;
                }
            }
            Trigger::Watchdog => {
                if state == ConnectionState::Cancelled
                    || self.suspended
                    || self.exhausted
                    || self.retry_timer.is_armed()
                {
                    return;
                }
            }
        }

        let reachability = self.device.reachability();
        if !reachability.reachable {
            debug!("Not connecting: network unreachable");
            return;
        }
        if self.battery_low() {
            debug!("Not connecting: battery low");
            return;
        }

        self.retry_timer.cancel();
        self.start_attempt(trigger);
    }

    fn start_attempt(&mut self, trigger: Trigger) {
        self.attempt += 1;
        let attempt = self.attempt;
        self.set_state(ConnectionState::Connecting);
        self.metrics.record_connect_attempt();
        debug!("Connect attempt {} ({:?})", attempt, trigger);

        self.connect_timer
            .rearm_once(self.constraints.connect_timeout, ConnectionCommand::ConnectTimeout);

        let connectable = self.transport.connectable();
        let endpoint = self.endpoint.clone();
        let events = TransportEvents::new(attempt, self.signals_tx.clone());
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let result = connectable.connect(endpoint, events).await;
            let _ = commands.send(ConnectionCommand::ConnectFinished { attempt, result });
        });
    }

    fn on_connected(&mut self) {
        self.connect_timer.cancel();
        self.retry_timer.cancel();
        self.exhausted = false;
        self.ever_connected = true;
        self.backoff
            .reset_with(BackoffPolicy::post_premature_disconnection(&self.constraints));
        self.set_state(ConnectionState::Connected);
        self.metrics.record_connection_established();

        if self.transport.uses_ping() {
            let coefficient = self.coefficient();
            self.keep_alive
                .start_pinging(coefficient, ConnectionCommand::PingTick);
        }
    }

    fn attempt_failed(&mut self, error: TransportError) {
        warn!("Connect attempt {} failed: {}", self.attempt, error);
        self.teardown(ConnectionState::Disconnected);
        self.schedule_retry();
    }

    fn premature_disconnection(&mut self) {
        self.teardown(ConnectionState::Disconnected);
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        if self.suspended || !self.device.reachability().reachable || self.battery_low() {
            return;
        }
        let network = self.device.reachability().network;
        match self.backoff.next_delay(network) {
            Some(delay) => {
                info!(
                    "Reconnecting in {:?} (attempt {}/{})",
                    delay,
                    self.backoff.attempt(),
                    self.backoff.policy().max_retries
                );
                self.retry_timer.rearm_once(delay, ConnectionCommand::RetryTick);
            }
            None => {
                self.exhausted = true;
                warn!(
                    "Giving up after {} connection attempts until the next trigger",
                    self.backoff.attempt()
                );
            }
        }
    }

    fn write(&mut self, guid: Uuid, payload: Bytes) {
        if !self.current().is_connected() {
            let _ = self.events.send(ConnectionEvent::WriteFailed {
                guid,
                error: TransportError::NotConnected,
            });
            return;
        }

        let attempt = self.attempt;
        let connectable = self.transport.connectable();
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let result = connectable.write(payload).await;
            let _ = commands.send(ConnectionCommand::WriteFinished {
                attempt,
                guid,
                result,
            });
        });
    }

    fn send_ping(&mut self) {
        let attempt = self.attempt;
        let connectable = self.transport.connectable();
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let result = connectable
                .send_ping(KeepAlive::<ConnectionCommand>::ping_payload())
                .await;
            let _ = commands.send(ConnectionCommand::PingFinished { attempt, result });
        });
    }

    /// Drops the current transport session and moves to `next`.
    fn teardown(&mut self, next: ConnectionState) {
        self.connect_timer.cancel();
        self.keep_alive.stop_pinging();
        if matches!(
            self.current(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            release_in_background(self.transport.connectable());
        }
        // Late events from the old session are now stale.
        self.attempt += 1;
        self.set_state(next);
    }

    async fn disconnect(&mut self) {
        if self.current() == ConnectionState::Cancelled {
            return;
        }
        let was_active = matches!(
            self.current(),
            ConnectionState::Connected | ConnectionState::Connecting
        );

        self.retry_timer.cancel();
        self.connect_timer.cancel();
        self.termination_timer.cancel();
        self.keep_alive.stop_all();
        self.attempt += 1;

        if was_active {
            let connectable = self.transport.connectable();
            if tokio::time::timeout(RELEASE_TIMEOUT, connectable.disconnect())
                .await
                .is_err()
            {
                warn!("Transport did not release within {:?}", RELEASE_TIMEOUT);
            }
        }
        self.set_state(ConnectionState::Cancelled);
    }

    fn on_app_state(&mut self, app_state: AppState) {
        match app_state {
            AppState::Background => {
                debug!("App backgrounded, arming termination countdown");
                self.keep_alive.stop_all();
                self.termination_timer.rearm_once(
                    self.constraints.connection_termination_timer_wait_time,
                    ConnectionCommand::TerminationTick,
                );
            }
            AppState::Terminated => {
                self.keep_alive.stop_all();
                self.termination_timer.cancel();
                self.retry_timer.cancel();
                self.suspended = true;
                if matches!(
                    self.current(),
                    ConnectionState::Connected | ConnectionState::Connecting
                ) {
                    self.teardown(ConnectionState::Disconnected);
                }
            }
            AppState::Active => {
                self.termination_timer.cancel();
                self.suspended = false;
                if self.current() == ConnectionState::Cancelled {
                    return;
                }
                self.start_watchdog();
                if self.current().is_connected() && self.transport.uses_ping() {
                    let coefficient = self.coefficient();
                    self.keep_alive
                        .start_pinging(coefficient, ConnectionCommand::PingTick);
                }
                self.connect(Trigger::Signal);
            }
            AppState::Inactive => {}
        }
    }

    fn on_battery(&mut self, status: BatteryStatus) {
        let low = status.is_low(self.constraints.min_battery_level_percent);
        match self.current() {
            ConnectionState::Connected | ConnectionState::Connecting if low => {
                info!(
                    "Battery low ({}%), dropping connection",
                    status.level_percent
                );
                self.retry_timer.cancel();
                self.teardown(ConnectionState::Disconnected);
            }
            ConnectionState::Disconnected if low => {
                self.retry_timer.cancel();
            }
            ConnectionState::Disconnected => self.connect(Trigger::Signal),
            _ => {}
        }
    }

    fn on_reachability(&mut self, previous: Reachability, next: Reachability) {
        if !next.reachable {
            if previous.reachable {
                info!("Network unreachable");
            }
            self.retry_timer.cancel();
            if matches!(
                self.current(),
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                self.teardown(ConnectionState::Disconnected);
            }
            return;
        }

        if !previous.reachable {
            info!("Network reachable again ({:?})", next.network);
            self.connect(Trigger::Signal);
        } else if previous.network != next.network {
            debug!("Network changed to {:?}", next.network);
            let coefficient = next.network.coefficient();
            if self.keep_alive.is_pinging() {
                self.keep_alive
                    .start_pinging(coefficient, ConnectionCommand::PingTick);
            }
            if !self.device.app_state().is_backgrounded() && self.current() != ConnectionState::Cancelled
            {
                self.start_watchdog();
            }
        }
    }

    fn start_watchdog(&mut self) {
        let coefficient = self.coefficient();
        self.keep_alive
            .start_watchdog(coefficient, ConnectionCommand::WatchdogTick);
    }

    /// Keep-alive multiplier for the current network. The retry base only
    /// applies to backoff.
    fn coefficient(&self) -> f64 {
        self.device.reachability().network.coefficient()
    }

    fn battery_low(&self) -> bool {
        self.device
            .battery_low(self.constraints.min_battery_level_percent)
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&mut self, next: ConnectionState) {
        let previous = self.current();
        if previous != next {
            info!("Connection {} -> {}", previous, next);
            self.state.send_replace(next);
        }
    }

    fn end_fire(&mut self, slot: TimerSlot, tick: TimerTick) {
        let timer = match slot {
            TimerSlot::Retry => &mut self.retry_timer,
            TimerSlot::Connect => &mut self.connect_timer,
            TimerSlot::Termination => &mut self.termination_timer,
            TimerSlot::Ping => self.keep_alive.ping_timer(),
            TimerSlot::Watchdog => self.keep_alive.watchdog_timer(),
        };
        if let Err(e) = timer.end_fire(tick) {
            warn!("{}", e);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TimerSlot {
    Retry,
    Connect,
    Termination,
    Ping,
    Watchdog,
}

fn release_in_background(connectable: Arc<dyn Connectable>) {
    tokio::spawn(async move {
        if tokio::time::timeout(RELEASE_TIMEOUT, connectable.disconnect())
            .await
            .is_err()
        {
            warn!("Transport did not release within {:?}", RELEASE_TIMEOUT);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeviceSignals, NetworkType};
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[derive(Default)]
    struct Scripted {
        failures: AtomicU32,
        connects: Mutex<Vec<Instant>>,
        writes: Mutex<Vec<Bytes>>,
        disconnects: AtomicU32,
    }

    impl Connectable for Scripted {
        fn connect(&self, _endpoint: Url, events: TransportEvents) -> BoxFuture<'_, Result<(), TransportError>> {
            Box::pin(async move {
                self.connects.lock().push(Instant::now());
                if self.failures.load(Ordering::SeqCst) > 0 {
                    self.failures.fetch_sub(1, Ordering::SeqCst);
                    return Err(TransportError::ConnectionFailed("refused".into()));
                }
                events.connected();
                Ok(())
            })
        }

        fn write(&self, payload: Bytes) -> BoxFuture<'_, Result<Option<Bytes>, TransportError>> {
            Box::pin(async move {
                self.writes.lock().push(payload.clone());
                Ok(Some(payload))
            })
        }

        fn send_ping(&self, _payload: Bytes) -> BoxFuture<'_, Result<(), TransportError>> {
            Box::pin(async { Ok(()) })
        }

        fn disconnect(&self) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.disconnects.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    struct Harness {
        handle: ConnectionHandle,
        transport: Arc<Scripted>,
        signals: DeviceSignals,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        metrics: Arc<PipelineMetrics>,
    }

    fn harness(failures: u32) -> Harness {
        let transport = Arc::new(Scripted::default());
        transport.failures.store(failures, Ordering::SeqCst);
        let signals = DeviceSignals::new();
        let (events_tx, events) = mpsc::unbounded_channel();
        let metrics = Arc::new(PipelineMetrics::new());
        let (handle, _task) = ConnectionManager::spawn(
            Url::parse("ws://collector.test/events").unwrap(),
            Transport::PubSub(transport.clone()),
            &Constraints::default(),
            signals.watch(),
            events_tx,
            Arc::clone(&metrics),
        );
        Harness {
            handle,
            transport,
            signals,
            events,
            metrics,
        }
    }

    async fn wait_for(handle: &ConnectionHandle, state: ConnectionState) {
        let mut rx = handle.subscribe();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_write_round_trip() {
        let mut h = harness(0);
        assert_eq!(h.handle.state(), ConnectionState::Disconnected);

        h.handle.connect();
        wait_for(&h.handle, ConnectionState::Connected).await;

        let guid = Uuid::new_v4();
        h.handle.write(guid, Bytes::from_static(b"ack"));
        assert_eq!(
            h.events.recv().await.unwrap(),
            ConnectionEvent::Inbound(Bytes::from_static(b"ack"))
        );
        assert_eq!(h.metrics.snapshot().connections_established, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_while_disconnected_fails_fast() {
        let mut h = harness(0);
        let guid = Uuid::new_v4();
        h.handle.write(guid, Bytes::from_static(b"payload"));
        assert_eq!(
            h.events.recv().await.unwrap(),
            ConnectionEvent::WriteFailed {
                guid,
                error: TransportError::NotConnected
            }
        );
        assert!(h.transport.writes.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempts_back_off_exponentially() {
        let h = harness(3);
        h.handle.connect();
        wait_for(&h.handle, ConnectionState::Connected).await;

        let connects = h.transport.connects.lock().clone();
        assert_eq!(connects.len(), 4);
        let gaps: Vec<u128> = connects
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis())
            .collect();
        // 1.3^0, 1.3^1, 1.3^2 seconds on wifi.
        assert!((1000..1100).contains(&gaps[0]), "{gaps:?}");
        assert!((1300..1400).contains(&gaps[1]), "{gaps:?}");
        assert!((1690..1790).contains(&gaps[2]), "{gaps:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent_and_connect_revives() {
        let h = harness(0);
        h.handle.connect();
        wait_for(&h.handle, ConnectionState::Connected).await;

        h.handle.disconnect().await;
        h.handle.disconnect().await;
        assert_eq!(h.handle.state(), ConnectionState::Cancelled);
        assert_eq!(h.transport.disconnects.load(Ordering::SeqCst), 1);

        h.handle.connect();
        wait_for(&h.handle, ConnectionState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_losing_reachability_tears_down_and_regaining_reconnects() {
        let h = harness(0);
        h.handle.connect();
        wait_for(&h.handle, ConnectionState::Connected).await;

        h.signals.set_reachability(Reachability {
            reachable: false,
            network: NetworkType::Wifi,
        });
        wait_for(&h.handle, ConnectionState::Disconnected).await;

        h.signals.set_reachability(Reachability {
            reachable: true,
            network: NetworkType::Cellular4G,
        });
        wait_for(&h.handle, ConnectionState::Connected).await;
        assert_eq!(h.transport.connects.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_battery_blocks_connecting() {
        let h = harness(0);
        h.signals.set_battery(BatteryStatus {
            level_percent: 5.0,
            charging: Some(false),
        });
        tokio::task::yield_now().await;
        h.handle.connect();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.handle.state(), ConnectionState::Disconnected);

        h.signals.set_battery(BatteryStatus {
            level_percent: 80.0,
            charging: Some(false),
        });
        wait_for(&h.handle, ConnectionState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_battery_cancels_pending_retry() {
        let h = harness(100);
        h.handle.connect();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.transport.connects.lock().len(), 1);
        assert_eq!(h.handle.state(), ConnectionState::Disconnected);

        h.signals.set_battery(BatteryStatus {
            level_percent: 5.0,
            charging: Some(false),
        });
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.connects.lock().len(), 1);

        h.transport.failures.store(0, Ordering::SeqCst);
        h.signals.set_battery(BatteryStatus {
            level_percent: 80.0,
            charging: Some(false),
        });
        wait_for(&h.handle, ConnectionState::Connected).await;
        assert_eq!(h.transport.connects.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_the_task() {
        let transport = Arc::new(Scripted::default());
        let (events_tx, _events) = mpsc::unbounded_channel();
        let (handle, task) = ConnectionManager::spawn(
            Url::parse("ws://collector.test/events").unwrap(),
            Transport::Websocket(transport),
            &Constraints::default(),
            DeviceSignals::new().watch(),
            events_tx,
            Arc::new(PipelineMetrics::new()),
        );
        handle.connect();
        wait_for(&handle, ConnectionState::Connected).await;
        handle.stop().await;
        task.await.unwrap();
        handle.stop().await;
    }
}
