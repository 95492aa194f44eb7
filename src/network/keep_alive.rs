use crate::scheduler::{Timer, TimerTick};
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

pub const PING_PAYLOAD: &[u8] = b"ping";

/// Liveness upkeep for one connection manager.
///
/// Two repeating timers: the ping timer checks an established socket every
/// `max_ping_interval × coefficient`; the watchdog wakes every
/// `connection_retry_duration × coefficient` so a disconnected manager that
/// has nothing else scheduled gets another chance to connect.
pub struct KeepAlive<M: Send + 'static> {
    ping: Timer<M>,
    watchdog: Timer<M>,
    ping_interval: Duration,
    watchdog_interval: Duration,
    last_activity: Instant,
}

impl<M: Send + 'static> KeepAlive<M> {
    pub fn new(
        mailbox: mpsc::UnboundedSender<M>,
        ping_interval: Duration,
        watchdog_interval: Duration,
    ) -> Self {
        Self {
            ping: Timer::new("keep-alive-ping", mailbox.clone()),
            watchdog: Timer::new("keep-alive-watchdog", mailbox),
            ping_interval,
            watchdog_interval,
            last_activity: Instant::now(),
        }
    }

    pub fn ping_period(&self, coefficient: f64) -> Duration {
        scale(self.ping_interval, coefficient)
    }

    pub fn watchdog_period(&self, coefficient: f64) -> Duration {
        scale(self.watchdog_interval, coefficient)
    }

    pub fn start_pinging<F>(&mut self, coefficient: f64, make: F)
    where
        F: Fn(TimerTick) -> M + Send + 'static,
    {
        let period = self.ping_period(coefficient);
        self.ping.rearm_repeating(period, make);
        self.last_activity = Instant::now();
        debug!("Keep-alive ping every {:?}", period);
    }

    pub fn stop_pinging(&mut self) {
        self.ping.cancel();
    }

    pub fn is_pinging(&self) -> bool {
        self.ping.is_armed()
    }

    pub fn start_watchdog<F>(&mut self, coefficient: f64, make: F)
    where
        F: Fn(TimerTick) -> M + Send + 'static,
    {
        let period = self.watchdog_period(coefficient);
        self.watchdog.rearm_repeating(period, make);
    }

    pub fn stop_watchdog(&mut self) {
        self.watchdog.cancel();
    }

    pub fn stop_all(&mut self) {
        self.stop_pinging();
        self.stop_watchdog();
    }

    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// True when nothing was heard from the peer for a full ping period.
    pub fn is_silent(&self, coefficient: f64) -> bool {
        self.idle_for() >= self.ping_period(coefficient)
    }

    pub fn ping_timer(&mut self) -> &mut Timer<M> {
        &mut self.ping
    }

    pub fn watchdog_timer(&mut self) -> &mut Timer<M> {
        &mut self.watchdog
    }

    pub fn ping_payload() -> Bytes {
        Bytes::from_static(PING_PAYLOAD)
    }
}

fn scale(base: Duration, coefficient: f64) -> Duration {
    let scaled = base.as_secs_f64() * coefficient.max(0.0);
    if scaled.is_finite() && scaled > 0.0 {
        Duration::from_secs_f64(scaled)
    } else {
        base
    }
}
