use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    #[error("Timer '{timer}' cannot {action} while {state:?}")]
    InvalidTransition {
        timer: &'static str,
        action: &'static str,
        state: TimerState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Armed,
    Firing,
    Cancelled,
}

/// Delivered to the owner each time the timer elapses.
///
/// The generation ties a tick to one arming; ticks from an earlier arming
/// are rejected by [`Timer::begin_fire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTick {
    pub generation: u64,
}

/// A cancellable one-shot or repeating timer feeding an owner's mailbox.
///
/// The owner drives every transition from its own task:
/// `Idle|Cancelled -arm-> Armed -begin_fire-> Firing -end_fire-> Idle|Armed`,
/// and `cancel` from any state. Arming an armed timer is rejected instead of
/// silently stacking a second schedule.
pub struct Timer<M: Send + 'static> {
    name: &'static str,
    state: TimerState,
    generation: u64,
    repeating: bool,
    task: Option<JoinHandle<()>>,
    mailbox: mpsc::UnboundedSender<M>,
}

impl<M: Send + 'static> std::fmt::Debug for Timer<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("repeating", &self.repeating)
            .finish()
    }
}

impl<M: Send + 'static> Timer<M> {
    pub fn new(name: &'static str, mailbox: mpsc::UnboundedSender<M>) -> Self {
        Self {
            name,
            state: TimerState::Idle,
            generation: 0,
            repeating: false,
            task: None,
            mailbox,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        matches!(self.state, TimerState::Armed | TimerState::Firing)
    }

    /// Fires once after `after`, delivering `make(tick)` to the mailbox.
    pub fn arm_once<F>(&mut self, after: Duration, make: F) -> Result<TimerTick, TimerError>
    where
        F: FnOnce(TimerTick) -> M + Send + 'static,
    {
        let tick = self.prepare_arm(false)?;
        let mailbox = self.mailbox.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = mailbox.send(make(tick));
        }));
        Ok(tick)
    }

    /// Fires every `period`, the first time one period from now.
    pub fn arm_repeating<F>(&mut self, period: Duration, make: F) -> Result<TimerTick, TimerError>
    where
        F: Fn(TimerTick) -> M + Send + 'static,
    {
        let tick = self.prepare_arm(true)?;
        let mailbox = self.mailbox.clone();
        let period = period.max(Duration::from_millis(1));
        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if mailbox.send(make(tick)).is_err() {
                    break;
                }
            }
        }));
        Ok(tick)
    }

    /// Cancels whatever is scheduled and arms a fresh one-shot.
    pub fn rearm_once<F>(&mut self, after: Duration, make: F) -> TimerTick
    where
        F: FnOnce(TimerTick) -> M + Send + 'static,
    {
        self.cancel();
        match self.arm_once(after, make) {
            Ok(tick) => tick,
            // Unreachable after cancel; keep the generation moving regardless.
            Err(e) => {
                warn!("{}", e);
                TimerTick {
                    generation: self.generation,
                }
            }
        }
    }

    /// Cancels whatever is scheduled and arms a fresh repeating schedule.
    pub fn rearm_repeating<F>(&mut self, period: Duration, make: F) -> TimerTick
    where
        F: Fn(TimerTick) -> M + Send + 'static,
    {
        self.cancel();
        match self.arm_repeating(period, make) {
            Ok(tick) => tick,
            Err(e) => {
                warn!("{}", e);
                TimerTick {
                    generation: self.generation,
                }
            }
        }
    }

    /// Accepts a delivered tick. Returns `false` for stale or cancelled ticks,
    /// which the owner must ignore.
    pub fn begin_fire(&mut self, tick: TimerTick) -> bool {
        if tick.generation != self.generation {
            debug!("Timer '{}' dropped stale tick {}", self.name, tick.generation);
            return false;
        }
        match self.state {
            TimerState::Armed => {
                self.state = TimerState::Firing;
                true
            }
            state => {
                debug!("Timer '{}' ignored tick while {:?}", self.name, state);
                false
            }
        }
    }

    /// Completes a firing started by `begin_fire`. If the handler re-armed or
    /// cancelled the timer meanwhile, the newer state wins.
    pub fn end_fire(&mut self, tick: TimerTick) -> Result<(), TimerError> {
        if tick.generation != self.generation {
            return Ok(());
        }
        match self.state {
            TimerState::Firing => {
                if self.repeating {
                    self.state = TimerState::Armed;
                } else {
                    self.state = TimerState::Idle;
                    self.task = None;
                }
                Ok(())
            }
            TimerState::Cancelled => Ok(()),
            state => Err(TimerError::InvalidTransition {
                timer: self.name,
                action: "end firing",
                state,
            }),
        }
    }

    /// Stops the schedule. Idempotent; returns whether anything was pending.
    pub fn cancel(&mut self) -> bool {
        let was_pending = self.is_armed();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if self.state != TimerState::Idle || was_pending {
            self.state = TimerState::Cancelled;
        }
        // Invalidate ticks already sitting in the mailbox.
        self.generation = self.generation.wrapping_add(1);
        was_pending
    }

    fn prepare_arm(&mut self, repeating: bool) -> Result<TimerTick, TimerError> {
        match self.state {
            TimerState::Idle | TimerState::Cancelled => {}
            state => {
                return Err(TimerError::InvalidTransition {
                    timer: self.name,
                    action: "arm",
                    state,
                });
            }
        }
        self.generation = self.generation.wrapping_add(1);
        self.repeating = repeating;
        self.state = TimerState::Armed;
        Ok(TimerTick {
            generation: self.generation,
        })
    }
}

impl<M: Send + 'static> Drop for Timer<M> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
