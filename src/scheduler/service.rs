use super::timer::{Timer, TimerTick};
use crate::domain::{Priority, PriorityId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Fires a per-priority batch tick at each priority's `max_time_between_batches`.
///
/// Priorities without an interval get no timer at all.
pub struct SchedulerService<M: Send + 'static> {
    slots: BTreeMap<PriorityId, Slot<M>>,
    running: bool,
}

struct Slot<M: Send + 'static> {
    interval: Duration,
    timer: Timer<M>,
}

impl<M: Send + 'static> SchedulerService<M> {
    pub fn new(priorities: &[Priority], mailbox: mpsc::UnboundedSender<M>) -> Self {
        let slots = priorities
            .iter()
            .filter_map(|p| {
                let interval = p.max_time_between_batches?;
                Some((
                    p.identifier.clone(),
                    Slot {
                        interval,
                        timer: Timer::new("batch-schedule", mailbox.clone()),
                    },
                ))
            })
            .collect();
        Self {
            slots,
            running: false,
        }
    }

    /// Arms every slot. `make` builds the mailbox message for one tick.
    pub fn start<F>(&mut self, make: F)
    where
        F: Fn(PriorityId, TimerTick) -> M + Send + Sync + 'static,
    {
        if self.running {
            return;
        }
        let make = Arc::new(make);
        for (priority, slot) in &mut self.slots {
            let make = Arc::clone(&make);
            let id = priority.clone();
            if let Err(e) = slot
                .timer
                .arm_repeating(slot.interval, move |tick| make(id.clone(), tick))
            {
                warn!("Scheduler could not arm {}: {}", priority, e);
            }
        }
        self.running = true;
        info!("Scheduler started for {} timed priorities", self.slots.len());
    }

    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        for slot in self.slots.values_mut() {
            slot.timer.cancel();
        }
        self.running = false;
        debug!("Scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn interval(&self, priority: &PriorityId) -> Option<Duration> {
        self.slots.get(priority).map(|slot| slot.interval)
    }

    /// Accepts a tick for `priority`; `false` means it is stale or unknown.
    pub fn begin_fire(&mut self, priority: &PriorityId, tick: TimerTick) -> bool {
        self.slots
            .get_mut(priority)
            .is_some_and(|slot| slot.timer.begin_fire(tick))
    }

    pub fn end_fire(&mut self, priority: &PriorityId, tick: TimerTick) {
        if let Some(slot) = self.slots.get_mut(priority)
            && let Err(e) = slot.timer.end_fire(tick)
        {
            warn!("{}", e);
        }
    }
}
