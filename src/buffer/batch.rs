use crate::domain::{Event, PriorityId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What caused a batch to be cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchTrigger {
    /// The priority's scheduler interval elapsed.
    Timer,
    /// The buffer crossed `max_batch_size`.
    Size,
    /// Background transition, app launch or `stop`.
    Flush,
    /// An event of an `Immediate` priority arrived.
    Immediate,
    /// A single `Instant` event, never buffered.
    Instant,
}

/// An ordered group of events of one priority, delivered as a single request.
#[derive(Debug, Clone)]
pub struct EventBatch {
    uuid: Uuid,
    priority: PriorityId,
    events: Vec<Event>,
    trigger: BatchTrigger,
    estimated_size: usize,
}

impl EventBatch {
    pub fn new(priority: PriorityId, events: Vec<Event>, trigger: BatchTrigger) -> Self {
        let estimated_size = events.iter().map(Event::size).sum();
        Self {
            uuid: Uuid::new_v4(),
            priority,
            events,
            trigger,
            estimated_size,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn priority(&self) -> &PriorityId {
        &self.priority
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn trigger(&self) -> BatchTrigger {
        self.trigger
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Sum of payload bytes.
    pub fn estimated_size(&self) -> usize {
        self.estimated_size
    }

    pub fn event_guids(&self) -> Vec<String> {
        self.events.iter().map(|e| e.guid.to_string()).collect()
    }
}
