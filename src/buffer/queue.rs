use crate::domain::Event;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Limits applied when cutting events off the front of an [`EventBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutLimit {
    pub max_events: usize,
    pub max_bytes: usize,
}

impl CutLimit {
    pub const UNBOUNDED: CutLimit = CutLimit {
        max_events: usize::MAX,
        max_bytes: usize::MAX,
    };

    pub fn new(max_events: usize, max_bytes: Option<usize>) -> Self {
        Self {
            max_events,
            max_bytes: max_bytes.unwrap_or(usize::MAX),
        }
    }
}

/// Not-yet-batched events of one priority, oldest first.
///
/// Keyed by `(timestamp, arrival)` so out-of-order timestamps land in place
/// and equal timestamps keep arrival order. Appending an in-order event hits
/// the right edge of the tree.
#[derive(Debug, Default)]
pub struct EventBuffer {
    events: BTreeMap<(DateTime<Utc>, u64), Event>,
    arrivals: u64,
    bytes: usize,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.bytes += event.size();
        self.arrivals += 1;
        self.events.insert((event.timestamp, self.arrivals), event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Cumulative payload bytes currently buffered.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Removes the oldest events within `limit`. A non-empty buffer always
    /// yields at least one event, so an event larger than the byte budget
    /// still leaves as a batch of its own.
    pub fn cut(&mut self, limit: CutLimit) -> Vec<Event> {
        let mut taken = Vec::new();
        let mut taken_bytes = 0usize;

        while taken.len() < limit.max_events {
            let Some(entry) = self.events.first_entry() else {
                break;
            };
            let size = entry.get().size();
            if !taken.is_empty() && taken_bytes.saturating_add(size) > limit.max_bytes {
                break;
            }
            taken_bytes += size;
            taken.push(entry.remove());
        }

        self.bytes -= taken_bytes;
        taken
    }

    /// Removes everything, oldest first.
    pub fn drain(&mut self) -> Vec<Event> {
        self.bytes = 0;
        std::mem::take(&mut self.events).into_values().collect()
    }
}
