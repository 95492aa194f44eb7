use crate::domain::PriorityId;
use crate::storage::Database;
use std::collections::HashMap;
use tracing::{debug, warn};

const META_PREFIX: &str = "regulated_batch_count";

/// Derives how many events fit a batch from the sizes seen so far.
///
/// The last computed count per priority is persisted, so after a cold start
/// the first timer cut uses the previous value instead of zero.
#[derive(Debug)]
pub struct BatchSizeRegulator {
    db: Database,
    total_bytes: u64,
    observed: u64,
    persisted: HashMap<PriorityId, usize>,
}

impl BatchSizeRegulator {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            total_bytes: 0,
            observed: 0,
            persisted: HashMap::new(),
        }
    }

    pub fn observe(&mut self, event_bytes: usize) {
        self.total_bytes = self.total_bytes.saturating_add(event_bytes as u64);
        self.observed += 1;
    }

    pub fn average_event_size(&self) -> Option<u64> {
        (self.observed > 0).then(|| self.total_bytes / self.observed)
    }

    /// `floor(expected_bytes / average_event_size)`, or the stored value
    /// (default 0) while nothing has been observed.
    pub fn regulated_count(&mut self, priority: &PriorityId, expected_bytes: usize) -> usize {
        let Some(average) = self.average_event_size() else {
            return self.stored(priority);
        };

        let count = expected_bytes / average.max(1) as usize;
        if self.persisted.get(priority) != Some(&count) {
            match self.db.meta_put(&meta_key(priority), count as u64) {
                Ok(()) => {
                    debug!("Regulated batch count for {} is now {}", priority, count);
                }
                Err(e) => warn!("Failed to persist regulated count for {}: {}", priority, e),
            }
            self.persisted.insert(priority.clone(), count);
        }
        count
    }

    fn stored(&mut self, priority: &PriorityId) -> usize {
        if let Some(count) = self.persisted.get(priority) {
            return *count;
        }
        let count = match self.db.meta_get(&meta_key(priority)) {
            Ok(value) => value.unwrap_or(0) as usize,
            Err(e) => {
                warn!("Failed to read regulated count for {}: {}", priority, e);
                0
            }
        };
        self.persisted.insert(priority.clone(), count);
        count
    }
}

fn meta_key(priority: &PriorityId) -> String {
    format!("{META_PREFIX}/{priority}")
}
