use super::request::EventRequest;
use crate::domain::{Priority, PriorityId};
use crate::storage::{Dao, Persistable};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};
use uuid::Uuid;

/// In-memory mirror of the `event_requests` table, partitioned by priority in
/// creation order.
///
/// Persistence failures are logged and otherwise ignored; the in-memory view
/// stays authoritative for the running process.
pub struct RequestStore {
    dao: Dao<EventRequest>,
    queues: BTreeMap<PriorityId, VecDeque<EventRequest>>,
    bytes: BTreeMap<PriorityId, u64>,
    total_bytes: u64,
}

impl RequestStore {
    /// Loads persisted requests. Rows for priorities not in `priorities` are
    /// purged.
    pub fn load(dao: Dao<EventRequest>, priorities: &[Priority]) -> Self {
        let mut store = Self {
            dao,
            queues: priorities
                .iter()
                .map(|p| (p.identifier.clone(), VecDeque::new()))
                .collect(),
            bytes: BTreeMap::new(),
            total_bytes: 0,
        };

        let mut rows = match store.dao.fetch_all() {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Could not load persisted requests: {}", e);
                Vec::new()
            }
        };
        rows.sort_by_key(|r| r.created_timestamp);

        let mut orphans = Vec::new();
        for row in rows {
            match store.queues.get_mut(&row.priority) {
                Some(queue) => {
                    *store.bytes.entry(row.priority.clone()).or_default() += row.size();
                    store.total_bytes += row.size();
                    queue.push_back(row);
                }
                None => orphans.push(row.primary_key()),
            }
        }
        if !orphans.is_empty() {
            warn!("Purging {} requests for unknown priorities", orphans.len());
            if let Err(e) = store.dao.delete_many(&orphans) {
                warn!("Could not purge orphaned requests: {}", e);
            }
        }
        if store.len() > 0 {
            debug!("Restored {} persisted requests", store.len());
        }
        store
    }

    pub fn push(&mut self, request: EventRequest) {
        if let Err(e) = self.dao.insert(&request) {
            warn!("Could not persist request {}: {}", request.guid, e);
        }
        *self.bytes.entry(request.priority.clone()).or_default() += request.size();
        self.total_bytes += request.size();
        self.queues
            .entry(request.priority.clone())
            .or_default()
            .push_back(request);
    }

    /// Oldest request of `priority`.
    pub fn front(&self, priority: &PriorityId) -> Option<&EventRequest> {
        self.queues.get(priority).and_then(|q| q.front())
    }

    pub fn get(&self, guid: Uuid) -> Option<&EventRequest> {
        self.queues.values().flatten().find(|r| r.guid == guid)
    }

    /// Replaces the stored copy of `request`, matched by guid.
    pub fn update(&mut self, request: EventRequest) {
        let Some(slot) = self
            .queues
            .get_mut(&request.priority)
            .and_then(|q| q.iter_mut().find(|r| r.guid == request.guid))
        else {
            return;
        };
        let previous = slot.size();
        if let Err(e) = self.dao.update(&request) {
            warn!("Could not update request {}: {}", request.guid, e);
        }
        *slot = request;
        let current = slot.size();
        let priority = slot.priority.clone();
        self.adjust(&priority, previous, current);
    }

    pub fn remove(&mut self, guid: Uuid) -> Option<EventRequest> {
        let removed = self.queues.values_mut().find_map(|q| {
            let index = q.iter().position(|r| r.guid == guid)?;
            q.remove(index)
        })?;
        if let Err(e) = self.dao.delete_one(&removed.primary_key()) {
            warn!("Could not delete request {}: {}", guid, e);
        }
        self.adjust(&removed.priority, removed.size(), 0);
        Some(removed)
    }

    /// Drops oldest requests of `priority` until its footprint is within
    /// `max_bytes`.
    pub fn evict_priority(&mut self, priority: &PriorityId, max_bytes: u64) -> Vec<EventRequest> {
        let mut evicted = Vec::new();
        while self.bytes(priority) > max_bytes {
            let Some(guid) = self.front(priority).map(|r| r.guid) else {
                break;
            };
            evicted.extend(self.remove(guid));
        }
        evicted
    }

    /// Drops the oldest requests across all priorities until the total
    /// footprint is within `max_bytes`.
    pub fn evict_global(&mut self, max_bytes: u64) -> Vec<EventRequest> {
        let mut evicted = Vec::new();
        while self.total_bytes > max_bytes {
            let oldest = self
                .queues
                .values()
                .filter_map(|q| q.front())
                .min_by_key(|r| r.created_timestamp)
                .map(|r| r.guid);
            let Some(guid) = oldest else {
                break;
            };
            evicted.extend(self.remove(guid));
        }
        evicted
    }

    pub fn bytes(&self, priority: &PriorityId) -> u64 {
        self.bytes.get(priority).copied().unwrap_or(0)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn priorities(&self) -> Vec<PriorityId> {
        self.queues.keys().cloned().collect()
    }

    fn adjust(&mut self, priority: &PriorityId, previous: u64, current: u64) {
        let entry = self.bytes.entry(priority.clone()).or_default();
        *entry = entry.saturating_sub(previous) + current;
        self.total_bytes = self.total_bytes.saturating_sub(previous) + current;
    }
}
