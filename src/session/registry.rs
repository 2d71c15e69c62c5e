use super::{QueryId, QuerySession};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Process-wide query id -> session table.
///
/// Lookups are sharded reads; only insert and remove take a shard write lock.
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    sessions: DashMap<QueryId, Arc<QuerySession>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// False if the id is already in flight.
    pub fn insert(&self, session: Arc<QuerySession>) -> bool {
        match self.sessions.entry(session.id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session);
                true
            }
        }
    }

    pub fn get(&self, id: &QueryId) -> Option<Arc<QuerySession>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &QueryId) -> Option<Arc<QuerySession>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn contains(&self, id: &QueryId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<QueryId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn sessions_for_client(&self, client_ref: &str) -> Vec<Arc<QuerySession>> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().client().client_ref() == client_ref)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Sessions whose age at `now_ms` exceeds `max_lifetime_ms`.
    pub fn expired(&self, now_ms: i64, max_lifetime_ms: i64) -> Vec<Arc<QuerySession>> {
        self.sessions
            .iter()
            .filter(|entry| now_ms - entry.value().created_at_ms() > max_lifetime_ms)
            .map(|entry| entry.value().clone())
            .collect()
    }
}
