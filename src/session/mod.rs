//! In-flight query sessions
//!
//! A session owns its domain and the per-tuple slot arrays. Connections
//! mutate slots concurrently; lifecycle transitions are single CAS steps on
//! the session state.

pub mod aggregator;
pub mod client;
pub mod id;
pub mod registry;
pub mod slots;

pub use aggregator::{apply_partial_result, ApplyOutcome};
pub use client::{ClientHandle, ResultRow, ResultTable};
pub use id::QueryId;
pub use registry::CorrelationRegistry;
pub use slots::{ProgressSlot, ResultSlot, TupleSlot};

use crate::domain::DomainIterator;
use crate::error::Result;
use crate::query::Query;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Created = 0,
    Dispatched = 1,
    AwaitingResults = 2,
    Completed = 3,
    Failed = 4,
    TimedOut = 5,
    Cancelled = 6,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Created,
            1 => SessionState::Dispatched,
            2 => SessionState::AwaitingResults,
            3 => SessionState::Completed,
            4 => SessionState::Failed,
            5 => SessionState::TimedOut,
            _ => SessionState::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Failed
                | SessionState::TimedOut
                | SessionState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Dispatched => "dispatched",
            SessionState::AwaitingResults => "awaiting_results",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::TimedOut => "timed_out",
            SessionState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct QuerySession {
    id: QueryId,
    query: Arc<Query>,
    domain: DomainIterator,
    slots: Box<[TupleSlot]>,
    /// Tuples not yet complete.
    remaining: AtomicUsize,
    state: AtomicU8,
    client: ClientHandle,
    created_at_ms: i64,
    /// Wakes the progress reporter after a tuple completes or the session ends.
    changed: Notify,
    /// Wakes every task waiting in `terminated`.
    ended: Notify,
}

impl QuerySession {
    /// Build the domain and allocate slots. Fails before any party is contacted.
    pub fn new(id: QueryId, query: Arc<Query>, client: ClientHandle, created_at_ms: i64) -> Result<Self> {
        let domain = DomainIterator::new(query.clone())?;
        let aggregate_count = query.aggregates.len();
        let slots: Box<[TupleSlot]> = (0..domain.count())
            .map(|_| TupleSlot::new(aggregate_count))
            .collect();

        Ok(Self {
            id,
            remaining: AtomicUsize::new(slots.len()),
            query,
            domain,
            slots,
            state: AtomicU8::new(SessionState::Created as u8),
            client,
            created_at_ms,
            changed: Notify::new(),
            ended: Notify::new(),
        })
    }

    pub fn id(&self) -> QueryId {
        self.id
    }

    pub fn query(&self) -> &Arc<Query> {
        &self.query
    }

    pub fn domain(&self) -> &DomainIterator {
        &self.domain
    }

    pub fn client(&self) -> &ClientHandle {
        &self.client
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    pub fn tuple_count(&self) -> usize {
        self.slots.len()
    }

    pub fn aggregate_count(&self) -> usize {
        self.query.aggregates.len()
    }

    pub fn tuple(&self, index: usize) -> Option<&TupleSlot> {
        self.slots.get(index)
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn remaining_tuples(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    /// Move `from -> to`; false if the session was not in `from`.
    pub fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Enter a terminal state from any live one. Only the first caller wins.
    pub fn finish(&self, to: SessionState) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if SessionState::from_u8(current).is_terminal() {
                return false;
            }
            match self
                .state
                .compare_exchange(current, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    self.changed.notify_one();
                    self.ended.notify_waiters();
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_tuple_complete(&self, index: usize) -> bool {
        self.slots.get(index).map(TupleSlot::is_complete).unwrap_or(false)
    }

    /// Claim completion of a resolved tuple. `None` if not claimed here,
    /// `Some(true)` when it was the last outstanding tuple.
    pub(crate) fn mark_tuple_complete(&self, index: usize) -> Option<bool> {
        let slot = self.slots.get(index)?;
        if !slot.try_mark_complete() {
            return None;
        }
        let before = self.remaining.fetch_sub(1, Ordering::SeqCst);
        self.changed.notify_one();
        Some(before == 1)
    }

    pub fn tuple_fraction(&self, index: usize) -> f64 {
        self.slots
            .get(index)
            .map(|slot| slot.progress.fraction())
            .unwrap_or(0.0)
    }

    /// Group values and rounded aggregate values for one tuple.
    pub fn tuple_row(&self, index: usize, scale: u32) -> Option<ResultRow> {
        let slot = self.slots.get(index)?;
        Some(ResultRow {
            group: self.domain.tuple(index)?,
            values: slot
                .result
                .values()
                .into_iter()
                .map(|v| v.map(|value| client::round_to_scale(value, scale)))
                .collect(),
        })
    }

    pub fn result_table(&self, scale: u32) -> ResultTable {
        let mut columns = self.domain.column_names();
        columns.extend(self.query.aggregate_labels());

        ResultTable {
            columns,
            rows: (0..self.slots.len())
                .filter_map(|index| self.tuple_row(index, scale))
                .collect(),
        }
    }

    pub async fn changed(&self) {
        self.changed.notified().await
    }

    /// Resolves once the session is in a terminal state.
    pub async fn terminated(&self) {
        let ended = self.ended.notified();
        tokio::pin!(ended);
        ended.as_mut().enable();
        if self.is_terminal() {
            return;
        }
        ended.await
    }
}

impl std::fmt::Debug for QuerySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("tuple_count", &self.slots.len())
            .field("remaining", &self.remaining_tuples())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;
    use crate::query::fixtures::query_with_dimensions;

    fn session(sizes: &[usize]) -> Result<QuerySession> {
        let (client, _rx) = ClientHandle::channel("test", 8);
        QuerySession::new(QueryId::mint(), Arc::new(query_with_dimensions(sizes)), client, 0)
    }

    #[test]
    fn test_slots_sized_to_domain() {
        let session = session(&[3, 4]).unwrap();
        assert_eq!(session.tuple_count(), 12);
        assert_eq!(session.remaining_tuples(), 12);
        assert_eq!(session.tuple(11).unwrap().result.len(), 2);
        assert!(session.tuple(12).is_none());
        assert_eq!(session.state(), SessionState::Created);
    }

    #[test]
    fn test_overflow_rejected_at_construction() {
        let err = session(&[70_000, 70_000]).unwrap_err();
        assert!(matches!(err, QueryError::DomainOverflow { .. }));
    }

    #[test]
    fn test_transitions() {
        let session = session(&[]).unwrap();
        assert!(session.transition(SessionState::Created, SessionState::Dispatched));
        assert!(!session.transition(SessionState::Created, SessionState::Dispatched));
        assert!(session.transition(SessionState::Dispatched, SessionState::AwaitingResults));

        assert!(session.finish(SessionState::TimedOut));
        assert!(!session.finish(SessionState::Completed));
        assert_eq!(session.state(), SessionState::TimedOut);
        assert!(session.is_terminal());
    }

    #[tokio::test]
    async fn test_terminated_wakes_waiters() {
        let session = Arc::new(session(&[1]).unwrap());

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.terminated().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        session.finish(SessionState::Cancelled);
        tokio::time::timeout(std::time::Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();

        // already terminal: returns at once
        session.terminated().await;
    }

    #[test]
    fn test_result_table_rounds_values() {
        let session = session(&[2]).unwrap();
        session.tuple(0).unwrap().result.write(1, 1.23456789).unwrap();

        let table = session.result_table(3);
        assert_eq!(table.columns, vec!["visits.g0", "count(visits.id)", "sum(visits.cost)"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].group, vec![Some("v0".to_string())]);
        assert_eq!(table.rows[0].values, vec![None, Some(1.235)]);
    }
}
