//! Applies partial-result events to a session's slots
//!
//! An event is checked against the slot state before anything is written,
//! so a rejected event normally leaves the session untouched. Racing writers
//! can still lose a check-then-write race; the slot primitives then reject
//! the losing field update and the stored value is kept.

use super::slots::{SlotError, MAX_TRACKED_ROWS};
use super::QuerySession;
use crate::error::ProtocolViolation;
use crate::transport::messages::PartialResult;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    TupleCompleted(usize),
    /// The event completed the session's last outstanding tuple.
    SessionCompleted,
}

pub fn apply_partial_result(
    session: &QuerySession,
    event: &PartialResult,
) -> Result<ApplyOutcome, ProtocolViolation> {
    let query_id = session.id();
    let tuple_index = event.tuple_index;

    let slot = session
        .tuple(tuple_index)
        .ok_or(ProtocolViolation::TupleOutOfRange {
            query_id,
            tuple_index,
            tuple_count: session.tuple_count(),
        })?;

    let mut db_slots = Vec::with_capacity(event.progress.len());
    for progress in &event.progress {
        let db_slot = progress.db.db_slot().ok_or(ProtocolViolation::NotADbParty {
            query_id,
            party: progress.db,
        })?;

        if let Some(reported) = progress.row_count.filter(|&rows| rows > MAX_TRACKED_ROWS) {
            return Err(ProtocolViolation::RowLimitExceeded {
                query_id,
                tuple_index,
                db: progress.db,
                value: reported,
            });
        }

        let known = slot.progress.row_count(db_slot);
        if let (Some(existing), Some(reported)) = (known, progress.row_count) {
            if existing != reported {
                return Err(ProtocolViolation::RowCountConflict {
                    query_id,
                    tuple_index,
                    db: progress.db,
                    existing,
                    reported,
                });
            }
        }

        if let Some(total) = known.or(progress.row_count) {
            let index = slot.progress.row_index(db_slot).saturating_add(progress.row_delta);
            if index > total {
                return Err(ProtocolViolation::RowIndexOverrun {
                    query_id,
                    tuple_index,
                    db: progress.db,
                    index,
                    total,
                });
            }
        }

        db_slots.push(db_slot);
    }

    let mut positions = HashSet::with_capacity(event.values.len());
    for value in &event.values {
        if value.position >= slot.result.len() {
            return Err(ProtocolViolation::AggregateOutOfRange {
                query_id,
                tuple_index,
                position: value.position,
                aggregate_count: slot.result.len(),
            });
        }
        if slot.result.is_written(value.position) || !positions.insert(value.position) {
            return Err(ProtocolViolation::DoubleWrite {
                query_id,
                tuple_index,
                position: value.position,
            });
        }
    }

    for (progress, &db_slot) in event.progress.iter().zip(&db_slots) {
        let violation = |err: SlotError| match err {
            SlotError::RowCountConflict { existing } => ProtocolViolation::RowCountConflict {
                query_id,
                tuple_index,
                db: progress.db,
                existing,
                reported: progress.row_count.unwrap_or(existing),
            },
            SlotError::RowIndexOverrun { index, total } => ProtocolViolation::RowIndexOverrun {
                query_id,
                tuple_index,
                db: progress.db,
                index,
                total,
            },
            SlotError::RowLimitExceeded { value } => ProtocolViolation::RowLimitExceeded {
                query_id,
                tuple_index,
                db: progress.db,
                value,
            },
            SlotError::AlreadyWritten | SlotError::OutOfRange => ProtocolViolation::TupleOutOfRange {
                query_id,
                tuple_index,
                tuple_count: session.tuple_count(),
            },
        };

        slot.progress
            .update(db_slot, progress.row_count, progress.row_delta)
            .map_err(violation)?;
    }

    for value in &event.values {
        slot.result
            .write(value.position, value.value)
            .map_err(|_| ProtocolViolation::DoubleWrite {
                query_id,
                tuple_index,
                position: value.position,
            })?;
    }

    Ok(match session.mark_tuple_complete(tuple_index) {
        Some(true) => ApplyOutcome::SessionCompleted,
        Some(false) => ApplyOutcome::TupleCompleted(tuple_index),
        None => ApplyOutcome::Applied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::party::Party;
    use crate::query::fixtures::query_with_dimensions;
    use crate::session::{ClientHandle, QueryId};
    use crate::transport::messages::{AggregateValue, RowProgress};
    use std::sync::Arc;

    fn session(sizes: &[usize]) -> QuerySession {
        let (client, _rx) = ClientHandle::channel("test", 8);
        QuerySession::new(QueryId::mint(), Arc::new(query_with_dimensions(sizes)), client, 0).unwrap()
    }

    fn event(
        session: &QuerySession,
        tuple_index: usize,
        progress: Vec<RowProgress>,
        values: Vec<(usize, f64)>,
    ) -> PartialResult {
        PartialResult {
            query_id: session.id(),
            tuple_index,
            progress,
            values: values
                .into_iter()
                .map(|(position, value)| AggregateValue { position, value })
                .collect(),
        }
    }

    fn rows(db: Party, row_count: Option<u64>, row_delta: u64) -> RowProgress {
        RowProgress {
            db,
            row_count,
            row_delta,
        }
    }

    #[test]
    fn test_tuple_completes_only_when_counts_and_values_are_in() {
        let session = session(&[2]);

        let outcome = apply_partial_result(
            &session,
            &event(&session, 0, vec![rows(Party::Db1, Some(2), 2)], vec![(0, 4.0)]),
        )
        .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        // db2 total still unknown
        let outcome = apply_partial_result(&session, &event(&session, 0, vec![], vec![(1, 9.0)])).unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let outcome = apply_partial_result(
            &session,
            &event(&session, 0, vec![rows(Party::Db2, Some(0), 0)], vec![]),
        )
        .unwrap();
        assert_eq!(outcome, ApplyOutcome::TupleCompleted(0));
        assert_eq!(session.remaining_tuples(), 1);
    }

    #[test]
    fn test_last_tuple_completes_session() {
        let session = session(&[]);
        let outcome = apply_partial_result(
            &session,
            &event(
                &session,
                0,
                vec![rows(Party::Db1, Some(1), 1), rows(Party::Db2, Some(1), 1)],
                vec![(0, 1.0), (1, 2.0)],
            ),
        )
        .unwrap();
        assert_eq!(outcome, ApplyOutcome::SessionCompleted);
        assert_eq!(session.remaining_tuples(), 0);
    }

    #[test]
    fn test_double_write_keeps_first_value() {
        let session = session(&[]);
        apply_partial_result(&session, &event(&session, 0, vec![], vec![(1, 5.0)])).unwrap();

        let err = apply_partial_result(
            &session,
            &event(&session, 0, vec![rows(Party::Db1, None, 3)], vec![(1, 6.0)]),
        )
        .unwrap_err();

        assert!(matches!(err, ProtocolViolation::DoubleWrite { position: 1, .. }));
        assert_eq!(session.tuple(0).unwrap().result.get(1), Some(5.0));
        // the rejected event's row delta was not applied either
        assert_eq!(session.tuple(0).unwrap().progress.row_index(0), 0);
    }

    #[test]
    fn test_out_of_range_events_rejected() {
        let session = session(&[3]);

        let err = apply_partial_result(&session, &event(&session, 3, vec![], vec![])).unwrap_err();
        assert!(matches!(err, ProtocolViolation::TupleOutOfRange { tuple_count: 3, .. }));

        let err = apply_partial_result(&session, &event(&session, 1, vec![], vec![(2, 0.0)])).unwrap_err();
        assert!(matches!(err, ProtocolViolation::AggregateOutOfRange { position: 2, .. }));

        let err = apply_partial_result(&session, &event(&session, 1, vec![rows(Party::Ph, None, 1)], vec![]))
            .unwrap_err();
        assert!(matches!(err, ProtocolViolation::NotADbParty { party: Party::Ph, .. }));
    }

    #[test]
    fn test_row_count_conflict_and_overrun() {
        let session = session(&[]);
        apply_partial_result(&session, &event(&session, 0, vec![rows(Party::Db2, Some(4), 3)], vec![])).unwrap();

        let err = apply_partial_result(&session, &event(&session, 0, vec![rows(Party::Db2, Some(5), 0)], vec![]))
            .unwrap_err();
        assert!(matches!(err, ProtocolViolation::RowCountConflict { existing: 4, reported: 5, .. }));

        let err = apply_partial_result(&session, &event(&session, 0, vec![rows(Party::Db2, None, 2)], vec![]))
            .unwrap_err();
        assert!(matches!(err, ProtocolViolation::RowIndexOverrun { index: 5, total: 4, .. }));
        assert_eq!(session.tuple(0).unwrap().progress.row_index(1), 3);
    }

    #[test]
    fn test_rejected_progress_leaves_total_unset() {
        let session = session(&[]);
        apply_partial_result(&session, &event(&session, 0, vec![rows(Party::Db1, None, 5)], vec![])).unwrap();

        let err = apply_partial_result(&session, &event(&session, 0, vec![rows(Party::Db1, Some(3), 0)], vec![]))
            .unwrap_err();
        assert!(matches!(err, ProtocolViolation::RowIndexOverrun { index: 5, total: 3, .. }));
        assert_eq!(session.tuple(0).unwrap().progress.row_count(0), None);

        let err = apply_partial_result(
            &session,
            &event(&session, 0, vec![rows(Party::Db2, Some(MAX_TRACKED_ROWS + 1), 0)], vec![]),
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolViolation::RowLimitExceeded { .. }));
        assert_eq!(session.tuple(0).unwrap().progress.row_count(1), None);
    }
}
