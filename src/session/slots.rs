//! Per-tuple bookkeeping shared by every connection feeding a session
//!
//! All mutation goes through atomics on individual fields; no lock is taken
//! while applying a partial result.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

/// Largest row total or row index a progress slot tracks.
pub const MAX_TRACKED_ROWS: u64 = u32::MAX as u64 - 1;

const INDEX_BITS: u32 = 32;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SlotError {
    RowCountConflict { existing: u64 },
    RowIndexOverrun { index: u64, total: u64 },
    RowLimitExceeded { value: u64 },
    AlreadyWritten,
    OutOfRange,
}

/// High half holds `total + 1` (0 while unknown), low half the row index.
fn pack(total: Option<u64>, index: u64) -> u64 {
    (total.map_or(0, |total| total + 1) << INDEX_BITS) | index
}

fn unpack(word: u64) -> (Option<u64>, u64) {
    let total = word >> INDEX_BITS;
    ((total > 0).then(|| total - 1), word & INDEX_MASK)
}

/// Row totals and cumulative row indices for the two DB parties.
///
/// Total and index of one party share a word, so every update is checked
/// and committed by a single compare-and-set.
#[derive(Debug, Default)]
pub struct ProgressSlot {
    rows: [AtomicU64; 2],
}

impl ProgressSlot {
    fn load(&self, db_slot: usize) -> (Option<u64>, u64) {
        unpack(self.rows[db_slot].load(Ordering::SeqCst))
    }

    pub fn row_count(&self, db_slot: usize) -> Option<u64> {
        self.load(db_slot).0
    }

    pub fn row_index(&self, db_slot: usize) -> u64 {
        self.load(db_slot).1
    }

    /// Record an optional total and add `delta` rows as one step.
    ///
    /// Repeating a known total is accepted. A rejected update changes nothing.
    pub fn update(&self, db_slot: usize, total: Option<u64>, delta: u64) -> Result<u64, SlotError> {
        if let Some(reported) = total {
            if reported > MAX_TRACKED_ROWS {
                return Err(SlotError::RowLimitExceeded { value: reported });
            }
        }

        let word = &self.rows[db_slot];
        let mut current = word.load(Ordering::SeqCst);
        loop {
            let (known, index) = unpack(current);
            let total = match (known, total) {
                (Some(existing), Some(reported)) if existing != reported => {
                    return Err(SlotError::RowCountConflict { existing });
                }
                (known, reported) => known.or(reported),
            };

            let next = index.saturating_add(delta);
            match total {
                Some(total) if next > total => {
                    return Err(SlotError::RowIndexOverrun { index: next, total });
                }
                None if next > MAX_TRACKED_ROWS => {
                    return Err(SlotError::RowLimitExceeded { value: next });
                }
                _ => {}
            }

            match word.compare_exchange_weak(current, pack(total, next), Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return Ok(next),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn set_row_count(&self, db_slot: usize, total: u64) -> Result<(), SlotError> {
        self.update(db_slot, Some(total), 0).map(|_| ())
    }

    /// Add `delta` rows; fails without effect if that passes a known total.
    pub fn advance(&self, db_slot: usize, delta: u64) -> Result<u64, SlotError> {
        self.update(db_slot, None, delta)
    }

    /// Both totals known and both indices at their totals.
    pub fn is_saturated(&self) -> bool {
        (0..2).all(|slot| match self.load(slot) {
            (Some(total), index) => index == total,
            (None, _) => false,
        })
    }

    /// `(idx1 + idx2) / (count1 + count2)`, 0 while either total is unknown.
    pub fn fraction(&self) -> f64 {
        match (self.load(0), self.load(1)) {
            ((Some(c1), i1), (Some(c2), i2)) if c1 + c2 > 0 => (i1 + i2) as f64 / (c1 + c2) as f64,
            ((Some(_), _), (Some(_), _)) => 1.0,
            _ => 0.0,
        }
    }
}

/// Finalized aggregate values; every position is written at most once.
#[derive(Debug)]
pub struct ResultSlot {
    values: Box<[OnceLock<f64>]>,
    written: AtomicUsize,
}

impl ResultSlot {
    pub fn new(aggregate_count: usize) -> Self {
        Self {
            values: (0..aggregate_count).map(|_| OnceLock::new()).collect(),
            written: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn write(&self, position: usize, value: f64) -> Result<(), SlotError> {
        let cell = self.values.get(position).ok_or(SlotError::OutOfRange)?;
        cell.set(value).map_err(|_| SlotError::AlreadyWritten)?;
        self.written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_written(&self, position: usize) -> bool {
        self.values
            .get(position)
            .map(|cell| cell.get().is_some())
            .unwrap_or(false)
    }

    pub fn get(&self, position: usize) -> Option<f64> {
        self.values.get(position).and_then(|cell| cell.get().copied())
    }

    pub fn is_full(&self) -> bool {
        self.written.load(Ordering::SeqCst) == self.values.len()
    }

    pub fn values(&self) -> Vec<Option<f64>> {
        self.values.iter().map(|cell| cell.get().copied()).collect()
    }
}

#[derive(Debug)]
pub struct TupleSlot {
    pub progress: ProgressSlot,
    pub result: ResultSlot,
    complete: AtomicBool,
}

impl TupleSlot {
    pub fn new(aggregate_count: usize) -> Self {
        Self {
            progress: ProgressSlot::default(),
            result: ResultSlot::new(aggregate_count),
            complete: AtomicBool::new(false),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.progress.is_saturated() && self.result.is_full()
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    /// True for exactly one caller, once the tuple is resolved.
    pub fn try_mark_complete(&self) -> bool {
        self.is_resolved()
            && self
                .complete
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }
}
