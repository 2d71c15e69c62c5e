//! Per-party outbound byte budgets
//!
//! Each party has a semaphore with one permit per byte. A sender reserves
//! permits for a frame before it is queued; the writer task releases them
//! after the frame is on the wire. A full budget suspends only senders to
//! that party.

use crate::config::ConfigError;
use crate::party::Party;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub const DEFAULT_OUTPUT_BUFFER_LIMIT_KIB: i64 = 64;
/// Largest KiB value whose byte count still fits an `i32`.
pub const MAX_OUTPUT_BUFFER_LIMIT_KIB: i64 = (i32::MAX / 1024) as i64;

#[derive(Debug, Clone, PartialEq)]
pub struct OutputBufferLimits {
    bytes: BTreeMap<Party, usize>,
}

impl Default for OutputBufferLimits {
    fn default() -> Self {
        let bytes = Party::all()
            .into_iter()
            .map(|party| (party, (DEFAULT_OUTPUT_BUFFER_LIMIT_KIB * 1024) as usize))
            .collect();
        Self { bytes }
    }
}

impl OutputBufferLimits {
    /// One KiB value for every party.
    pub fn uniform_kib(kib: i64) -> Result<Self, ConfigError> {
        let per_party: BTreeMap<Party, i64> =
            Party::all().into_iter().map(|party| (party, kib)).collect();
        Self::from_kib(&per_party)
    }

    /// Per-party KiB values; parties not listed keep the default.
    pub fn from_kib(per_party: &BTreeMap<Party, i64>) -> Result<Self, ConfigError> {
        let mut limits = Self::default();
        for (&party, &kib) in per_party {
            if !(1..=MAX_OUTPUT_BUFFER_LIMIT_KIB).contains(&kib) {
                return Err(ConfigError::invalid(
                    format!("channel_output_buffer_limit.{}", party),
                    format!(
                        "value must be an integer between 1 and {} (got {})",
                        MAX_OUTPUT_BUFFER_LIMIT_KIB, kib
                    ),
                ));
            }
            limits.bytes.insert(party, (kib * 1024) as usize);
        }
        Ok(limits)
    }

    /// Budget in bytes.
    pub fn get(&self, party: Party) -> usize {
        self.bytes
            .get(&party)
            .copied()
            .unwrap_or((DEFAULT_OUTPUT_BUFFER_LIMIT_KIB * 1024) as usize)
    }
}

/// Reserved bytes toward one party; released on drop.
#[derive(Debug)]
pub struct OutboundPermit {
    _permit: OwnedSemaphorePermit,
    bytes: usize,
}

impl OutboundPermit {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

#[derive(Debug)]
pub struct BackpressureController {
    budgets: HashMap<Party, (usize, Arc<Semaphore>)>,
}

impl BackpressureController {
    pub fn new(limits: &OutputBufferLimits) -> Self {
        let budgets = Party::all()
            .into_iter()
            .map(|party| {
                let limit = limits.get(party);
                (party, (limit, Arc::new(Semaphore::new(limit))))
            })
            .collect();
        Self { budgets }
    }

    /// Wait until `len` bytes fit in `party`'s budget.
    ///
    /// A frame larger than the whole budget reserves all of it, so it waits
    /// for an empty buffer instead of waiting forever.
    pub async fn reserve(&self, party: Party, len: usize) -> Option<OutboundPermit> {
        let (limit, semaphore) = self.budgets.get(&party)?;
        let bytes = len.min(*limit).max(1);
        let permit = semaphore.clone().acquire_many_owned(bytes as u32).await.ok()?;
        Some(OutboundPermit {
            _permit: permit,
            bytes,
        })
    }

    pub fn available(&self, party: Party) -> usize {
        self.budgets
            .get(&party)
            .map(|(_, semaphore)| semaphore.available_permits())
            .unwrap_or(0)
    }

    pub fn limit(&self, party: Party) -> usize {
        self.budgets.get(&party).map(|(limit, _)| *limit).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_limits_scaled_and_validated() {
        let limits = OutputBufferLimits::uniform_kib(2).unwrap();
        assert_eq!(limits.get(Party::Db1), 2048);

        let mut per_party = BTreeMap::new();
        per_party.insert(Party::Db1, 0);
        let err = OutputBufferLimits::from_kib(&per_party).unwrap_err();
        assert!(err.to_string().contains("channel_output_buffer_limit.db1"));

        assert!(OutputBufferLimits::uniform_kib(MAX_OUTPUT_BUFFER_LIMIT_KIB).is_ok());
        assert!(OutputBufferLimits::uniform_kib(MAX_OUTPUT_BUFFER_LIMIT_KIB + 1).is_err());
    }

    #[tokio::test]
    async fn test_reserve_suspends_until_bytes_are_released() {
        let controller = Arc::new(BackpressureController::new(
            &OutputBufferLimits::uniform_kib(1).unwrap(),
        ));

        let first = controller.reserve(Party::Db2, 1000).await.unwrap();
        assert_eq!(controller.available(Party::Db2), 24);

        let blocked = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.reserve(Party::Db2, 100).await.map(|p| p.bytes()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        // other parties are unaffected
        assert!(controller.reserve(Party::Db1, 1024).await.is_some());

        drop(first);
        assert_eq!(blocked.await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn test_oversized_frame_takes_whole_budget() {
        let controller = BackpressureController::new(&OutputBufferLimits::uniform_kib(1).unwrap());
        let permit = controller.reserve(Party::Ph, 10_000).await.unwrap();
        assert_eq!(permit.bytes(), 1024);
        assert_eq!(controller.available(Party::Ph), 0);
    }
}
