//! Cell identities and per-cell health state.

use crate::core::error::{CoreError, CoreResult};
use crate::core::time::Timestamp;
use serde::{Deserialize, Serialize};

/// Dense cell identifier in `1..=N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellId(u32);

impl CellId {
    /// Validate `id` against a ring of `count` cells.
    pub fn new(id: u32, count: u32) -> CoreResult<Self> {
        if id == 0 || id > count {
            return Err(CoreError::invalid_input(format!(
                "cell id {} outside 1..={}",
                id, count
            )));
        }
        Ok(Self(id))
    }

    pub(crate) const fn from_raw(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// Next cell in ring order, wrapping at `count`.
    pub const fn next_in_ring(self, count: u32) -> Self {
        Self((self.0 % count) + 1)
    }

    /// Zero-based slot index.
    pub(crate) const fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cell-{}", self.0)
    }
}

/// Health status of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    Healthy,
    /// Failed at least one probe but fewer than the threshold.
    Degraded,
    Unhealthy,
}

impl CellStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for CellStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one probe against one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Failure,
}

/// A logical shard of backend capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub id: CellId,
    pub endpoint: String,
    pub status: CellStatus,
    /// Consecutive failed probes.
    pub fail_count: u32,
    pub last_check: Timestamp,
}

impl Cell {
    pub fn new(id: CellId, endpoint: impl Into<String>) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
            status: CellStatus::Healthy,
            fail_count: 0,
            last_check: Timestamp::zero(),
        }
    }

    /// Apply one probe result.
    ///
    /// One success resets to healthy. The first failure degrades, and
    /// `threshold` consecutive failures mark the cell unhealthy.
    pub fn apply_probe(&mut self, outcome: ProbeOutcome, threshold: u32, now: Timestamp) {
        self.last_check = now;
        match outcome {
            ProbeOutcome::Success => {
                self.fail_count = 0;
                self.status = CellStatus::Healthy;
            }
            ProbeOutcome::Failure => {
                self.fail_count = self.fail_count.saturating_add(1);
                self.status = if self.fail_count >= threshold {
                    CellStatus::Unhealthy
                } else {
                    CellStatus::Degraded
                };
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == CellStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_wraps_at_count() {
        let four = CellId::new(4, 4).unwrap();
        assert_eq!(four.next_in_ring(4).get(), 1);
        assert_eq!(CellId::new(2, 4).unwrap().next_in_ring(4).get(), 3);
        assert!(CellId::new(0, 4).is_err());
        assert!(CellId::new(5, 4).is_err());
    }

    #[test]
    fn probe_transitions() {
        let mut cell = Cell::new(CellId::from_raw(1), "a:1");
        cell.apply_probe(ProbeOutcome::Failure, 3, Timestamp::new(1));
        assert_eq!(cell.status, CellStatus::Degraded);
        cell.apply_probe(ProbeOutcome::Failure, 3, Timestamp::new(2));
        assert_eq!(cell.status, CellStatus::Degraded);
        cell.apply_probe(ProbeOutcome::Failure, 3, Timestamp::new(3));
        assert_eq!(cell.status, CellStatus::Unhealthy);
        assert_eq!(cell.fail_count, 3);

        cell.apply_probe(ProbeOutcome::Success, 3, Timestamp::new(4));
        assert_eq!(cell.status, CellStatus::Healthy);
        assert_eq!(cell.fail_count, 0);
        assert_eq!(cell.last_check, Timestamp::new(4));
    }

    #[test]
    fn threshold_of_one_skips_degraded() {
        let mut cell = Cell::new(CellId::from_raw(1), "a:1");
        cell.apply_probe(ProbeOutcome::Failure, 1, Timestamp::new(1));
        assert_eq!(cell.status, CellStatus::Unhealthy);
    }
}
