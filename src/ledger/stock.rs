//! Per-SKU stock counters.
//!
//! Counter movements are computed on a copy and only installed after the
//! journal accepted the change, so a failed append never leaves counters
//! half-moved.

use crate::core::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// Stock counters for one SKU.
///
/// Invariant: `available + reserved == total_issued - committed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAccount {
    pub available: u64,
    pub reserved: u64,
    pub total_issued: u64,
    pub committed: u64,
}

impl StockAccount {
    /// Counters after restocking `qty`.
    pub fn restocked(&self, sku: &str, qty: u64) -> CoreResult<Self> {
        let next = Self {
            available: checked_add(sku, self.available, qty, "available")?,
            total_issued: checked_add(sku, self.total_issued, qty, "total_issued")?,
            ..*self
        };
        next.verify(sku)?;
        Ok(next)
    }

    /// Counters after moving `qty` from available to reserved.
    pub fn reserved(&self, sku: &str, qty: u64) -> CoreResult<Self> {
        if self.available < qty {
            return Err(CoreError::InsufficientStock {
                sku: sku.to_string(),
                requested: qty,
                available: self.available,
            });
        }
        let next = Self {
            available: self.available - qty,
            reserved: checked_add(sku, self.reserved, qty, "reserved")?,
            ..*self
        };
        next.verify(sku)?;
        Ok(next)
    }

    /// Counters after a pending hold of `qty` is committed.
    pub fn committed(&self, sku: &str, qty: u64) -> CoreResult<Self> {
        let next = Self {
            reserved: checked_sub(sku, self.reserved, qty, "reserved")?,
            committed: checked_add(sku, self.committed, qty, "committed")?,
            ..*self
        };
        next.verify(sku)?;
        Ok(next)
    }

    /// Counters after a pending hold of `qty` returns to available.
    pub fn released(&self, sku: &str, qty: u64) -> CoreResult<Self> {
        let next = Self {
            reserved: checked_sub(sku, self.reserved, qty, "reserved")?,
            available: checked_add(sku, self.available, qty, "available")?,
            ..*self
        };
        next.verify(sku)?;
        Ok(next)
    }

    /// Rebuild counters from replayed totals.
    pub fn derive(sku: &str, total_issued: u64, committed: u64, pending: u64) -> CoreResult<Self> {
        let outstanding = committed
            .checked_add(pending)
            .ok_or_else(|| violation(sku, "committed + pending overflows"))?;
        let available = total_issued.checked_sub(outstanding).ok_or_else(|| {
            violation(
                sku,
                format!(
                    "committed {} + pending {} exceeds issued {}",
                    committed, pending, total_issued
                ),
            )
        })?;
        Ok(Self {
            available,
            reserved: pending,
            total_issued,
            committed,
        })
    }

    /// Check the conservation invariant.
    pub fn verify(&self, sku: &str) -> CoreResult<()> {
        let lhs = self.available.checked_add(self.reserved);
        let rhs = self.total_issued.checked_sub(self.committed);
        match (lhs, rhs) {
            (Some(l), Some(r)) if l == r => Ok(()),
            _ => Err(violation(
                sku,
                format!(
                    "available {} + reserved {} != issued {} - committed {}",
                    self.available, self.reserved, self.total_issued, self.committed
                ),
            )),
        }
    }
}

fn violation(sku: &str, detail: impl Into<String>) -> CoreError {
    CoreError::InvariantViolation {
        key: sku.to_string(),
        detail: detail.into(),
    }
}

fn checked_add(sku: &str, a: u64, b: u64, field: &str) -> CoreResult<u64> {
    a.checked_add(b)
        .ok_or_else(|| violation(sku, format!("{} overflow", field)))
}

fn checked_sub(sku: &str, a: u64, b: u64, field: &str) -> CoreResult<u64> {
    a.checked_sub(b)
        .ok_or_else(|| violation(sku, format!("{} underflow", field)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_commit_release_keep_conservation() {
        let a = StockAccount::default().restocked("x", 10).unwrap();
        let a = a.reserved("x", 4).unwrap();
        assert_eq!((a.available, a.reserved), (6, 4));
        let a = a.committed("x", 3).unwrap();
        assert_eq!((a.available, a.reserved, a.committed), (6, 1, 3));
        let a = a.released("x", 1).unwrap();
        assert_eq!((a.available, a.reserved), (7, 0));
        a.verify("x").unwrap();
    }

    #[test]
    fn insufficient_stock_leaves_counters() {
        let a = StockAccount::default().restocked("x", 2).unwrap();
        let err = a.reserved("x", 3).unwrap_err();
        assert!(matches!(
            err,
            CoreError::InsufficientStock {
                requested: 3,
                available: 2,
                ..
            }
        ));
    }

    #[test]
    fn underflow_is_an_invariant_violation() {
        let a = StockAccount::default().restocked("x", 2).unwrap();
        assert!(matches!(
            a.committed("x", 1),
            Err(CoreError::InvariantViolation { .. })
        ));
        assert!(StockAccount::derive("x", 2, 2, 1).is_err());
    }
}
