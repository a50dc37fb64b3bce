//! Clock, timestamps and deadlines.
//!
//! Wall-clock time drives TTLs, challenge expiry and sale windows; it must be
//! within a few seconds of real time. All components read time through the
//! [`Clock`] trait so tests can drive expiry deterministically.

use crate::core::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Wall-clock milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub ms: u64,
}

impl Timestamp {
    pub const fn new(ms: u64) -> Self {
        Self { ms }
    }

    pub const fn zero() -> Self {
        Self { ms: 0 }
    }

    pub const fn add_ms(self, ms: u64) -> Self {
        Self {
            ms: self.ms.saturating_add(ms),
        }
    }

    pub const fn sub_ms(self, ms: u64) -> Self {
        Self {
            ms: self.ms.saturating_sub(ms),
        }
    }

    /// Check if this timestamp is at or after the given deadline.
    pub const fn is_at_or_after(self, deadline: Timestamp) -> bool {
        self.ms >= deadline.ms
    }

    pub const fn is_before(self, deadline: Timestamp) -> bool {
        self.ms < deadline.ms
    }

    /// Milliseconds until `deadline`, 0 if it already passed.
    pub fn ms_until(self, deadline: Timestamp) -> u64 {
        deadline.ms.saturating_sub(self.ms)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.ms)
    }
}

/// Time source shared by every component.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> Timestamp;
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// Operating-system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Timestamp::new(ms)
    }
}

/// Manually driven clock for tests and replay tooling.
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            ms: AtomicU64::new(start_ms),
        })
    }

    pub fn set(&self, ms: u64) {
        self.ms.store(ms, Ordering::Release);
    }

    pub fn advance(&self, ms: u64) {
        self.ms.fetch_add(ms, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.ms.load(Ordering::Acquire))
    }
}

/// Caller-supplied budget for an operation.
///
/// A deadline elapsing before durable acknowledgment yields
/// `deadline_exceeded`; the underlying operation may still complete, which is
/// why every operation is keyed by a retry-safe identifier.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: tokio::time::Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: tokio::time::Instant::now() + budget,
        }
    }

    pub fn after_ms(ms: u64) -> Self {
        Self::after(Duration::from_millis(ms))
    }

    /// A deadline far enough away to never fire in practice.
    pub fn unbounded() -> Self {
        Self::after(Duration::from_secs(365 * 24 * 3600))
    }

    pub fn instant(&self) -> tokio::time::Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(tokio::time::Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// The earlier of this deadline and `budget` from now.
    pub fn min_budget(&self, budget: Duration) -> Self {
        let candidate = tokio::time::Instant::now() + budget;
        Self {
            at: candidate.min(self.at),
        }
    }

    /// Fail fast if the budget is already spent.
    pub fn check(&self, operation: &str) -> CoreResult<()> {
        if self.is_expired() {
            return Err(CoreError::deadline(operation));
        }
        Ok(())
    }

    /// Run `fut` under this deadline.
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> CoreResult<T>
    where
        F: Future<Output = CoreResult<T>>,
    {
        match tokio::time::timeout_at(self.at, fut).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::deadline(operation)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_arithmetic_saturates() {
        let t = Timestamp::new(10);
        assert_eq!(t.sub_ms(20), Timestamp::zero());
        assert_eq!(Timestamp::new(u64::MAX).add_ms(1).ms, u64::MAX);
        assert_eq!(t.ms_until(Timestamp::new(4)), 0);
        assert!(t.add_ms(5).is_at_or_after(Timestamp::new(15)));
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(500);
        assert_eq!(clock.now(), Timestamp::new(1_500));
        clock.set(0);
        assert_eq!(clock.now(), Timestamp::zero());
    }

    #[tokio::test]
    async fn deadline_fires_on_slow_future() {
        let deadline = Deadline::after_ms(10);
        let result: CoreResult<()> = deadline
            .run("sleep", async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CoreError::DeadlineExceeded { .. })));
    }
}
