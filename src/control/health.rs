//! Cell health table and background prober.
//!
//! The table is single-writer, many-reader. The prober is the only writer
//! in production; readers take an `Arc` snapshot and never block on it.
//! Probe results only mutate status fields, never the cell set.

use crate::control::cells::{Cell, CellId, CellStatus, ProbeOutcome};
use crate::core::config::CellsConfig;
use crate::core::error::{CoreError, CoreResult};
use crate::core::time::{SharedClock, Timestamp};
use crate::ops::observability::{metrics, SharedMetrics};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Immutable view of every cell at one instant.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    cells: Vec<Cell>,
}

impl HealthSnapshot {
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn count(&self) -> u32 {
        self.cells.len() as u32
    }

    pub fn get(&self, id: CellId) -> Option<&Cell> {
        self.cells.get(id.index())
    }

    pub fn status(&self, id: CellId) -> CellStatus {
        self.get(id).map(|c| c.status).unwrap_or(CellStatus::Unhealthy)
    }
}

/// Shared health table.
pub struct HealthTable {
    current: RwLock<Arc<HealthSnapshot>>,
    /// Serializes writers so each update is read-modify-publish.
    writer: Mutex<()>,
    fail_threshold: u32,
}

impl HealthTable {
    /// Build the cell set from config; all cells start healthy.
    pub fn from_config(config: &CellsConfig) -> Self {
        let cells = config
            .resolved_endpoints()
            .into_iter()
            .enumerate()
            .map(|(i, endpoint)| Cell::new(CellId::from_raw(i as u32 + 1), endpoint))
            .collect();
        Self::with_cells(cells, config.health_fail_threshold)
    }

    pub fn with_cells(cells: Vec<Cell>, fail_threshold: u32) -> Self {
        Self {
            current: RwLock::new(Arc::new(HealthSnapshot { cells })),
            writer: Mutex::new(()),
            fail_threshold,
        }
    }

    /// Current snapshot; readers never observe a half-applied cycle.
    pub fn snapshot(&self) -> Arc<HealthSnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn count(&self) -> u32 {
        self.current.read().count()
    }

    pub fn fail_threshold(&self) -> u32 {
        self.fail_threshold
    }

    /// Apply one probe cycle's results.
    pub fn apply(&self, results: &[(CellId, ProbeOutcome)], now: Timestamp) {
        let _writer = self.writer.lock();
        let mut next = (**self.current.read()).clone();
        for (id, outcome) in results {
            if let Some(cell) = next.cells.get_mut(id.index()) {
                let before = cell.status;
                cell.apply_probe(*outcome, self.fail_threshold, now);
                if before != cell.status {
                    tracing::info!(
                        cell = %cell.id,
                        endpoint = %cell.endpoint,
                        from = %before,
                        to = %cell.status,
                        fail_count = cell.fail_count,
                        "cell status changed"
                    );
                }
            }
        }
        *self.current.write() = Arc::new(next);
    }

    /// Force a status (operator tooling and tests).
    pub fn set_status(&self, id: CellId, status: CellStatus) -> CoreResult<()> {
        let _writer = self.writer.lock();
        let mut next = (**self.current.read()).clone();
        let cell = next
            .cells
            .get_mut(id.index())
            .ok_or_else(|| CoreError::not_found("cell", id))?;
        cell.status = status;
        cell.fail_count = match status {
            CellStatus::Healthy => 0,
            CellStatus::Degraded => cell.fail_count.max(1),
            CellStatus::Unhealthy => cell.fail_count.max(self.fail_threshold),
        };
        *self.current.write() = Arc::new(next);
        Ok(())
    }
}

/// Health check against one cell endpoint.
#[async_trait]
pub trait CellProbe: Send + Sync {
    async fn probe(&self, endpoint: &str) -> CoreResult<()>;
}

/// Probe by opening a TCP connection.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CellProbe for TcpProbe {
    async fn probe(&self, endpoint: &str) -> CoreResult<()> {
        match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(endpoint)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(CoreError::unavailable(format!("{}: {}", endpoint, e))),
            Err(_) => Err(CoreError::deadline(format!("probe {}", endpoint))),
        }
    }
}

/// Background task polling every cell at a fixed interval.
pub struct HealthProber {
    table: Arc<HealthTable>,
    probe: Arc<dyn CellProbe>,
    clock: SharedClock,
    metrics: SharedMetrics,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthProber {
    pub fn new(
        table: Arc<HealthTable>,
        probe: Arc<dyn CellProbe>,
        clock: SharedClock,
        metrics: SharedMetrics,
        config: &CellsConfig,
    ) -> Self {
        Self {
            table,
            probe,
            clock,
            metrics,
            interval: Duration::from_millis(config.health_check_interval_ms),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
        }
    }

    /// Probe every cell concurrently and publish the results together.
    ///
    /// A cycle takes as long as its slowest probe, bounded by the probe
    /// timeout. A probe task that panics counts as a failure.
    pub async fn run_cycle(&self) {
        let snapshot = self.table.snapshot();
        let mut probes = JoinSet::new();
        for cell in snapshot.cells() {
            let probe = Arc::clone(&self.probe);
            let (id, endpoint) = (cell.id, cell.endpoint.clone());
            let timeout = self.probe_timeout;
            probes.spawn(async move {
                let outcome = match tokio::time::timeout(timeout, probe.probe(&endpoint)).await {
                    Ok(Ok(())) => ProbeOutcome::Success,
                    Ok(Err(e)) => {
                        tracing::warn!(cell = %id, error = %e, "cell probe failed");
                        ProbeOutcome::Failure
                    }
                    Err(_) => {
                        tracing::warn!(cell = %id, "cell probe timed out");
                        ProbeOutcome::Failure
                    }
                };
                (id, outcome)
            });
        }

        let mut results = Vec::with_capacity(snapshot.cells().len());
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!(error = %e, "cell probe task failed"),
            }
        }
        for cell in snapshot.cells() {
            if !results.iter().any(|(id, _)| *id == cell.id) {
                results.push((cell.id, ProbeOutcome::Failure));
            }
        }
        for (_, outcome) in &results {
            if *outcome == ProbeOutcome::Failure {
                self.metrics.counter_inc(metrics::ROUTER_PROBE_FAILURES_TOTAL);
            }
        }
        self.table.apply(&results, self.clock.now());
    }

    /// Run until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_cycle().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("health prober stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::ManualClock;
    use crate::ops::observability::MetricsRegistry;

    struct DownProbe(&'static str);

    #[async_trait]
    impl CellProbe for DownProbe {
        async fn probe(&self, endpoint: &str) -> CoreResult<()> {
            if endpoint == self.0 {
                Err(CoreError::unavailable("down"))
            } else {
                Ok(())
            }
        }
    }

    fn table() -> Arc<HealthTable> {
        let config = CellsConfig {
            count: 3,
            health_fail_threshold: 2,
            ..CellsConfig::default()
        };
        Arc::new(HealthTable::from_config(&config))
    }

    #[test]
    fn snapshot_is_stable_across_updates() {
        let table = table();
        let before = table.snapshot();
        table.apply(
            &[(CellId::from_raw(2), ProbeOutcome::Failure)],
            Timestamp::new(5),
        );
        assert_eq!(before.status(CellId::from_raw(2)), CellStatus::Healthy);
        assert_eq!(
            table.snapshot().status(CellId::from_raw(2)),
            CellStatus::Degraded
        );
    }

    #[tokio::test]
    async fn prober_marks_failing_cell_unhealthy_after_threshold() {
        let table = table();
        let config = CellsConfig {
            count: 3,
            health_fail_threshold: 2,
            ..CellsConfig::default()
        };
        let prober = HealthProber::new(
            Arc::clone(&table),
            Arc::new(DownProbe("cell-3.local:8080")),
            ManualClock::new(0),
            MetricsRegistry::shared(),
            &config,
        );

        prober.run_cycle().await;
        assert_eq!(
            table.snapshot().status(CellId::from_raw(3)),
            CellStatus::Degraded
        );
        prober.run_cycle().await;
        let snap = table.snapshot();
        assert_eq!(snap.status(CellId::from_raw(3)), CellStatus::Unhealthy);
        assert_eq!(snap.status(CellId::from_raw(1)), CellStatus::Healthy);
        assert_eq!(snap.count(), 3);
    }

    struct SlowProbe(Duration);

    #[async_trait]
    impl CellProbe for SlowProbe {
        async fn probe(&self, _endpoint: &str) -> CoreResult<()> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn cycle_checks_cells_concurrently() {
        let config = CellsConfig {
            count: 8,
            probe_timeout_ms: 5_000,
            ..CellsConfig::default()
        };
        let table = Arc::new(HealthTable::from_config(&config));
        table
            .set_status(CellId::from_raw(4), CellStatus::Degraded)
            .unwrap();
        let prober = HealthProber::new(
            Arc::clone(&table),
            Arc::new(SlowProbe(Duration::from_millis(200))),
            ManualClock::new(0),
            MetricsRegistry::shared(),
            &config,
        );

        let started = std::time::Instant::now();
        prober.run_cycle().await;
        // Eight sequential probes would take 1.6s.
        assert!(started.elapsed() < Duration::from_millis(800));
        let snap = table.snapshot();
        for cell in snap.cells() {
            assert_eq!(cell.status, CellStatus::Healthy);
        }
    }
}
