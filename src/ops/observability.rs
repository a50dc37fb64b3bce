//! Metrics and health reports.
//!
//! Metric namespaces:
//! - cellmart.router.*
//! - cellmart.ledger.*
//! - cellmart.flash.*
//! - cellmart.wallet.*
//! - cellmart.saga.*

use crate::control::cells::CellStatus;
use crate::control::health::HealthSnapshot;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metric names.
pub mod metrics {
    pub const ROUTER_FAILOVERS_TOTAL: &str = "cellmart.router.failovers_total";
    pub const ROUTER_DEGRADED_TOTAL: &str = "cellmart.router.degraded_total";
    pub const ROUTER_PROBE_FAILURES_TOTAL: &str = "cellmart.router.probe_failures_total";
    pub const LEDGER_RESERVE_TOTAL: &str = "cellmart.ledger.reserve_total";
    pub const LEDGER_INSUFFICIENT_TOTAL: &str = "cellmart.ledger.insufficient_total";
    pub const LEDGER_COMMIT_TOTAL: &str = "cellmart.ledger.commit_total";
    pub const LEDGER_ROLLBACK_TOTAL: &str = "cellmart.ledger.rollback_total";
    pub const LEDGER_EXPIRED_TOTAL: &str = "cellmart.ledger.expired_total";
    pub const LEDGER_PENDING: &str = "cellmart.ledger.pending_reservations";
    pub const FLASH_ADMITTED_TOTAL: &str = "cellmart.flash.admitted_total";
    /// Suffixed with the rejection reason, e.g. `.sold_out`.
    pub const FLASH_REJECTED_TOTAL: &str = "cellmart.flash.rejected_total";
    pub const FLASH_QUEUE_DEPTH: &str = "cellmart.flash.queue_depth";
    pub const FLASH_CONFIRMED_TOTAL: &str = "cellmart.flash.confirmed_total";
    pub const WALLET_CAS_CONFLICTS_TOTAL: &str = "cellmart.wallet.cas_conflicts_total";
    pub const WALLET_MUTATIONS_TOTAL: &str = "cellmart.wallet.mutations_total";
    pub const SAGA_COMPLETED_TOTAL: &str = "cellmart.saga.completed_total";
    pub const SAGA_FAILED_TOTAL: &str = "cellmart.saga.failed_total";
    pub const SAGA_COMPENSATIONS_TOTAL: &str = "cellmart.saga.compensations_total";
    pub const SAGA_FLAGGED_TOTAL: &str = "cellmart.saga.flagged_total";
    pub const SAGA_RESUMED_TOTAL: &str = "cellmart.saga.resumed_total";
}

/// Shared handle to a registry.
pub type SharedMetrics = Arc<MetricsRegistry>;

/// Named atomic counters and gauges.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, AtomicU64>>,
    gauges: RwLock<BTreeMap<String, AtomicU64>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedMetrics {
        Arc::new(Self::new())
    }

    pub fn counter_inc(&self, name: &str) {
        self.counter_add(name, 1);
    }

    pub fn counter_add(&self, name: &str, value: u64) {
        {
            let counters = self.counters.read();
            if let Some(counter) = counters.get(name) {
                counter.fetch_add(value, Ordering::Relaxed);
                return;
            }
        }
        self.counters
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    /// Increment `{name}.{label}`.
    pub fn counter_inc_labeled(&self, name: &str, label: &str) {
        self.counter_inc(&format!("{}.{}", name, label));
    }

    pub fn counter_get(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge_set(&self, name: &str, value: u64) {
        {
            let gauges = self.gauges.read();
            if let Some(gauge) = gauges.get(name) {
                gauge.store(value, Ordering::Relaxed);
                return;
            }
        }
        self.gauges
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn gauge_get(&self, name: &str) -> u64 {
        self.gauges
            .read()
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Export in Prometheus text format, names sorted.
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        for (name, value) in self.counters.read().iter() {
            let prometheus_name = name.replace('.', "_");
            output.push_str(&format!(
                "# TYPE {} counter\n{} {}\n",
                prometheus_name,
                prometheus_name,
                value.load(Ordering::Relaxed)
            ));
        }

        for (name, value) in self.gauges.read().iter() {
            let prometheus_name = name.replace('.', "_");
            output.push_str(&format!(
                "# TYPE {} gauge\n{} {}\n",
                prometheus_name,
                prometheus_name,
                value.load(Ordering::Relaxed)
            ));
        }

        output
    }
}

/// Per-cell line of a health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellReport {
    pub cell_id: u32,
    pub endpoint: String,
    pub status: CellStatus,
    pub fail_count: u32,
    pub last_check_ms: u64,
}

/// Aggregated health for operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// At least one cell can take traffic and the runtime is up.
    pub ready: bool,
    pub healthy_cells: usize,
    pub cells: Vec<CellReport>,
    pub pending_reservations: u64,
    pub quarantined_skus: Vec<String>,
    pub flagged_sagas: usize,
}

impl HealthReport {
    pub fn build(
        running: bool,
        snapshot: &HealthSnapshot,
        pending_reservations: u64,
        quarantined_skus: Vec<String>,
        flagged_sagas: usize,
    ) -> Self {
        let cells: Vec<CellReport> = snapshot
            .cells()
            .iter()
            .map(|c| CellReport {
                cell_id: c.id.get(),
                endpoint: c.endpoint.clone(),
                status: c.status,
                fail_count: c.fail_count,
                last_check_ms: c.last_check.ms,
            })
            .collect();
        let healthy_cells = cells
            .iter()
            .filter(|c| c.status != CellStatus::Unhealthy)
            .count();

        Self {
            ready: running && healthy_cells > 0,
            healthy_cells,
            cells,
            pending_reservations,
            quarantined_skus,
            flagged_sagas,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_gauges() {
        let registry = MetricsRegistry::new();
        registry.counter_inc(metrics::LEDGER_RESERVE_TOTAL);
        registry.counter_add(metrics::LEDGER_RESERVE_TOTAL, 2);
        registry.counter_inc_labeled(metrics::FLASH_REJECTED_TOTAL, "sold_out");
        registry.gauge_set(metrics::LEDGER_PENDING, 9);

        assert_eq!(registry.counter_get(metrics::LEDGER_RESERVE_TOTAL), 3);
        assert_eq!(
            registry.counter_get("cellmart.flash.rejected_total.sold_out"),
            1
        );
        assert_eq!(registry.gauge_get(metrics::LEDGER_PENDING), 9);
        assert_eq!(registry.counter_get("missing"), 0);

        let text = registry.export_prometheus();
        assert!(text.contains("cellmart_ledger_reserve_total 3"));
        assert!(text.contains("# TYPE cellmart_ledger_pending_reservations gauge"));
    }
}
