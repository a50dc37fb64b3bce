//! Cell routing and health probing tests.

mod common;

use async_trait::async_trait;
use cellmart::control::{
    primary_cell, route_in, CellId, CellProbe, CellRouter, CellStatus, HealthProber, HealthTable,
};
use cellmart::core::config::CellsConfig;
use cellmart::core::error::{CoreError, CoreResult};
use cellmart::core::time::ManualClock;
use cellmart::ops::observability::{metrics, HealthReport, MetricsRegistry};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

fn cells(count: u32, threshold: u32) -> CellsConfig {
    CellsConfig {
        count,
        health_fail_threshold: threshold,
        ..CellsConfig::default()
    }
}

/// Probe whose down set tests flip between cycles.
#[derive(Default)]
struct SwitchProbe {
    down: Mutex<HashSet<String>>,
}

impl SwitchProbe {
    fn set_down(&self, endpoint: &str, down: bool) {
        let mut set = self.down.lock();
        if down {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }
}

#[async_trait]
impl CellProbe for SwitchProbe {
    async fn probe(&self, endpoint: &str) -> CoreResult<()> {
        if self.down.lock().contains(endpoint) {
            Err(CoreError::unavailable("connection refused"))
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Hashing tests
// ============================================================================

#[test]
fn primary_cell_matches_sha256_prefix() {
    // First 8 digest bytes, big-endian, mod N, plus one.
    assert_eq!(primary_cell("alice", 4).get(), 4);
    assert_eq!(primary_cell("bob", 4).get(), 3);
    assert_eq!(primary_cell("alice", 8).get(), 8);
    assert_eq!(primary_cell("", 8).get(), 5);
}

#[test]
fn routing_spreads_identities() {
    let mut counts = [0u32; 8];
    for i in 0..2_000 {
        let id = primary_cell(&format!("user-{i}"), 8);
        counts[(id.get() - 1) as usize] += 1;
    }
    for count in counts {
        assert!(count > 150, "cell starved: {counts:?}");
    }
}

proptest! {
    #[test]
    fn route_is_pure_for_fixed_table(identity in ".{0,40}", count in 1u32..16, down in proptest::collection::vec(1u32..16, 0..6)) {
        let table = HealthTable::from_config(&cells(count, 3));
        for id in down.into_iter().filter(|id| *id <= count) {
            table.set_status(CellId::new(id, count).unwrap(), CellStatus::Unhealthy).unwrap();
        }
        let snapshot = table.snapshot();
        let a = route_in(&snapshot, &identity);
        let b = route_in(&snapshot, &identity);
        prop_assert_eq!(&a, &b);
        prop_assert!(a.cell.get() >= 1 && a.cell.get() <= count);
        if a.degraded {
            prop_assert_eq!(a.cell, a.primary);
        } else {
            prop_assert!(snapshot.status(a.cell) != CellStatus::Unhealthy);
        }
    }
}

// ============================================================================
// Failover tests
// ============================================================================

#[test]
fn unhealthy_primary_fails_over_in_ring_order() {
    let table = Arc::new(HealthTable::from_config(&cells(4, 3)));
    let metrics = MetricsRegistry::shared();
    let router = CellRouter::new(table.clone(), metrics.clone());

    // alice hashes to 4; the ring wraps to 1.
    table
        .set_status(CellId::new(4, 4).unwrap(), CellStatus::Unhealthy)
        .unwrap();
    let route = router.route("alice");
    assert_eq!(route.primary.get(), 4);
    assert_eq!(route.cell.get(), 1);
    assert!(route.failed_over());
    assert!(!route.degraded);
    assert_eq!(route.endpoint, "cell-1.local:8080");

    table
        .set_status(CellId::new(1, 4).unwrap(), CellStatus::Degraded)
        .unwrap();
    assert_eq!(router.route("alice").cell.get(), 2);
    assert_eq!(metrics.counter_get(metrics::ROUTER_FAILOVERS_TOTAL), 2);
}

#[test]
fn all_unhealthy_routes_to_primary_degraded() {
    let table = Arc::new(HealthTable::from_config(&cells(3, 1)));
    let metrics = MetricsRegistry::shared();
    let router = CellRouter::new(table.clone(), metrics.clone());
    for id in 1..=3 {
        table
            .set_status(CellId::new(id, 3).unwrap(), CellStatus::Unhealthy)
            .unwrap();
    }
    let route = router.route("bob");
    assert!(route.degraded);
    assert_eq!(route.cell, route.primary);
    assert_eq!(metrics.counter_get(metrics::ROUTER_DEGRADED_TOTAL), 1);
}

#[test]
fn endpoint_for_follows_failover() {
    let table = Arc::new(HealthTable::from_config(&cells(3, 3)));
    let router = CellRouter::new(table.clone(), MetricsRegistry::shared());
    assert_eq!(router.endpoint_for(2).unwrap().endpoint, "cell-2.local:8080");

    table
        .set_status(CellId::new(2, 3).unwrap(), CellStatus::Unhealthy)
        .unwrap();
    assert_eq!(router.endpoint_for(2).unwrap().endpoint, "cell-3.local:8080");
    assert!(router.endpoint_for(0).is_err());
    assert!(router.endpoint_for(4).is_err());
}

// ============================================================================
// Prober tests
// ============================================================================

#[tokio::test]
async fn prober_fails_over_and_recovers() {
    // S5: cells 1..4, fail threshold 3; alice's primary is 4.
    let table = Arc::new(HealthTable::from_config(&cells(4, 3)));
    let metrics = MetricsRegistry::shared();
    let probe = Arc::new(SwitchProbe::default());
    let prober = HealthProber::new(
        table.clone(),
        probe.clone(),
        ManualClock::new(common::T0),
        metrics.clone(),
        &cells(4, 3),
    );
    let router = CellRouter::new(table.clone(), metrics.clone());

    probe.set_down("cell-4.local:8080", true);
    prober.run_cycle().await;
    assert_eq!(table.snapshot().status(CellId::new(4, 4).unwrap()), CellStatus::Degraded);
    assert_eq!(router.route("alice").cell.get(), 4);

    prober.run_cycle().await;
    prober.run_cycle().await;
    assert_eq!(table.snapshot().status(CellId::new(4, 4).unwrap()), CellStatus::Unhealthy);
    assert_eq!(router.route("alice").cell.get(), 1);
    assert_eq!(metrics.counter_get(metrics::ROUTER_PROBE_FAILURES_TOTAL), 3);

    probe.set_down("cell-4.local:8080", false);
    prober.run_cycle().await;
    assert_eq!(table.snapshot().status(CellId::new(4, 4).unwrap()), CellStatus::Healthy);
    assert_eq!(router.route("alice").cell.get(), 4);
}

#[tokio::test]
async fn prober_stops_on_shutdown() {
    let table = Arc::new(HealthTable::from_config(&cells(2, 3)));
    let config = CellsConfig {
        health_check_interval_ms: 10,
        ..cells(2, 3)
    };
    let prober = HealthProber::new(
        table,
        Arc::new(SwitchProbe::default()),
        ManualClock::new(common::T0),
        MetricsRegistry::shared(),
        &config,
    );
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(prober.run(rx));
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}

#[test]
fn health_report_counts_serving_cells() {
    let table = HealthTable::from_config(&cells(3, 3));
    table
        .set_status(CellId::new(1, 3).unwrap(), CellStatus::Unhealthy)
        .unwrap();
    table
        .set_status(CellId::new(2, 3).unwrap(), CellStatus::Degraded)
        .unwrap();
    let report = HealthReport::build(true, &table.snapshot(), 2, vec![], 0);
    assert!(report.ready);
    assert_eq!(report.healthy_cells, 2);
    assert_eq!(report.cells[0].status, CellStatus::Unhealthy);

    let stopped = HealthReport::build(false, &table.snapshot(), 0, vec![], 0);
    assert!(!stopped.ready);
}
