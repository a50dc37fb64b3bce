//! Deterministic caller-to-cell routing.
//!
//! A caller identity `u` is routed as
//! `primary = (be_u64(SHA-256(u)[0..8]) mod N) + 1`.
//!
//! # Failover
//!
//! If the primary is unhealthy the ring `primary+1, primary+2, ...` (wrapping
//! at N) is walked for the first healthy cell. If no cell is healthy the
//! primary is returned flagged `degraded`; retry budgets belong to callers.
//! Routing never fails and, for a fixed `{N, health snapshot}`, is pure.

use crate::control::cells::{CellId, CellStatus};
use crate::control::health::{HealthSnapshot, HealthTable};
use crate::core::error::CoreResult;
use crate::ops::observability::{metrics, SharedMetrics};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Result of routing one caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub cell: CellId,
    pub endpoint: String,
    /// Cell the hash selected before failover.
    pub primary: CellId,
    /// No healthy cell existed; `cell` is the primary.
    pub degraded: bool,
}

impl Route {
    pub fn failed_over(&self) -> bool {
        self.cell != self.primary
    }
}

/// Primary cell for `identity` among `count` cells.
pub fn primary_cell(identity: &str, count: u32) -> CellId {
    let digest = Sha256::digest(identity.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let h = u64::from_be_bytes(prefix);
    CellId::from_raw((h % u64::from(count)) as u32 + 1)
}

/// Pure routing over a snapshot.
pub fn route_in(snapshot: &HealthSnapshot, identity: &str) -> Route {
    resolve(snapshot, primary_cell(identity, snapshot.count()))
}

/// Apply failover to an already chosen primary.
fn resolve(snapshot: &HealthSnapshot, primary: CellId) -> Route {
    let endpoint_of = |id: CellId| {
        snapshot
            .get(id)
            .map(|c| c.endpoint.clone())
            .unwrap_or_default()
    };

    let (cell, degraded) = if snapshot.status(primary) != CellStatus::Unhealthy {
        (primary, false)
    } else {
        match failover_from(snapshot, primary) {
            Some(cell) => (cell, false),
            None => (primary, true),
        }
    };

    Route {
        cell,
        endpoint: endpoint_of(cell),
        primary,
        degraded,
    }
}

/// First healthy cell after `from` in ring order, excluding `from`.
fn failover_from(snapshot: &HealthSnapshot, from: CellId) -> Option<CellId> {
    let count = snapshot.count();
    let mut candidate = from.next_in_ring(count);
    while candidate != from {
        if snapshot.status(candidate) == CellStatus::Healthy {
            return Some(candidate);
        }
        candidate = candidate.next_in_ring(count);
    }
    None
}

/// Router bound to the live health table.
#[derive(Clone)]
pub struct CellRouter {
    table: Arc<HealthTable>,
    metrics: SharedMetrics,
}

impl CellRouter {
    pub fn new(table: Arc<HealthTable>, metrics: SharedMetrics) -> Self {
        Self { table, metrics }
    }

    pub fn table(&self) -> &Arc<HealthTable> {
        &self.table
    }

    pub fn cell_count(&self) -> u32 {
        self.table.count()
    }

    /// Route a caller identity to a cell.
    pub fn route(&self, identity: &str) -> Route {
        let route = route_in(&self.table.snapshot(), identity);
        if route.degraded {
            self.metrics.counter_inc(metrics::ROUTER_DEGRADED_TOTAL);
            tracing::warn!(primary = %route.primary, "no healthy cell; routing degraded");
        } else if route.failed_over() {
            self.metrics.counter_inc(metrics::ROUTER_FAILOVERS_TOTAL);
            tracing::debug!(primary = %route.primary, cell = %route.cell, "routed to failover cell");
        }
        route
    }

    /// Endpoint for `cell_id`, or for its failover cell if it is unhealthy.
    pub fn endpoint_for(&self, cell_id: u32) -> CoreResult<Route> {
        let snapshot = self.table.snapshot();
        let id = CellId::new(cell_id, snapshot.count())?;
        Ok(resolve(&snapshot, id))
    }
}
