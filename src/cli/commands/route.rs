//! Route command implementation.

use super::load_config;
use crate::control::cells::{CellId, CellStatus};
use crate::control::health::HealthTable;
use crate::control::routing::{route_in, Route};
use crate::core::config::ConfigOverrides;
use anyhow::Result;
use clap::Args;
use std::path::Path;

/// Show which cell serves a caller identity.
#[derive(Args, Debug)]
pub struct RouteArgs {
    /// Caller identities (usually user ids).
    #[arg(required = true)]
    pub identities: Vec<String>,

    /// Treat these cell ids as unhealthy.
    #[arg(long, value_delimiter = ',')]
    pub down: Vec<u32>,

    /// Print JSON lines instead of a table.
    #[arg(long)]
    pub json: bool,
}

/// Run the route command.
pub fn run_route(args: RouteArgs, config_path: &Path, overrides: &ConfigOverrides) -> Result<()> {
    let config = load_config(config_path, overrides)?;
    let routes = routes_for(&HealthTable::from_config(&config.cells), &args)?;
    for (identity, route) in args.identities.iter().zip(&routes) {
        if args.json {
            println!(
                "{}",
                serde_json::json!({ "identity": identity, "route": route })
            );
        } else {
            let note = if route.degraded {
                " (degraded)"
            } else if route.failed_over() {
                " (failover)"
            } else {
                ""
            };
            println!(
                "{identity}\tprimary={} cell={} endpoint={}{note}",
                route.primary, route.cell, route.endpoint
            );
        }
    }
    Ok(())
}

fn routes_for(table: &HealthTable, args: &RouteArgs) -> Result<Vec<Route>> {
    for &id in &args.down {
        table.set_status(CellId::new(id, table.count())?, CellStatus::Unhealthy)?;
    }
    let snapshot = table.snapshot();
    Ok(args
        .identities
        .iter()
        .map(|identity| route_in(&snapshot, identity))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::routing::primary_cell;
    use crate::core::config::CellsConfig;

    #[test]
    fn down_cells_fail_over() {
        let table = HealthTable::from_config(&CellsConfig::default());
        let primary = primary_cell("alice", 4);
        let args = RouteArgs {
            identities: vec!["alice".into()],
            down: vec![primary.get()],
            json: false,
        };
        let routes = routes_for(&table, &args).unwrap();
        assert_eq!(routes[0].primary, primary);
        assert_eq!(routes[0].cell, primary.next_in_ring(4));
    }

    #[test]
    fn unknown_cell_is_rejected() {
        let table = HealthTable::from_config(&CellsConfig::default());
        let args = RouteArgs {
            identities: vec!["alice".into()],
            down: vec![9],
            json: false,
        };
        assert!(routes_for(&table, &args).is_err());
    }
}
