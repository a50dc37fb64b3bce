//! Cell routing (C1).
//!
//! - [`cells`] - cell identities and per-cell health state
//! - [`health`] - single-writer health table and background prober
//! - [`routing`] - SHA-256 caller routing with ring failover
//!
//! Readers of the health table never block: they clone an `Arc` snapshot
//! that the prober replaces wholesale after each probe cycle.

pub mod cells;
pub mod health;
pub mod routing;

pub use cells::{Cell, CellId, CellStatus, ProbeOutcome};
pub use health::{CellProbe, HealthProber, HealthSnapshot, HealthTable, TcpProbe};
pub use routing::{primary_cell, route_in, CellRouter, Route};
