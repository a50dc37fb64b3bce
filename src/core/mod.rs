//! Core runtime infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`error`] - Error taxonomy and wire mapping
//! - [`ids`] - Identifier newtypes
//! - [`time`] - Clocks and deadlines
//! - [`runtime`] - Component wiring and lifecycle
//! - [`frontdoor`] - Authenticated, routed request boundary

pub mod config;
pub mod error;
pub mod frontdoor;
pub mod ids;
pub mod runtime;
pub mod time;
