//! Operations and observability.
//!
//! - [`observability`] - Metrics registry and health reports

pub mod observability;
