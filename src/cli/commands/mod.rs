//! CLI command implementations.

mod config;
mod init;
mod inspect;
mod route;
mod start;

pub use config::{run_config, ConfigArgs};
pub use init::{run_init, InitArgs};
pub use inspect::{run_inspect, InspectArgs};
pub use route::{run_route, RouteArgs};
pub use start::{run_start, StartArgs};

use crate::core::config::{Config, ConfigOverrides};
use anyhow::{Context, Result};
use std::path::Path;

/// Load `path`, apply CLI overrides and re-validate.
pub(crate) fn load_config(path: &Path, overrides: &ConfigOverrides) -> Result<Config> {
    let mut config = Config::from_file(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    config.apply_overrides(overrides);
    config
        .validate()
        .context("configuration invalid after overrides")?;
    Ok(config)
}
