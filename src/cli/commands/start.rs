//! Start command implementation.

use super::load_config;
use crate::core::config::ConfigOverrides;
use crate::core::runtime::Runtime;
use anyhow::Result;
use clap::Args;
use std::path::Path;

/// Start the cellmart runtime.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Skip saga recovery and leave in-flight sagas parked.
    #[arg(long)]
    pub no_recover: bool,
}

/// Install the tracing subscriber if the telemetry feature is enabled.
///
/// `RUST_LOG` wins over the configured level.
#[cfg(feature = "telemetry")]
fn init_tracing(default_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing(_default_level: &str) {}

/// Run the start command.
pub async fn run_start(args: StartArgs, config_path: &Path, overrides: &ConfigOverrides) -> Result<()> {
    let config = load_config(config_path, overrides)?;
    init_tracing(&config.telemetry.log_level);

    let mut runtime = Runtime::new(config)?.with_recovery(!args.no_recover);
    runtime.run().await
}
