//! cellmart - unified CLI entrypoint.
//!
//! Usage:
//!   cellmart start --config config/cellmart.toml
//!   cellmart init --config config/cellmart.toml
//!   cellmart config validate --config config/cellmart.toml
//!   cellmart route <user-id>...
//!   cellmart inspect data/saga.wal

use anyhow::Result;
use cellmart::cli::commands::{run_config, run_init, run_inspect, run_route, run_start};
use cellmart::cli::{Cli, Commands};
use cellmart::config::ConfigOverrides;
use clap::Parser;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/cellmart.toml"));
    let overrides = ConfigOverrides {
        log_level: cli.log_level,
        storage_dir: cli.storage_dir,
        cell_count: cli.cell_count,
    };

    match cli.command {
        Commands::Start(args) => run_start(args, &config_path, &overrides).await,
        Commands::Init(args) => run_init(args, &config_path, &overrides),
        Commands::Config(args) => run_config(args, &config_path, &overrides),
        Commands::Route(args) => run_route(args, &config_path, &overrides),
        Commands::Inspect(args) => run_inspect(args),
    }
}
