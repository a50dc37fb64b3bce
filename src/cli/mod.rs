//! Command-line interface.
//!
//! Unified CLI for cellmart operations.

pub mod commands;

use clap::{Parser, Subcommand};

/// cellmart - cell-partitioned commerce core.
#[derive(Parser, Debug)]
#[command(name = "cellmart")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Override `paths.storage_dir`.
    #[arg(long, global = true)]
    pub storage_dir: Option<String>,

    /// Override `cells.count`.
    #[arg(long, global = true)]
    pub cell_count: Option<u32>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the cellmart runtime.
    Start(commands::StartArgs),
    /// Write a default config file and create the storage directory.
    Init(commands::InitArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
    /// Show which cell serves a caller identity.
    Route(commands::RouteArgs),
    /// Dump a journal file.
    Inspect(commands::InspectArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_overrides() {
        let cli = Cli::try_parse_from([
            "cellmart",
            "route",
            "alice",
            "--cell-count",
            "8",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.cell_count, Some(8));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Commands::Route(_)));
    }
}
