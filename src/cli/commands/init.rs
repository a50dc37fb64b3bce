//! Init command implementation.

use crate::core::config::{Config, ConfigOverrides};
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

/// Write a default config file and create the storage directory.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing config file.
    #[arg(long)]
    pub force: bool,
}

/// Run the init command.
pub fn run_init(args: InitArgs, config_path: &Path, overrides: &ConfigOverrides) -> Result<()> {
    if config_path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            config_path.display()
        );
    }

    let mut config = Config::default();
    config.apply_overrides(overrides);
    config.validate()?;

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    std::fs::write(config_path, config.to_toml()?)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    println!("Wrote config: {}", config_path.display());

    std::fs::create_dir_all(&config.paths.storage_dir)
        .with_context(|| format!("failed to create {}", config.paths.storage_dir))?;
    println!("Initialized storage directory: {}", config.paths.storage_dir);
    Ok(())
}
