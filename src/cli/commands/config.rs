//! Config command implementation.

use super::load_config;
use crate::core::config::{Config, ConfigOverrides};
use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Parse and validate the config file.
    Validate,
    /// Print the effective configuration, defaults filled in.
    Show {
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
    /// Show keys whose effective values differ between two files.
    Diff {
        file1: PathBuf,
        file2: PathBuf,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs, config_path: &Path, overrides: &ConfigOverrides) -> Result<()> {
    match args.command {
        ConfigCommand::Validate => {
            let config = load_config(config_path, overrides)?;
            println!("✓ {} is valid", config_path.display());
            println!(
                "  cells: {}, durability: {}, storage: {}",
                config.cells.count, config.durability.mode, config.paths.storage_dir
            );
            Ok(())
        }
        ConfigCommand::Show { format } => {
            let config = load_config(config_path, overrides)?;
            println!("{}", render(&config, &format)?);
            Ok(())
        }
        ConfigCommand::Diff { file1, file2 } => {
            let a = Config::from_file(&file1)?;
            let b = Config::from_file(&file2)?;
            println!("Comparing {} and {}", file1.display(), file2.display());
            let changes = diff(&a, &b)?;
            if changes.is_empty() {
                println!("(no differences)");
            }
            for line in changes {
                println!("{line}");
            }
            Ok(())
        }
    }
}

fn render(config: &Config, format: &str) -> Result<String> {
    match format {
        "json" => Ok(serde_json::to_string_pretty(config)?),
        "toml" => config.to_toml(),
        other => anyhow::bail!("unknown format {other:?}; expected toml or json"),
    }
}

/// One `~ key: old -> new` line per differing leaf.
fn diff(a: &Config, b: &Config) -> Result<Vec<String>> {
    let mut out = Vec::new();
    diff_values("", &serde_json::to_value(a)?, &serde_json::to_value(b)?, &mut out);
    Ok(out)
}

fn diff_values(path: &str, a: &Value, b: &Value, out: &mut Vec<String>) {
    match (a, b) {
        (Value::Object(left), Value::Object(right)) => {
            for (key, lv) in left {
                let key_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                match right.get(key) {
                    Some(rv) => diff_values(&key_path, lv, rv, out),
                    None => out.push(format!("- {key_path}: {lv}")),
                }
            }
        }
        (a, b) if a != b => out.push(format!("~ {path}: {a} -> {b}")),
        _ => {}
    }
}
