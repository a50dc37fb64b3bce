//! Configuration parsing and validation.
//!
//! Configuration is loaded from a TOML file with CLI overrides. Every key has
//! a default so an empty file is a valid single-node development config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Cell routing and health probing.
    #[serde(default)]
    pub cells: CellsConfig,

    /// Reservation ledger.
    #[serde(default)]
    pub reservations: ReservationsConfig,

    /// Flash-sale admission.
    #[serde(default)]
    pub flash_sale: FlashSaleConfig,

    /// Wallet ledger.
    #[serde(default)]
    pub wallet: WalletConfig,

    /// Checkout saga orchestration.
    #[serde(default)]
    pub saga: SagaConfig,

    /// Journal durability.
    #[serde(default)]
    pub durability: DurabilityConfig,

    /// Logging.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Filesystem paths.
    #[serde(default)]
    pub paths: PathConfig,
}

/// Cell router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellsConfig {
    /// Number of routing cells (N). Fixed at boot.
    #[serde(default = "default_cell_count")]
    pub count: u32,

    /// Cell endpoints, index 0 is cell 1. Empty means generated names.
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Probe interval (T).
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Consecutive failures before a cell is unhealthy (k).
    #[serde(default = "default_health_fail_threshold")]
    pub health_fail_threshold: u32,

    /// Per-probe timeout.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for CellsConfig {
    fn default() -> Self {
        Self {
            count: default_cell_count(),
            endpoints: Vec::new(),
            health_check_interval_ms: default_health_check_interval_ms(),
            health_fail_threshold: default_health_fail_threshold(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl CellsConfig {
    /// Endpoint for every cell id in `1..=count`.
    pub fn resolved_endpoints(&self) -> Vec<String> {
        if self.endpoints.is_empty() {
            (1..=self.count)
                .map(|id| format!("cell-{}.local:8080", id))
                .collect()
        } else {
            self.endpoints.clone()
        }
    }
}

/// Reservation ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationsConfig {
    /// TTL for reservations that do not specify one.
    #[serde(default = "default_reservation_ttl_ms")]
    pub default_ttl_ms: u64,

    /// Expiry sweeper period.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for ReservationsConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_reservation_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// Flash-sale admission configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashSaleConfig {
    /// Leading zero bits required at zero load.
    #[serde(default = "default_pow_difficulty_base")]
    pub pow_difficulty_base: u32,

    /// Upper bound for adaptive difficulty.
    #[serde(default = "default_pow_difficulty_max")]
    pub pow_difficulty_max: u32,

    /// Queue depth that adds one bit of difficulty per doubling.
    #[serde(default = "default_pow_load_step")]
    pub pow_load_step: u64,

    /// Lifetime of an issued challenge.
    #[serde(default = "default_challenge_ttl_ms")]
    pub challenge_ttl_ms: u64,

    /// TTL of the stock hold created by a successful attempt.
    #[serde(default = "default_hold_window_ms")]
    pub hold_window_ms: u64,

    #[serde(default = "default_rate_limit_refill_per_s")]
    pub rate_limit_refill_per_s: u64,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u64,

    /// Bounded FIFO capacity per sale.
    #[serde(default = "default_admission_queue_capacity")]
    pub admission_queue_capacity: usize,

    /// Worker pool draining the admission queues.
    #[serde(default = "default_admission_workers")]
    pub admission_workers: usize,

    /// Sale state scheduler period.
    #[serde(default = "default_scheduler_interval_ms")]
    pub scheduler_interval_ms: u64,
}

impl Default for FlashSaleConfig {
    fn default() -> Self {
        Self {
            pow_difficulty_base: default_pow_difficulty_base(),
            pow_difficulty_max: default_pow_difficulty_max(),
            pow_load_step: default_pow_load_step(),
            challenge_ttl_ms: default_challenge_ttl_ms(),
            hold_window_ms: default_hold_window_ms(),
            rate_limit_refill_per_s: default_rate_limit_refill_per_s(),
            rate_limit_burst: default_rate_limit_burst(),
            admission_queue_capacity: default_admission_queue_capacity(),
            admission_workers: default_admission_workers(),
            scheduler_interval_ms: default_scheduler_interval_ms(),
        }
    }
}

/// Wallet ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Optimistic CAS attempts before surfacing `conflict`.
    #[serde(default = "default_cas_max_attempts")]
    pub cas_max_attempts: u32,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            cas_max_attempts: default_cas_max_attempts(),
        }
    }
}

/// Saga orchestration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaConfig {
    /// How long a duplicate caller waits for a running saga to finish.
    #[serde(default = "default_duplicate_wait_ms")]
    pub duplicate_wait_ms: u64,

    #[serde(default)]
    pub step_timeouts: StepTimeouts,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            duplicate_wait_ms: default_duplicate_wait_ms(),
            step_timeouts: StepTimeouts::default(),
        }
    }
}

/// Per-step time budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTimeouts {
    #[serde(default = "default_reserve_timeout_ms")]
    pub reserve_ms: u64,
    #[serde(default = "default_pay_timeout_ms")]
    pub pay_ms: u64,
    #[serde(default = "default_order_timeout_ms")]
    pub order_ms: u64,
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_ms: u64,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            reserve_ms: default_reserve_timeout_ms(),
            pay_ms: default_pay_timeout_ms(),
            order_ms: default_order_timeout_ms(),
            commit_ms: default_commit_timeout_ms(),
        }
    }
}

impl StepTimeouts {
    pub fn reserve(&self) -> Duration {
        Duration::from_millis(self.reserve_ms)
    }

    pub fn pay(&self) -> Duration {
        Duration::from_millis(self.pay_ms)
    }

    pub fn order(&self) -> Duration {
        Duration::from_millis(self.order_ms)
    }

    pub fn commit(&self) -> Duration {
        Duration::from_millis(self.commit_ms)
    }
}

/// Journal durability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurabilityConfig {
    /// "strict" (fsync before ack) or "buffered".
    #[serde(default = "default_durability_mode")]
    pub mode: String,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            mode: default_durability_mode(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Filesystem path configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Directory holding the journals.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
        }
    }
}

// Default value functions

fn default_cell_count() -> u32 {
    4
}

fn default_health_check_interval_ms() -> u64 {
    5_000
}

fn default_health_fail_threshold() -> u32 {
    3
}

fn default_probe_timeout_ms() -> u64 {
    1_000
}

fn default_reservation_ttl_ms() -> u64 {
    300_000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_pow_difficulty_base() -> u32 {
    8
}

fn default_pow_difficulty_max() -> u32 {
    24
}

fn default_pow_load_step() -> u64 {
    1_000
}

fn default_challenge_ttl_ms() -> u64 {
    30_000
}

fn default_hold_window_ms() -> u64 {
    300_000
}

fn default_rate_limit_refill_per_s() -> u64 {
    10
}

fn default_rate_limit_burst() -> u64 {
    20
}

fn default_admission_queue_capacity() -> usize {
    10_000
}

fn default_admission_workers() -> usize {
    8
}

fn default_scheduler_interval_ms() -> u64 {
    250
}

fn default_cas_max_attempts() -> u32 {
    5
}

fn default_duplicate_wait_ms() -> u64 {
    15_000
}

fn default_reserve_timeout_ms() -> u64 {
    1_000
}

fn default_pay_timeout_ms() -> u64 {
    10_000
}

fn default_order_timeout_ms() -> u64 {
    1_000
}

fn default_commit_timeout_ms() -> u64 {
    1_000
}

fn default_durability_mode() -> String {
    "strict".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_storage_dir() -> String {
    "data".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML (used by `cellmart init` and `config show`).
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render config")
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref storage_dir) = overrides.storage_dir {
            self.paths.storage_dir = storage_dir.clone();
        }
        if let Some(cell_count) = overrides.cell_count {
            if cell_count as usize != self.cells.endpoints.len() {
                self.cells.endpoints.clear();
            }
            self.cells.count = cell_count;
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_cells()?;
        self.validate_reservations()?;
        self.validate_flash_sale()?;
        self.validate_wallet()?;
        self.validate_saga()?;
        self.validate_durability()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_cells(&self) -> Result<()> {
        let cells = &self.cells;
        if cells.count == 0 {
            anyhow::bail!("cells.count must be > 0");
        }
        if !cells.endpoints.is_empty() && cells.endpoints.len() != cells.count as usize {
            anyhow::bail!(
                "cells.endpoints has {} entries but cells.count is {}",
                cells.endpoints.len(),
                cells.count
            );
        }
        if cells.health_check_interval_ms == 0 {
            anyhow::bail!("cells.health_check_interval_ms must be > 0");
        }
        if cells.health_fail_threshold == 0 {
            anyhow::bail!("cells.health_fail_threshold must be > 0");
        }
        if cells.probe_timeout_ms == 0 {
            anyhow::bail!("cells.probe_timeout_ms must be > 0");
        }
        Ok(())
    }

    fn validate_reservations(&self) -> Result<()> {
        if self.reservations.default_ttl_ms == 0 {
            anyhow::bail!("reservations.default_ttl_ms must be > 0");
        }
        if self.reservations.sweep_interval_ms == 0 {
            anyhow::bail!("reservations.sweep_interval_ms must be > 0");
        }
        Ok(())
    }

    fn validate_flash_sale(&self) -> Result<()> {
        let flash = &self.flash_sale;
        if flash.pow_difficulty_max > 256 {
            anyhow::bail!(
                "flash_sale.pow_difficulty_max must be <= 256, got: {}",
                flash.pow_difficulty_max
            );
        }
        if flash.pow_difficulty_base > flash.pow_difficulty_max {
            anyhow::bail!(
                "flash_sale.pow_difficulty_base ({}) cannot exceed pow_difficulty_max ({})",
                flash.pow_difficulty_base,
                flash.pow_difficulty_max
            );
        }
        if flash.pow_load_step == 0 {
            anyhow::bail!("flash_sale.pow_load_step must be > 0");
        }
        if flash.challenge_ttl_ms == 0 || flash.hold_window_ms == 0 {
            anyhow::bail!("flash_sale.challenge_ttl_ms and hold_window_ms must be > 0");
        }
        if flash.rate_limit_burst == 0 {
            anyhow::bail!("flash_sale.rate_limit_burst must be > 0");
        }
        if flash.admission_queue_capacity == 0 {
            anyhow::bail!("flash_sale.admission_queue_capacity must be > 0");
        }
        if flash.admission_workers == 0 {
            anyhow::bail!("flash_sale.admission_workers must be > 0");
        }
        if flash.scheduler_interval_ms == 0 {
            anyhow::bail!("flash_sale.scheduler_interval_ms must be > 0");
        }
        Ok(())
    }

    fn validate_wallet(&self) -> Result<()> {
        if self.wallet.cas_max_attempts == 0 {
            anyhow::bail!("wallet.cas_max_attempts must be > 0");
        }
        Ok(())
    }

    fn validate_saga(&self) -> Result<()> {
        let t = &self.saga.step_timeouts;
        for (name, value) in [
            ("reserve_ms", t.reserve_ms),
            ("pay_ms", t.pay_ms),
            ("order_ms", t.order_ms),
            ("commit_ms", t.commit_ms),
        ] {
            if value == 0 {
                anyhow::bail!("saga.step_timeouts.{} must be > 0", name);
            }
        }
        Ok(())
    }

    fn validate_durability(&self) -> Result<()> {
        if self.durability.mode != "strict" && self.durability.mode != "buffered" {
            anyhow::bail!(
                "durability.mode must be 'strict' or 'buffered', got: {}",
                self.durability.mode
            );
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub storage_dir: Option<String>,
    pub cell_count: Option<u32>,
}
