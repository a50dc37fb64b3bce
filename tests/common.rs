//! Common test utilities.
//!
//! Shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use cellmart::core::config::Config;
use cellmart::core::runtime::{Collaborators, Services};
use cellmart::core::time::ManualClock;
use cellmart::saga::{CheckoutRequest, InMemoryOrderStore, LocalPaymentGateway, PaymentMethod};
use cellmart::storage::{Storage, SyncMode};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::watch;

/// Start of every test clock, well past zero so TTL arithmetic never
/// saturates.
pub const T0: u64 = 1_000_000;

/// Config tuned for tests: PoW disabled, room in the admission FIFO for
/// large bursts.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.flash_sale.pow_difficulty_base = 0;
    config.flash_sale.pow_difficulty_max = 0;
    config.flash_sale.admission_queue_capacity = 50_000;
    config.flash_sale.rate_limit_burst = 1_000;
    config.saga.duplicate_wait_ms = 5_000;
    config
}

/// Write `content` to a temp config file.
pub fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Every component plus handles on the in-process collaborators.
pub struct Harness {
    pub services: Services,
    pub clock: Arc<ManualClock>,
    pub gateway: Arc<LocalPaymentGateway>,
    pub orders: Arc<InMemoryOrderStore>,
    shutdown: watch::Sender<bool>,
}

impl Harness {
    /// Volatile journals.
    pub fn in_memory() -> Self {
        Self::with(test_config(), &Storage::in_memory(), new_collaborators())
    }

    /// File journals under `dir`.
    pub fn at(dir: &Path) -> Self {
        Self::reopen(dir, new_collaborators())
    }

    /// Reopen `dir` with existing collaborators, as a restarted process
    /// talking to the same gateway and order store would.
    pub fn reopen(dir: &Path, collaborators: (Arc<LocalPaymentGateway>, Arc<InMemoryOrderStore>)) -> Self {
        let storage = Storage::open(dir, SyncMode::Strict).expect("open storage");
        Self::with(test_config(), &storage, collaborators)
    }

    pub fn with(
        config: Config,
        storage: &Storage,
        (gateway, orders): (Arc<LocalPaymentGateway>, Arc<InMemoryOrderStore>),
    ) -> Self {
        let clock = ManualClock::new(T0);
        let (shutdown, rx) = watch::channel(false);
        let services = Services::open(
            &config,
            storage,
            clock.clone(),
            Collaborators {
                gateway: gateway.clone(),
                orders: orders.clone(),
            },
            rx,
        )
        .expect("open services");
        Self {
            services,
            clock,
            gateway,
            orders,
            shutdown,
        }
    }

    pub fn collaborators(&self) -> (Arc<LocalPaymentGateway>, Arc<InMemoryOrderStore>) {
        (self.gateway.clone(), self.orders.clone())
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub fn new_collaborators() -> (Arc<LocalPaymentGateway>, Arc<InMemoryOrderStore>) {
    (
        Arc::new(LocalPaymentGateway::new()),
        Arc::new(InMemoryOrderStore::new()),
    )
}

/// Gateway-paid checkout of `qty` units of `sku`.
pub fn card_checkout(key: &str, user: &str, sku: &str, qty: u64, method: &str) -> CheckoutRequest {
    CheckoutRequest {
        idempotency_key: key.to_string(),
        user_id: user.to_string(),
        sku: sku.to_string(),
        qty,
        amount: qty * 100,
        payment: PaymentMethod::Gateway {
            method: method.to_string(),
        },
        flash_reservation: None,
        metadata: BTreeMap::new(),
    }
}

/// Wallet-escrowed checkout paying `payee`.
pub fn wallet_checkout(key: &str, user: &str, sku: &str, qty: u64, amount: u64, payee: &str) -> CheckoutRequest {
    CheckoutRequest {
        idempotency_key: key.to_string(),
        user_id: user.to_string(),
        sku: sku.to_string(),
        qty,
        amount,
        payment: PaymentMethod::Wallet {
            currency: "USD".to_string(),
            payee_user_id: payee.to_string(),
        },
        flash_reservation: None,
        metadata: BTreeMap::new(),
    }
}

/// Assert that a result is Ok and return the value.
#[track_caller]
pub fn assert_ok<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
}

/// Assert that a result is Err.
#[track_caller]
pub fn assert_err<T: std::fmt::Debug, E>(result: Result<T, E>) -> E {
    match result {
        Ok(v) => panic!("Expected Err, got Ok: {:?}", v),
        Err(e) => e,
    }
}
