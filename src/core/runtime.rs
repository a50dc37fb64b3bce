//! Runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: storage → ledger → wallet → flash sales → sagas → router
//! - Shutdown order: background tasks → router → sagas → flash sales → storage

use crate::control::health::{HealthProber, HealthTable, TcpProbe};
use crate::control::routing::CellRouter;
use crate::core::config::Config;
use crate::core::error::CoreResult;
use crate::core::time::{SharedClock, SystemClock};
use crate::flash::{FlashSaleBook, FlashSaleEngine};
use crate::ledger::ReservationLedger;
use crate::ops::observability::{HealthReport, MetricsRegistry, SharedMetrics};
use crate::saga::{
    InMemoryOrderStore, LocalPaymentGateway, OrderStore, PaymentGateway, SagaDeps,
    SagaOrchestrator,
};
use crate::storage::{
    Storage, SyncMode, FLASH_JOURNAL, LEDGER_JOURNAL, SAGA_JOURNAL, WALLET_JOURNAL,
};
use crate::wallet::WalletLedger;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How long `stop` waits for each background task.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    Starting,
    Healthy,
    /// Functional with reduced guarantees.
    Degraded,
    Failed,
    Stopping,
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    pub storage: ComponentHealth,
    pub ledger: ComponentHealth,
    pub wallet: ComponentHealth,
    pub flash: ComponentHealth,
    pub sagas: ComponentHealth,
    pub router: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            storage: ComponentHealth::Starting,
            ledger: ComponentHealth::Starting,
            wallet: ComponentHealth::Starting,
            flash: ComponentHealth::Starting,
            sagas: ComponentHealth::Starting,
            router: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime is ready to serve requests.
    ///
    /// A ledger holding quarantined SKUs or sagas awaiting an operator
    /// still serves; those components report `Degraded`.
    pub fn is_ready(&self) -> bool {
        let serving = |h: ComponentHealth| {
            matches!(h, ComponentHealth::Healthy | ComponentHealth::Degraded)
        };
        self.storage == ComponentHealth::Healthy
            && serving(self.ledger)
            && self.wallet == ComponentHealth::Healthy
            && self.flash == ComponentHealth::Healthy
            && serving(self.sagas)
            && serving(self.router)
    }

    /// Check if the runtime is alive (not failed).
    pub fn is_alive(&self) -> bool {
        ![self.storage, self.ledger, self.wallet, self.sagas]
            .contains(&ComponentHealth::Failed)
    }
}

/// Injected checkout collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub gateway: Arc<dyn PaymentGateway>,
    pub orders: Arc<dyn OrderStore>,
}

impl Collaborators {
    /// In-process gateway and order store.
    pub fn local() -> Self {
        Self {
            gateway: Arc::new(LocalPaymentGateway::new()),
            orders: Arc::new(InMemoryOrderStore::new()),
        }
    }
}

/// Every domain component, wired over one [`Storage`].
#[derive(Clone)]
pub struct Services {
    pub clock: SharedClock,
    pub metrics: SharedMetrics,
    pub health: Arc<HealthTable>,
    pub router: Arc<CellRouter>,
    pub ledger: Arc<ReservationLedger>,
    pub wallet: Arc<WalletLedger>,
    pub flash: FlashSaleEngine,
    pub sagas: SagaOrchestrator,
}

impl Services {
    /// Open every journal in dependency order and replay it.
    ///
    /// Pending sagas are left parked; call [`SagaOrchestrator::recover`] once
    /// the caller is ready to drive them.
    pub fn open(
        config: &Config,
        storage: &Storage,
        clock: SharedClock,
        collaborators: Collaborators,
        shutdown: watch::Receiver<bool>,
    ) -> CoreResult<Self> {
        let metrics = MetricsRegistry::shared();

        let ledger = Arc::new(ReservationLedger::open(
            storage.journal(LEDGER_JOURNAL)?,
            clock.clone(),
            metrics.clone(),
            &config.reservations,
        )?);
        let wallet = Arc::new(WalletLedger::open(
            storage.journal(WALLET_JOURNAL)?,
            clock.clone(),
            metrics.clone(),
            &config.wallet,
        )?);
        let book = FlashSaleBook::open(storage.journal(FLASH_JOURNAL)?)?;
        let flash = FlashSaleEngine::new(
            config.flash_sale.clone(),
            book,
            ledger.clone(),
            clock.clone(),
            metrics.clone(),
            shutdown,
        );
        let deps = SagaDeps {
            ledger: ledger.clone(),
            wallet: wallet.clone(),
            flash: Some(flash.clone()),
            gateway: collaborators.gateway,
            orders: collaborators.orders,
        };
        let sagas = SagaOrchestrator::open(
            storage.journal(SAGA_JOURNAL)?,
            deps,
            config.saga.clone(),
            clock.clone(),
            metrics.clone(),
        )?;

        let health = Arc::new(HealthTable::from_config(&config.cells));
        let router = Arc::new(CellRouter::new(health.clone(), metrics.clone()));

        Ok(Self {
            clock,
            metrics,
            health,
            router,
            ledger,
            wallet,
            flash,
            sagas,
        })
    }

    pub fn report(&self, running: bool) -> HealthReport {
        HealthReport::build(
            running,
            &self.health.snapshot(),
            self.ledger.pending_count(),
            self.ledger.quarantined(),
            self.sagas.flagged().len(),
        )
    }
}

/// cellmart runtime holding all component handles.
pub struct Runtime {
    config: Arc<Config>,
    storage_dir: PathBuf,
    clock: SharedClock,
    collaborators: Collaborators,
    recover: bool,
    storage: Option<Storage>,
    services: Option<Services>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    health: RuntimeHealth,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Runtime {
    /// Create a new runtime with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let storage_dir = PathBuf::from(&config.paths.storage_dir);

        Ok(Self {
            config: Arc::new(config),
            storage_dir,
            clock: SystemClock::shared(),
            collaborators: Collaborators::local(),
            recover: true,
            storage: None,
            services: None,
            tasks: Vec::new(),
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Replace the clock used by every component. Takes effect on `start`.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the payment gateway and order store. Takes effect on `start`.
    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    /// Whether `start` resumes non-terminal sagas.
    pub fn with_recovery(mut self, recover: bool) -> Self {
        self.recover = recover;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage_dir(&self) -> &PathBuf {
        &self.storage_dir
    }

    /// Component handles, once started.
    pub fn services(&self) -> Option<&Services> {
        self.services.as_ref()
    }

    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    /// Operator health report; `None` before `start`.
    pub fn report(&self) -> Option<HealthReport> {
        self.services.as_ref().map(|s| s.report(self.is_running()))
    }

    pub fn is_ready(&self) -> bool {
        self.health.is_ready()
    }

    pub fn is_alive(&self) -> bool {
        self.health.is_alive()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Initialize and start all runtime components.
    ///
    /// Components are started in order:
    /// 1. Storage (journal directory)
    /// 2. Domain services, replaying every journal
    /// 3. Background tasks: health prober, expiry sweeper, sale scheduler
    /// 4. Saga recovery
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            storage_dir = %self.storage_dir.display(),
            cells = self.config.cells.count,
            "starting cellmart runtime"
        );

        self.init_storage()?;
        self.init_services()?;
        self.start_background();
        if self.recover {
            self.recover_sagas();
        }

        self.running.store(true, Ordering::Release);
        tracing::info!("cellmart runtime started");
        Ok(())
    }

    fn init_storage(&mut self) -> Result<()> {
        tracing::debug!("initializing storage");
        let mode = SyncMode::from_config(&self.config.durability.mode);
        let storage = match Storage::open(&self.storage_dir, mode) {
            Ok(storage) => storage,
            Err(e) => {
                self.health.storage = ComponentHealth::Failed;
                return Err(e).context("failed to open storage");
            }
        };
        self.storage = Some(storage);
        self.health.storage = ComponentHealth::Healthy;
        Ok(())
    }

    fn init_services(&mut self) -> Result<()> {
        let storage = self.storage.as_ref().context("storage not initialized")?;
        let services = match Services::open(
            &self.config,
            storage,
            self.clock.clone(),
            self.collaborators.clone(),
            self.shutdown_rx.clone(),
        ) {
            Ok(services) => services,
            Err(e) => {
                self.health.ledger = ComponentHealth::Failed;
                return Err(e).context("failed to replay journals");
            }
        };
        self.health.ledger = if services.ledger.quarantined().is_empty() {
            ComponentHealth::Healthy
        } else {
            ComponentHealth::Degraded
        };
        self.health.wallet = ComponentHealth::Healthy;
        self.health.flash = ComponentHealth::Healthy;
        self.health.sagas = ComponentHealth::Healthy;
        self.health.router = ComponentHealth::Healthy;
        tracing::info!(
            pending_reservations = services.ledger.pending_count(),
            sagas = services.sagas.len(),
            "services initialized"
        );
        self.services = Some(services);
        Ok(())
    }

    fn start_background(&mut self) {
        let Some(services) = self.services.clone() else {
            return;
        };

        let prober = HealthProber::new(
            services.health.clone(),
            Arc::new(TcpProbe::new(Duration::from_millis(
                self.config.cells.probe_timeout_ms,
            ))),
            services.clock.clone(),
            services.metrics.clone(),
            &self.config.cells,
        );
        let shutdown = self.shutdown_rx.clone();
        self.tasks
            .push(("health prober", tokio::spawn(prober.run(shutdown))));

        let sweep = Duration::from_millis(self.config.reservations.sweep_interval_ms);
        let shutdown = self.shutdown_rx.clone();
        self.tasks.push((
            "expiry sweeper",
            tokio::spawn(services.ledger.clone().run_sweeper(sweep, shutdown)),
        ));

        let tick = Duration::from_millis(self.config.flash_sale.scheduler_interval_ms);
        let shutdown = self.shutdown_rx.clone();
        self.tasks.push((
            "sale scheduler",
            tokio::spawn(services.flash.clone().run_scheduler(tick, shutdown)),
        ));
    }

    fn recover_sagas(&mut self) {
        let Some(services) = self.services.as_ref() else {
            return;
        };
        let resumed = services.sagas.recover();
        if !services.sagas.flagged().is_empty() {
            self.health.sagas = ComponentHealth::Degraded;
        }
        if resumed > 0 {
            tracing::info!(resumed, "in-flight sagas resumed");
        }
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for shutdown signal.
    pub async fn wait_for_shutdown(&mut self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Run the runtime until SIGINT or an internal shutdown request.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop().await
    }

    /// Stop all runtime components in reverse start order.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping cellmart runtime");
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        self.stop_background().await;

        for health in [
            &mut self.health.router,
            &mut self.health.sagas,
            &mut self.health.flash,
            &mut self.health.wallet,
            &mut self.health.ledger,
        ] {
            *health = ComponentHealth::Stopped;
        }
        self.services = None;

        self.health.storage = ComponentHealth::Stopping;
        self.storage = None;
        self.health.storage = ComponentHealth::Stopped;

        tracing::info!("cellmart runtime stopped");
        Ok(())
    }

    async fn stop_background(&mut self) {
        for (name, handle) in self.tasks.drain(..) {
            match tokio::time::timeout(TASK_STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => tracing::debug!(task = name, "task stopped"),
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "task panicked"),
                Err(_) => tracing::warn!(task = name, "task stop timed out"),
            }
        }
    }

    /// Start the runtime for tests (no background tasks or signal handling).
    pub async fn start_for_tests(&mut self) -> Result<()> {
        self.init_storage()?;
        self.init_services()?;
        if self.recover {
            self.recover_sagas();
        }
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop the runtime for tests.
    pub async fn shutdown_for_tests(&mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.running.store(false, Ordering::Release);
        self.stop_background().await;
        Ok(())
    }
}
