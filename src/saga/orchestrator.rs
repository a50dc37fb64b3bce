//! Checkout saga orchestrator (C4).
//!
//! # Execution
//!
//! Each saga runs in its own driver task, independent of the caller that
//! opened it. Callers wait on the saga's completion channel for as long as
//! their deadline allows; a caller that gives up never cancels the saga.
//! Steps run strictly in order. Before a step the driver journals
//! `StepEntering` with every id the step will use (reservation id, order id),
//! so a retried step touches the same remote effect.
//!
//! # Recovery
//!
//! [`SagaOrchestrator::recover`] drives every non-terminal saga after a
//! restart. An in-doubt step is retried when that is safe and compensated
//! otherwise (see [`SagaStep::retry_safe`]).
//!
//! # Compensation
//!
//! Compensations run newest first. Each gets a bounded number of attempts;
//! one that still fails is journaled as `Flagged` and the saga closes
//! `failed` with `needs_attention` set until
//! [`SagaOrchestrator::retry_compensations`] finishes the work.

use crate::core::config::SagaConfig;
use crate::core::error::{CoreError, CoreResult};
use crate::core::ids::{OrderId, ReservationId, SagaId};
use crate::core::time::{Deadline, SharedClock};
use crate::flash::FlashSaleEngine;
use crate::ledger::{ReservationLedger, ReservationState};
use crate::ops::observability::{metrics, SharedMetrics};
use crate::saga::collaborators::{NewOrder, OrderStore, PaymentGateway};
use crate::saga::idempotency::{outcome_digest, request_digest, IdempotencyCheck, IdempotencyIndex};
use crate::saga::journal::SagaLog;
use crate::saga::model::{
    CheckoutOutcome, CheckoutRequest, FailureReason, PaymentMethod, Saga, SagaRecord, SagaState,
    SagaStep, StepResults,
};
use crate::storage::Journal;
use crate::wallet::{HoldState, ReleaseTarget, WalletLedger};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const COMPENSATION_ATTEMPTS: u32 = 3;
const COMMIT_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 50;

/// Components and collaborators a saga drives.
#[derive(Clone)]
pub struct SagaDeps {
    pub ledger: Arc<ReservationLedger>,
    pub wallet: Arc<WalletLedger>,
    pub flash: Option<FlashSaleEngine>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub orders: Arc<dyn OrderStore>,
}

struct SagaSlot {
    saga: Mutex<Saga>,
    done: watch::Sender<Option<CheckoutOutcome>>,
    driving: AtomicBool,
}

impl SagaSlot {
    fn new(saga: Saga) -> Arc<Self> {
        let (done, _) = watch::channel(saga.outcome.clone());
        Arc::new(Self {
            saga: Mutex::new(saga),
            done,
            driving: AtomicBool::new(false),
        })
    }

    fn snapshot(&self) -> Saga {
        self.saga.lock().clone()
    }
}

enum Admission {
    Closed(CheckoutOutcome),
    Running(Arc<SagaSlot>),
    Opened(Arc<SagaSlot>),
}

enum Next {
    Step { step: SagaStep, resumed: bool },
    Compensate,
    Complete,
    Idle,
}

struct Inner {
    config: SagaConfig,
    log: SagaLog,
    // Lock order: a saga's own mutex, then index, then sagas.
    index: Mutex<IdempotencyIndex>,
    sagas: RwLock<HashMap<SagaId, Arc<SagaSlot>>>,
    deps: SagaDeps,
    clock: SharedClock,
    metrics: SharedMetrics,
}

#[derive(Clone)]
pub struct SagaOrchestrator {
    inner: Arc<Inner>,
}

impl SagaOrchestrator {
    /// Replay `saga.wal` and rebuild the idempotency index. Non-terminal
    /// sagas stay parked until [`recover`](Self::recover).
    pub fn open(
        journal: Journal<SagaRecord>,
        deps: SagaDeps,
        config: SagaConfig,
        clock: SharedClock,
        metrics: SharedMetrics,
    ) -> CoreResult<Self> {
        let log = SagaLog::new(journal);
        let replayed = log.replay()?;
        let mut index = IdempotencyIndex::new();
        let mut sagas = HashMap::with_capacity(replayed.len());
        for (id, saga) in replayed {
            index.open(&saga.idempotency_key, id, &saga.request_digest, saga.created_at)?;
            if let Some(outcome) = &saga.outcome {
                index.close(&saga.idempotency_key, outcome, &outcome_digest(outcome)?);
            }
            sagas.insert(id, SagaSlot::new(saga));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                log,
                index: Mutex::new(index),
                sagas: RwLock::new(sagas),
                deps,
                clock,
                metrics,
            }),
        })
    }

    /// Run (or join) the checkout for `request.idempotency_key`.
    ///
    /// A fresh key opens a saga and waits for its outcome until `deadline`.
    /// A key whose saga finished returns the recorded outcome. A key whose
    /// saga is still running waits up to `duplicate_wait_ms` and then
    /// returns the current state.
    pub async fn checkout(&self, request: CheckoutRequest, deadline: Deadline) -> CoreResult<CheckoutOutcome> {
        deadline.check("checkout")?;
        request.validate()?;
        let digest = request_digest(&request)?;

        let (slot, fresh) = match self.admit(&request, &digest)? {
            Admission::Closed(outcome) => return Ok(outcome),
            Admission::Running(slot) => (slot, false),
            Admission::Opened(slot) => (slot, true),
        };

        if fresh {
            self.spawn_driver(Arc::clone(&slot));
            return match wait_outcome(&slot, deadline).await {
                Some(outcome) => Ok(outcome),
                None => Err(CoreError::deadline("checkout")),
            };
        }

        let budget = deadline.min_budget(Duration::from_millis(self.inner.config.duplicate_wait_ms));
        match wait_outcome(&slot, budget).await {
            Some(outcome) => Ok(outcome),
            None => Ok(slot.saga.lock().current_outcome()),
        }
    }

    /// Bind the idempotency key, then journal `Opened` outside the index lock.
    ///
    /// The new saga's own lock is taken before the index lock is released,
    /// so a duplicate that finds the key sees no state until `Opened` is
    /// durable. A failed append unbinds the key again.
    fn admit(&self, request: &CheckoutRequest, digest: &str) -> CoreResult<Admission> {
        let key = &request.idempotency_key;
        let mut index = self.inner.index.lock();
        let check = index.check(key, digest)?;
        let saga_id = match check {
            IdempotencyCheck::Completed(outcome) => return Ok(Admission::Closed(outcome)),
            IdempotencyCheck::Running(saga_id) => {
                drop(index);
                return Ok(Admission::Running(self.slot(saga_id)?));
            }
            IdempotencyCheck::New => SagaId::generate(),
        };
        let now = self.inner.clock.now();
        index.open(key, saga_id, digest, now)?;
        let slot = SagaSlot::new(Saga::open(saga_id, request.clone(), digest.to_string(), now));
        self.inner.sagas.write().insert(saga_id, Arc::clone(&slot));
        let mut saga = slot.saga.lock();
        drop(index);

        let opened = self.inner.log.append(
            &mut saga,
            SagaRecord::Opened {
                saga_id,
                request: request.clone(),
                request_digest: digest.to_string(),
                at: now,
            },
        );
        drop(saga);
        if let Err(e) = opened {
            self.inner.index.lock().forget(key, saga_id);
            self.inner.sagas.write().remove(&saga_id);
            tracing::warn!(saga_id = %saga_id, idempotency_key = %key, error = %e, "checkout saga not opened");
            return Err(e);
        }
        tracing::info!(
            saga_id = %saga_id,
            idempotency_key = %key,
            user_id = %request.user_id,
            "checkout saga opened"
        );
        Ok(Admission::Opened(slot))
    }

    /// Request cancellation. Honored only while the saga is `initiated`,
    /// `reserving` or `paying`.
    pub fn cancel(&self, idempotency_key: &str) -> CoreResult<CheckoutOutcome> {
        let saga_id = self
            .inner
            .index
            .lock()
            .saga_id(idempotency_key)
            .ok_or_else(|| CoreError::not_found("saga", idempotency_key))?;
        let slot = self.slot(saga_id)?;
        let mut saga = slot.saga.lock();
        if saga.state == SagaState::Failed {
            return Ok(saga.current_outcome());
        }
        if !saga.state.allows_cancel() {
            return Err(CoreError::conflict(format!(
                "saga {} cannot be cancelled while {}",
                saga_id, saga.state
            )));
        }
        if !saga.cancel_requested {
            let at = self.inner.clock.now();
            self.inner
                .log
                .append(&mut saga, SagaRecord::CancelRequested { saga_id, at })?;
            tracing::info!(saga_id = %saga_id, state = %saga.state, "checkout cancel requested");
        }
        Ok(saga.current_outcome())
    }

    /// Drive every non-terminal saga. Returns how many were resumed.
    pub fn recover(&self) -> usize {
        let slots: Vec<Arc<SagaSlot>> = self.inner.sagas.read().values().cloned().collect();
        let mut resumed = 0;
        for slot in slots {
            let (saga_id, state) = {
                let saga = slot.saga.lock();
                (saga.id, saga.state)
            };
            if state.is_terminal() {
                continue;
            }
            tracing::info!(saga_id = %saga_id, state = %state, "resuming saga");
            self.inner.metrics.counter_inc(metrics::SAGA_RESUMED_TOTAL);
            self.spawn_driver(slot);
            resumed += 1;
        }
        resumed
    }

    /// Finish the outstanding compensations of a flagged saga.
    pub async fn retry_compensations(&self, saga_id: SagaId) -> CoreResult<Saga> {
        let slot = self.slot(saga_id)?;
        {
            let saga = slot.saga.lock();
            if !saga.needs_attention || !saga.state.is_terminal() {
                return Ok(saga.clone());
            }
        }
        if self.compensate(&slot).await {
            let mut saga = slot.saga.lock();
            let at = self.inner.clock.now();
            self.inner
                .log
                .append(&mut saga, SagaRecord::Resolved { saga_id, at })?;
            tracing::info!(saga_id = %saga_id, "flagged saga resolved");
        }
        Ok(slot.snapshot())
    }

    pub fn get(&self, idempotency_key: &str) -> Option<Saga> {
        let saga_id = self.inner.index.lock().saga_id(idempotency_key)?;
        self.saga(saga_id)
    }

    pub fn saga(&self, saga_id: SagaId) -> Option<Saga> {
        let slot = self.inner.sagas.read().get(&saga_id).cloned()?;
        Some(slot.snapshot())
    }

    /// Sagas waiting for operator attention.
    pub fn flagged(&self) -> Vec<Saga> {
        let slots: Vec<Arc<SagaSlot>> = self.inner.sagas.read().values().cloned().collect();
        let mut flagged: Vec<Saga> = slots
            .iter()
            .map(|s| s.snapshot())
            .filter(|s| s.needs_attention)
            .collect();
        flagged.sort_by_key(|s| (s.created_at, s.id));
        flagged
    }

    pub fn len(&self) -> usize {
        self.inner.sagas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for a saga's terminal outcome.
    pub async fn wait(&self, saga_id: SagaId, deadline: Deadline) -> CoreResult<CheckoutOutcome> {
        let slot = self.slot(saga_id)?;
        wait_outcome(&slot, deadline)
            .await
            .ok_or_else(|| CoreError::deadline("saga wait"))
    }

    fn slot(&self, saga_id: SagaId) -> CoreResult<Arc<SagaSlot>> {
        self.inner
            .sagas
            .read()
            .get(&saga_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("saga", saga_id))
    }

    fn spawn_driver(&self, slot: Arc<SagaSlot>) {
        if slot.driving.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.drive(&slot).await;
            slot.driving.store(false, Ordering::SeqCst);
        });
    }

    // ==================================================================
    // Driver
    // ==================================================================

    async fn drive(&self, slot: &SagaSlot) {
        loop {
            let next = {
                let saga = slot.saga.lock();
                if saga.state.is_terminal() {
                    Next::Idle
                } else if saga.state == SagaState::Compensating {
                    Next::Compensate
                } else {
                    match saga.next_step() {
                        Some(step) => Next::Step {
                            step,
                            resumed: saga.in_flight == Some(step),
                        },
                        None => Next::Complete,
                    }
                }
            };

            let progressed = match next {
                Next::Idle => return,
                Next::Step { step, resumed } if resumed && !step.retry_safe() => self.fail(
                    slot,
                    step,
                    &CoreError::unavailable(format!("{step} outcome unknown after restart")),
                    true,
                ),
                Next::Step { step, .. } => self.forward(slot, step).await,
                Next::Compensate => {
                    self.compensate(slot).await;
                    self.close(slot, SagaState::Failed)
                }
                Next::Complete => self.close(slot, SagaState::Completed),
            };

            if let Err(e) = progressed {
                // Journal unavailable: park the saga for recover().
                let saga_id = slot.saga.lock().id;
                tracing::error!(saga_id = %saga_id, error = %e, "saga driver stopped");
                return;
            }
        }
    }

    /// Run one forward step and journal its result.
    async fn forward(&self, slot: &SagaSlot, step: SagaStep) -> CoreResult<()> {
        let (saga_id, request, planned) = {
            let mut saga = slot.saga.lock();
            if saga.cancel_requested {
                drop(saga);
                return self.fail(slot, step, &CoreError::invalid_input("cancelled by caller"), false);
            }
            let planned = plan(&saga, step);
            let request = saga.request.clone();
            let at = self.inner.clock.now();
            let saga_id = saga.id;
            self.inner.log.append(
                &mut saga,
                SagaRecord::StepEntering {
                    saga_id,
                    step,
                    planned: planned.clone(),
                    at,
                },
            )?;
            (saga_id, request, saga.planned.clone())
        };
        tracing::debug!(saga_id = %saga_id, step = %step, "saga step entering");

        let results = slot.saga.lock().results.clone();
        let outcome = if step == SagaStep::Commit {
            self.commit_with_retry(saga_id, &request, &results).await
        } else {
            Deadline::after(self.step_timeout(step))
                .run(
                    step.as_str(),
                    self.execute(step, saga_id, &request, &planned),
                )
                .await
        };

        match outcome {
            Ok(results) => {
                let mut saga = slot.saga.lock();
                let at = self.inner.clock.now();
                self.inner.log.append(
                    &mut saga,
                    SagaRecord::StepSucceeded {
                        saga_id,
                        step,
                        results,
                        at,
                    },
                )?;
                tracing::debug!(saga_id = %saga_id, step = %step, "saga step succeeded");
                Ok(())
            }
            Err(e) if step == SagaStep::Commit && in_doubt(&e) => {
                // Past the point of no return: flag and park for recovery.
                let mut saga = slot.saga.lock();
                let at = self.inner.clock.now();
                self.inner.log.append(
                    &mut saga,
                    SagaRecord::Flagged {
                        saga_id,
                        step,
                        detail: e.to_string(),
                        at,
                    },
                )?;
                self.inner.metrics.counter_inc(metrics::SAGA_FLAGGED_TOTAL);
                tracing::error!(saga_id = %saga_id, error = %e, "commit step failed; saga parked");
                Err(e)
            }
            Err(e) => {
                let doubt = in_doubt(&e);
                self.fail(slot, step, &e, doubt)
            }
        }
    }

    /// Journal a step failure; the saga moves to `compensating`.
    fn fail(&self, slot: &SagaSlot, step: SagaStep, err: &CoreError, doubt: bool) -> CoreResult<()> {
        let mut saga = slot.saga.lock();
        let reason = if saga.cancel_requested {
            FailureReason::Cancelled
        } else {
            FailureReason::classify(err)
        };
        let saga_id = saga.id;
        let at = self.inner.clock.now();
        self.inner.log.append(
            &mut saga,
            SagaRecord::StepFailed {
                saga_id,
                step,
                error: err.to_string(),
                reason,
                in_doubt: doubt,
                at,
            },
        )?;
        tracing::warn!(
            saga_id = %saga_id,
            step = %step,
            reason = %reason,
            in_doubt = doubt,
            error = %err,
            "saga step failed; compensating"
        );
        Ok(())
    }

    fn step_timeout(&self, step: SagaStep) -> Duration {
        let t = &self.inner.config.step_timeouts;
        match step {
            SagaStep::Reserve => t.reserve(),
            SagaStep::Pay => t.pay(),
            SagaStep::Order => t.order(),
            SagaStep::Commit => t.commit(),
        }
    }

    async fn execute(
        &self,
        step: SagaStep,
        saga_id: SagaId,
        request: &CheckoutRequest,
        planned: &StepResults,
    ) -> CoreResult<StepResults> {
        let deps = &self.inner.deps;
        match step {
            SagaStep::Reserve => {
                let id = planned
                    .reservation_id
                    .ok_or_else(|| CoreError::internal("reserve step without planned id"))?;
                let reservation = match request.flash_reservation {
                    Some(flash_id) => {
                        let flash = deps.flash.as_ref().ok_or_else(|| {
                            CoreError::invalid_input("flash reservations are not accepted here")
                        })?;
                        flash.claim(flash_id, &request.user_id, &saga_id.to_string())?
                    }
                    None => deps
                        .ledger
                        .reserve_as(id, &request.sku, request.qty, None, &request.user_id)?,
                };
                reservation.ensure_pending()?;
                Ok(StepResults {
                    reservation_id: Some(reservation.id),
                    ..StepResults::default()
                })
            }
            SagaStep::Pay => match &request.payment {
                PaymentMethod::Gateway { method } => {
                    let charge_id = deps
                        .gateway
                        .charge(&request.idempotency_key, request.amount, method)
                        .await?;
                    Ok(StepResults {
                        charge_id: Some(charge_id),
                        ..StepResults::default()
                    })
                }
                PaymentMethod::Wallet { currency, .. } => {
                    let hold_id = deps.wallet.hold(
                        &request.user_id,
                        currency,
                        request.amount,
                        &request.idempotency_key,
                    )?;
                    Ok(StepResults {
                        hold_id: Some(hold_id),
                        ..StepResults::default()
                    })
                }
            },
            SagaStep::Order => {
                let order_id = planned
                    .order_id
                    .ok_or_else(|| CoreError::internal("order step without planned id"))?;
                let record = deps
                    .orders
                    .create(NewOrder {
                        saga_id,
                        order_id,
                        user_id: request.user_id.clone(),
                        sku: request.sku.clone(),
                        qty: request.qty,
                        amount: request.amount,
                    })
                    .await?;
                Ok(StepResults {
                    order_id: Some(record.order_id),
                    ..StepResults::default()
                })
            }
            SagaStep::Commit => {
                Err(CoreError::internal("commit runs through commit_with_retry"))
            }
        }
    }

    async fn commit_with_retry(
        &self,
        saga_id: SagaId,
        request: &CheckoutRequest,
        results: &StepResults,
    ) -> CoreResult<StepResults> {
        let mut attempt = 1;
        loop {
            let result = Deadline::after(self.step_timeout(SagaStep::Commit))
                .run("commit", async { self.commit_effects(saga_id, request, results) })
                .await;
            match result {
                Err(e) if in_doubt(&e) && attempt < COMMIT_ATTEMPTS => {
                    tracing::warn!(saga_id = %saga_id, attempt, error = %e, "commit attempt failed; retrying");
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * u64::from(attempt))).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Commit the reservation, then settle escrow to the payee. Both halves
    /// accept an effect that already happened.
    fn commit_effects(
        &self,
        saga_id: SagaId,
        request: &CheckoutRequest,
        results: &StepResults,
    ) -> CoreResult<StepResults> {
        let deps = &self.inner.deps;
        let reservation_id = results
            .reservation_id
            .ok_or_else(|| CoreError::internal("commit without reservation"))?;

        match (&deps.flash, request.flash_reservation) {
            (Some(flash), Some(_)) => {
                let claimant = saga_id.to_string();
                let confirmed =
                    flash.confirm_as(reservation_id, &request.user_id, Some(&claimant), results.order_id)?;
                if results.order_id != Some(confirmed.order_id) {
                    return Err(CoreError::conflict(format!(
                        "flash reservation {} was confirmed for order {}",
                        reservation_id, confirmed.order_id
                    )));
                }
            }
            _ => match deps.ledger.commit(reservation_id) {
                Ok(_) => {}
                Err(e @ CoreError::Terminal { .. }) => {
                    if !reservation_in(&deps.ledger, reservation_id, ReservationState::Committed) {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            },
        }

        if let (Some(hold_id), PaymentMethod::Wallet { payee_user_id, .. }) =
            (results.hold_id, &request.payment)
        {
            let target = ReleaseTarget::ToPayee {
                payee_user_id: payee_user_id.clone(),
            };
            match deps.wallet.release(hold_id, target) {
                Ok(_) => {}
                Err(e @ CoreError::Terminal { .. }) => {
                    let settled = deps
                        .wallet
                        .get_hold(hold_id)
                        .map(|h| matches!(h.state, HoldState::ReleasedToPayee { .. }))
                        .unwrap_or(false);
                    if !settled {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(StepResults::default())
    }

    // ==================================================================
    // Compensation
    // ==================================================================

    /// Undo every outstanding step, newest first. Returns true when none
    /// is left.
    async fn compensate(&self, slot: &SagaSlot) -> bool {
        let saga = slot.snapshot();
        let mut clean = true;
        for step in saga.pending_compensations() {
            let result = self.undo_with_retry(&saga, step).await;
            let mut guard = slot.saga.lock();
            let at = self.inner.clock.now();
            let record = match &result {
                Ok(()) => {
                    self.inner.metrics.counter_inc(metrics::SAGA_COMPENSATIONS_TOTAL);
                    tracing::info!(saga_id = %saga.id, step = %step, "compensation done");
                    SagaRecord::CompensationDone {
                        saga_id: saga.id,
                        step,
                        at,
                    }
                }
                Err(e) => {
                    clean = false;
                    self.inner.metrics.counter_inc(metrics::SAGA_FLAGGED_TOTAL);
                    tracing::error!(saga_id = %saga.id, step = %step, error = %e, "compensation failed; saga flagged");
                    SagaRecord::Flagged {
                        saga_id: saga.id,
                        step,
                        detail: e.to_string(),
                        at,
                    }
                }
            };
            if let Err(e) = self.inner.log.append(&mut guard, record) {
                tracing::error!(saga_id = %saga.id, error = %e, "compensation record not journaled");
                return false;
            }
        }
        clean
    }

    async fn undo_with_retry(&self, saga: &Saga, step: SagaStep) -> CoreResult<()> {
        let mut attempt = 1;
        loop {
            let result = Deadline::after(self.step_timeout(step))
                .run(step.as_str(), self.undo(saga, step))
                .await;
            match result {
                Err(e) if e.is_retriable() && attempt < COMPENSATION_ATTEMPTS => {
                    tracing::warn!(saga_id = %saga.id, step = %step, attempt, error = %e, "compensation attempt failed");
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * u64::from(attempt))).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn undo(&self, saga: &Saga, step: SagaStep) -> CoreResult<()> {
        let deps = &self.inner.deps;
        let request = &saga.request;
        match step {
            SagaStep::Reserve => {
                let Some(id) = saga.results.reservation_id.or(saga.planned.reservation_id) else {
                    return Ok(());
                };
                if request.flash_reservation == Some(id) {
                    let ours = deps
                        .flash
                        .as_ref()
                        .and_then(|f| f.claimant(id))
                        .map_or(false, |c| c == saga.id.to_string());
                    if !ours {
                        // Never ours to give back.
                        return Ok(());
                    }
                }
                match deps.ledger.rollback(id) {
                    Ok(_) | Err(CoreError::NotFound { .. }) => Ok(()),
                    Err(e @ CoreError::Terminal { .. }) => {
                        if reservation_in(&deps.ledger, id, ReservationState::Committed) {
                            Err(CoreError::internal(format!(
                                "reservation {id} committed under a failed saga"
                            )))
                        } else {
                            tracing::debug!(reservation_id = %id, error = %e, "reservation already released");
                            Ok(())
                        }
                    }
                    Err(e) => Err(e),
                }
            }
            SagaStep::Pay => match &request.payment {
                PaymentMethod::Wallet { .. } => {
                    let hold = saga
                        .results
                        .hold_id
                        .and_then(|id| deps.wallet.get_hold(id))
                        .or_else(|| deps.wallet.hold_by_ref(&request.idempotency_key));
                    let Some(hold) = hold else {
                        return Ok(());
                    };
                    match hold.state {
                        HoldState::Open => deps
                            .wallet
                            .release(hold.id, ReleaseTarget::ToUser)
                            .map(|_| ()),
                        HoldState::ReleasedToUser => Ok(()),
                        HoldState::ReleasedToPayee { .. } => Err(CoreError::internal(format!(
                            "hold {} already paid out",
                            hold.id
                        ))),
                    }
                }
                PaymentMethod::Gateway { method } => {
                    let charge_id = match saga.results.charge_id {
                        Some(id) => id,
                        // In doubt: the gateway dedupes on the key, so this
                        // either finds the charge or makes one we refund.
                        None => match deps
                            .gateway
                            .charge(&request.idempotency_key, request.amount, method)
                            .await
                        {
                            Ok(id) => id,
                            Err(CoreError::PaymentDeclined { .. }) => return Ok(()),
                            Err(e) => return Err(e),
                        },
                    };
                    let refund_id = deps.gateway.refund(charge_id, request.amount).await?;
                    tracing::info!(saga_id = %saga.id, charge_id = %charge_id, refund_id = %refund_id, "charge refunded");
                    Ok(())
                }
            },
            SagaStep::Order => {
                let Some(id) = saga.results.order_id.or(saga.planned.order_id) else {
                    return Ok(());
                };
                match deps.orders.cancel(id).await {
                    Ok(()) | Err(CoreError::NotFound { .. }) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            SagaStep::Commit => Ok(()),
        }
    }

    /// Journal the terminal outcome and wake every waiter.
    fn close(&self, slot: &SagaSlot, state: SagaState) -> CoreResult<()> {
        let outcome = {
            let mut saga = slot.saga.lock();
            if saga.state.is_terminal() {
                return Ok(());
            }
            let saga_id = saga.id;
            let outcome = CheckoutOutcome {
                saga_id,
                state,
                order_id: match state {
                    SagaState::Completed => saga.results.order_id,
                    _ => None,
                },
                failure: match state {
                    SagaState::Failed => Some(saga.failure.unwrap_or(FailureReason::TryAgain)),
                    _ => None,
                },
            };
            let digest = outcome_digest(&outcome)?;
            let at = self.inner.clock.now();
            if state == SagaState::Completed && saga.needs_attention {
                self.inner
                    .log
                    .append(&mut saga, SagaRecord::Resolved { saga_id, at })?;
            }
            self.inner.log.append(
                &mut saga,
                SagaRecord::Closed {
                    saga_id,
                    outcome: outcome.clone(),
                    digest: digest.clone(),
                    at,
                },
            )?;
            self.inner
                .index
                .lock()
                .close(&saga.idempotency_key, &outcome, &digest);
            outcome
        };

        let name = match state {
            SagaState::Completed => metrics::SAGA_COMPLETED_TOTAL,
            _ => metrics::SAGA_FAILED_TOTAL,
        };
        self.inner.metrics.counter_inc(name);
        tracing::info!(
            saga_id = %outcome.saga_id,
            state = %outcome.state,
            failure = ?outcome.failure,
            "checkout saga closed"
        );
        slot.done.send_replace(Some(outcome));
        Ok(())
    }
}

/// Ids a step will use, reusing any planned by an earlier attempt.
fn plan(saga: &Saga, step: SagaStep) -> StepResults {
    let mut planned = StepResults::default();
    match step {
        SagaStep::Reserve => {
            planned.reservation_id = Some(
                saga.planned
                    .reservation_id
                    .or(saga.request.flash_reservation)
                    .unwrap_or_else(ReservationId::generate),
            );
        }
        SagaStep::Order => {
            planned.order_id = Some(saga.planned.order_id.unwrap_or_else(OrderId::generate));
        }
        SagaStep::Pay | SagaStep::Commit => {}
    }
    planned
}

/// Failures after which the remote effect may still have happened.
fn in_doubt(err: &CoreError) -> bool {
    matches!(
        err,
        CoreError::DeadlineExceeded { .. }
            | CoreError::Unavailable { .. }
            | CoreError::Storage { .. }
            | CoreError::Internal { .. }
    )
}

fn reservation_in(ledger: &ReservationLedger, id: ReservationId, state: ReservationState) -> bool {
    ledger
        .reservation(id)
        .map(|r| r.state == state)
        .unwrap_or(false)
}

async fn wait_outcome(slot: &SagaSlot, deadline: Deadline) -> Option<CheckoutOutcome> {
    let mut rx = slot.done.subscribe();
    let waited = tokio::time::timeout_at(deadline.instant(), rx.wait_for(Option::is_some)).await;
    match waited {
        Ok(Ok(outcome)) => outcome.clone(),
        _ => None,
    }
}
