//! Flash-sale admission engine.
//!
//! An attempt passes, in order: the per-user (and per-source) token bucket,
//! the single-use proof-of-work challenge, the sale window check, and the
//! bounded per-sale FIFO. A worker then runs the per-user cap check and the
//! ledger reservation as one step under the sale's lock, so no burst can
//! grant more holds than the dedicated stock or let one user exceed
//! `max_per_user`.
//!
//! Each sale's stock lives under its own ledger key (see
//! [`FlashSale::stock_key`]), provisioned with `total_qty` units when the sale
//! is created. Oversell is therefore impossible by construction of the
//! ledger, independent of the SKU's regular inventory.

use crate::core::config::FlashSaleConfig;
use crate::core::error::{CoreError, CoreResult};
use crate::core::ids::{OrderId, ReservationId, SaleId};
use crate::core::time::{Deadline, SharedClock};
use crate::flash::pow::{self, ChallengeBook, ChallengeIssue};
use crate::flash::queue::{AdmissionJob, AdmissionLane};
use crate::flash::rate_limit::RateLimiter;
use crate::flash::sale::{Admission, FlashSale, FlashSaleBook, NewFlashSale, SaleState};
use crate::ledger::{Reservation, ReservationLedger, ReservationState};
use crate::ops::observability::{metrics, SharedMetrics};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Semaphore};

/// One purchase attempt as received at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseAttempt {
    pub sale_id: SaleId,
    pub user_id: String,
    pub qty: u64,
    /// Hex challenge from `get_challenge`.
    pub challenge: String,
    pub nonce: u64,
    /// Client network source, rate limited separately when present.
    #[serde(default)]
    pub source: Option<String>,
}

/// Result of confirming a hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub order_id: OrderId,
    /// This call did the commit (false for an idempotent repeat).
    pub fresh: bool,
}

struct Inner {
    config: FlashSaleConfig,
    book: FlashSaleBook,
    ledger: Arc<ReservationLedger>,
    challenges: ChallengeBook,
    user_limiter: RateLimiter,
    source_limiter: RateLimiter,
    lanes: RwLock<HashMap<SaleId, AdmissionLane>>,
    workers: Arc<Semaphore>,
    clock: SharedClock,
    metrics: SharedMetrics,
    shutdown: watch::Receiver<bool>,
}

/// Admission control and atomic holds for flash sales.
#[derive(Clone)]
pub struct FlashSaleEngine {
    inner: Arc<Inner>,
}

impl FlashSaleEngine {
    pub fn new(
        config: FlashSaleConfig,
        book: FlashSaleBook,
        ledger: Arc<ReservationLedger>,
        clock: SharedClock,
        metrics: SharedMetrics,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.admission_workers.max(1)));
        let user_limiter = RateLimiter::new(config.rate_limit_refill_per_s, config.rate_limit_burst);
        let source_limiter =
            RateLimiter::new(config.rate_limit_refill_per_s, config.rate_limit_burst);
        Self {
            inner: Arc::new(Inner {
                config,
                book,
                ledger,
                challenges: ChallengeBook::new(),
                user_limiter,
                source_limiter,
                lanes: RwLock::new(HashMap::new()),
                workers,
                clock,
                metrics,
                shutdown,
            }),
        }
    }

    /// Register a sale and provision its dedicated stock.
    pub fn create_sale(&self, params: NewFlashSale) -> CoreResult<FlashSale> {
        params.validate()?;
        let sale = FlashSale::from_params(SaleId::generate(), params);
        self.inner.ledger.add_stock(&sale.stock_key(), sale.total_qty)?;
        let sale = self.inner.book.create(sale)?;
        tracing::info!(
            sale_id = %sale.id,
            sku = %sale.sku,
            total_qty = sale.total_qty,
            max_per_user = sale.max_per_user,
            start = %sale.start,
            end = %sale.end,
            "flash sale created"
        );
        self.tick()?;
        self.inner
            .book
            .get(sale.id)
            .ok_or_else(|| CoreError::not_found("sale", sale.id))
    }

    pub fn sale(&self, sale_id: SaleId) -> Option<FlashSale> {
        self.inner.book.get(sale_id)
    }

    pub fn sales(&self, state: Option<SaleState>) -> Vec<FlashSale> {
        self.inner.book.list(state)
    }

    /// Units a user has bought plus units they currently hold.
    pub fn user_count(&self, sale_id: SaleId, user_id: &str) -> CoreResult<u64> {
        let entry = self.inner.book.entry(sale_id)?;
        let ledger = &self.inner.ledger;
        let count = entry
            .lock()
            .committed_to_user(user_id, |id| is_pending(ledger, id));
        Ok(count)
    }

    /// Current admission queue depth for a sale.
    pub fn queue_depth(&self, sale_id: SaleId) -> u64 {
        self.inner
            .lanes
            .read()
            .get(&sale_id)
            .map(AdmissionLane::depth)
            .unwrap_or(0)
    }

    /// Issue a single-use PoW challenge sized to the current load.
    pub fn get_challenge(&self, sale_id: SaleId, user_id: &str) -> CoreResult<ChallengeIssue> {
        if user_id.is_empty() {
            return Err(CoreError::invalid_input("user_id is required"));
        }
        let sale = self
            .inner
            .book
            .get(sale_id)
            .ok_or_else(|| CoreError::not_found("sale", sale_id))?;
        match sale.state {
            SaleState::Scheduled | SaleState::Active => {}
            SaleState::SoldOut => {
                return Err(CoreError::SoldOut {
                    sale_id: sale_id.to_string(),
                })
            }
            SaleState::Ended => {
                return Err(CoreError::NotActive {
                    sale_id: sale_id.to_string(),
                    state: sale.state.to_string(),
                })
            }
        }
        let cfg = &self.inner.config;
        let difficulty = pow::adaptive_difficulty(
            cfg.pow_difficulty_base,
            cfg.pow_difficulty_max,
            cfg.pow_load_step,
            self.queue_depth(sale_id),
        );
        Ok(self.inner.challenges.issue(
            sale_id,
            user_id,
            difficulty,
            self.inner.clock.now(),
            cfg.challenge_ttl_ms,
        ))
    }

    /// Run the admission pipeline and wait for the worker's verdict.
    pub async fn attempt_purchase(
        &self,
        attempt: PurchaseAttempt,
        deadline: Deadline,
    ) -> CoreResult<Reservation> {
        let result = self.admit(attempt, deadline).await;
        match &result {
            Ok(reservation) => {
                self.inner.metrics.counter_inc(metrics::FLASH_ADMITTED_TOTAL);
                tracing::debug!(
                    reservation_id = %reservation.id,
                    user_id = %reservation.user_id,
                    "flash purchase admitted"
                );
            }
            Err(e) => self
                .inner
                .metrics
                .counter_inc_labeled(metrics::FLASH_REJECTED_TOTAL, e.kind().as_str()),
        }
        result
    }

    async fn admit(&self, attempt: PurchaseAttempt, deadline: Deadline) -> CoreResult<Reservation> {
        deadline.check("attempt_purchase")?;
        if attempt.qty == 0 {
            return Err(CoreError::invalid_input("qty must be > 0"));
        }
        if attempt.user_id.is_empty() {
            return Err(CoreError::invalid_input("user_id is required"));
        }
        let inner = &self.inner;
        let now = inner.clock.now();

        inner
            .user_limiter
            .check(&attempt.user_id, now)
            .map_err(|retry_after_ms| CoreError::RateLimited { retry_after_ms })?;
        if let Some(source) = attempt.source.as_deref() {
            inner
                .source_limiter
                .check(source, now)
                .map_err(|retry_after_ms| CoreError::RateLimited { retry_after_ms })?;
        }

        let challenge = pow::decode_challenge(&attempt.challenge)?;
        inner.challenges.redeem(
            &challenge,
            attempt.sale_id,
            &attempt.user_id,
            attempt.nonce,
            now,
        )?;

        let sale = inner
            .book
            .get(attempt.sale_id)
            .ok_or_else(|| CoreError::not_found("sale", attempt.sale_id))?;
        sale.ensure_open(now)?;
        if attempt.qty > u64::from(sale.max_per_user) {
            return Err(CoreError::PerUserCap {
                sale_id: sale.id.to_string(),
                user_id: attempt.user_id,
                max_per_user: sale.max_per_user,
            });
        }

        let (reply, mut verdict) = oneshot::channel();
        self.lane(sale.id).submit(AdmissionJob {
            user_id: attempt.user_id,
            qty: attempt.qty,
            enqueued_at: now,
            reply,
        })?;
        inner
            .metrics
            .gauge_set(metrics::FLASH_QUEUE_DEPTH, self.queue_depth(sale.id));

        match tokio::time::timeout_at(deadline.instant(), &mut verdict).await {
            Ok(reply) => reply
                .map_err(|_| CoreError::unavailable("admission worker dropped the request"))?,
            Err(_) => {
                // After close, a grant is either here or refused at send.
                verdict.close();
                if let Ok(Ok(orphan)) = verdict.try_recv() {
                    self.release_orphan(&orphan);
                }
                Err(CoreError::deadline("attempt_purchase"))
            }
        }
    }

    fn lane(&self, sale_id: SaleId) -> AdmissionLane {
        if let Some(lane) = self.inner.lanes.read().get(&sale_id) {
            if !lane.is_closed() {
                return lane.clone();
            }
        }
        let mut lanes = self.inner.lanes.write();
        if let Some(lane) = lanes.get(&sale_id) {
            if !lane.is_closed() {
                return lane.clone();
            }
        }
        let engine = self.clone();
        let lane = AdmissionLane::spawn(
            self.inner.config.admission_queue_capacity,
            Arc::clone(&self.inner.workers),
            self.inner.shutdown.clone(),
            move |job| {
                let engine = engine.clone();
                async move {
                    let result = engine.grant(sale_id, &job.user_id, job.qty);
                    if let Err(Ok(orphan)) = job.reply.send(result) {
                        engine.release_orphan(&orphan);
                    }
                }
            },
        );
        lanes.insert(sale_id, lane.clone());
        tracing::debug!(sale_id = %sale_id, "admission lane started");
        lane
    }

    /// Cap check and reservation, serialized by the sale's lock.
    fn grant(&self, sale_id: SaleId, user_id: &str, qty: u64) -> CoreResult<Reservation> {
        let inner = &self.inner;
        let entry = inner.book.entry(sale_id)?;
        let mut entry = entry.lock();
        let now = inner.clock.now();
        entry.sale.ensure_open(now)?;

        let ledger = &inner.ledger;
        let counted = entry.committed_to_user(user_id, |id| is_pending(ledger, id));
        let max = u64::from(entry.sale.max_per_user);
        if counted.saturating_add(qty) > max {
            return Err(CoreError::PerUserCap {
                sale_id: sale_id.to_string(),
                user_id: user_id.to_string(),
                max_per_user: entry.sale.max_per_user,
            });
        }

        let hold_window = Duration::from_millis(inner.config.hold_window_ms);
        let reservation = match ledger.reserve(&entry.sale.stock_key(), qty, Some(hold_window), user_id) {
            Ok(r) => r,
            Err(CoreError::InsufficientStock { .. }) => {
                return Err(CoreError::SoldOut {
                    sale_id: sale_id.to_string(),
                })
            }
            Err(e) => return Err(e),
        };
        if let Err(e) = inner.book.admit(&mut entry, user_id, reservation.id, qty) {
            // Hold is not tracked; give the stock back.
            if let Err(rb) = ledger.rollback(reservation.id) {
                tracing::error!(reservation_id = %reservation.id, error = %rb, "rollback of untracked hold failed");
            }
            return Err(e);
        }
        Ok(reservation)
    }

    /// The caller gave up before its grant arrived; nobody can learn this
    /// hold's id, so return the stock and the cap slot right away.
    fn release_orphan(&self, reservation: &Reservation) {
        match self.inner.ledger.rollback(reservation.id) {
            Ok(_) => tracing::debug!(
                reservation_id = %reservation.id,
                user_id = %reservation.user_id,
                "undelivered flash hold rolled back"
            ),
            Err(e) => tracing::warn!(
                reservation_id = %reservation.id,
                error = %e,
                "undelivered flash hold not rolled back"
            ),
        }
    }

    /// Commit a hold into a sale; idempotent on the reservation id.
    pub fn confirm_purchase(&self, reservation_id: ReservationId, user_id: &str) -> CoreResult<OrderId> {
        self.confirm_as(reservation_id, user_id, None, None)
            .map(|c| c.order_id)
    }

    /// Hand a pending hold over to one checkout. Repeating the claim with
    /// the same `claimant` succeeds; any other claimant gets `Conflict`.
    pub fn claim(
        &self,
        reservation_id: ReservationId,
        user_id: &str,
        claimant: &str,
    ) -> CoreResult<Reservation> {
        let inner = &self.inner;
        let admission = self.owned_admission(reservation_id, user_id)?;
        let entry = inner.book.entry(admission.sale_id)?;
        let mut entry = entry.lock();
        let admission = self.owned_admission(reservation_id, user_id)?;
        match admission.claimed_by.as_deref() {
            Some(owner) if owner == claimant => {}
            Some(owner) => {
                return Err(CoreError::conflict(format!(
                    "flash reservation {} is claimed by {}",
                    reservation_id, owner
                )))
            }
            None => {
                if admission.order_id.is_some() {
                    return Err(CoreError::conflict(format!(
                        "flash reservation {} is already confirmed",
                        reservation_id
                    )));
                }
                let held = inner
                    .ledger
                    .reservation(reservation_id)
                    .ok_or_else(|| CoreError::not_found("reservation", reservation_id))?;
                held.ensure_pending()?;
                inner
                    .book
                    .claim(&mut entry, reservation_id, claimant, inner.clock.now())?;
                tracing::debug!(reservation_id = %reservation_id, claimant = %claimant, "flash hold claimed");
            }
        }
        drop(entry);
        inner
            .ledger
            .reservation(reservation_id)
            .ok_or_else(|| CoreError::not_found("reservation", reservation_id))
    }

    /// Who owns a hold, if a checkout claimed it.
    pub fn claimant(&self, reservation_id: ReservationId) -> Option<String> {
        self.inner
            .book
            .admission(reservation_id)
            .and_then(|a| a.claimed_by)
    }

    fn owned_admission(&self, reservation_id: ReservationId, user_id: &str) -> CoreResult<Admission> {
        let admission = self
            .inner
            .book
            .admission(reservation_id)
            .ok_or_else(|| CoreError::not_found("flash reservation", reservation_id))?;
        if admission.user_id != user_id {
            return Err(CoreError::invalid_input(format!(
                "reservation {} does not belong to {}",
                reservation_id, user_id
            )));
        }
        Ok(admission)
    }

    /// Like [`confirm_purchase`](Self::confirm_purchase) on behalf of
    /// `claimant` with a caller-chosen order id. A claimed hold confirms
    /// only for its claimant.
    pub fn confirm_as(
        &self,
        reservation_id: ReservationId,
        user_id: &str,
        claimant: Option<&str>,
        order_id: Option<OrderId>,
    ) -> CoreResult<Confirmation> {
        let inner = &self.inner;
        let admission = self.owned_admission(reservation_id, user_id)?;
        if let Some(existing) = admission.order_id {
            return Ok(Confirmation {
                order_id: existing,
                fresh: false,
            });
        }

        let entry = inner.book.entry(admission.sale_id)?;
        let mut entry = entry.lock();
        // Re-read under the sale lock: a concurrent confirm may have won.
        let admission = self.owned_admission(reservation_id, user_id)?;
        if let Some(existing) = admission.order_id {
            return Ok(Confirmation {
                order_id: existing,
                fresh: false,
            });
        }
        if admission.claimed_by.as_deref() != claimant {
            return Err(CoreError::conflict(format!(
                "flash reservation {} is held for another checkout",
                reservation_id
            )));
        }

        match inner.ledger.commit(reservation_id) {
            Ok(_) => {}
            Err(CoreError::Terminal { .. })
                if inner
                    .ledger
                    .reservation(reservation_id)
                    .map(|r| r.state == ReservationState::Committed)
                    .unwrap_or(false) =>
            {
                // Committed before a crash cut off the purchase record.
            }
            Err(e @ CoreError::Terminal { .. }) => return Err(e),
            Err(e) => {
                tracing::warn!(reservation_id = %reservation_id, error = %e, "flash commit failed; rolling back hold");
                if let Err(rb) = inner.ledger.rollback(reservation_id) {
                    tracing::error!(reservation_id = %reservation_id, error = %rb, "compensating rollback failed");
                }
                return Err(e);
            }
        }

        let now = inner.clock.now();
        let order_id = order_id.unwrap_or_else(OrderId::generate);
        let sold_out = inner.book.purchase(&mut entry, &admission, order_id, now)?;
        if sold_out {
            inner.book.set_state(&mut entry, SaleState::SoldOut, now)?;
        }
        drop(entry);

        inner.metrics.counter_inc(metrics::FLASH_CONFIRMED_TOTAL);
        tracing::info!(
            reservation_id = %reservation_id,
            order_id = %order_id,
            sale_id = %admission.sale_id,
            user_id = %user_id,
            "flash purchase confirmed"
        );
        Ok(Confirmation {
            order_id,
            fresh: true,
        })
    }

    /// Apply due lifecycle transitions and prune expired gate state.
    /// Returns the number of transitions applied.
    pub fn tick(&self) -> CoreResult<usize> {
        let inner = &self.inner;
        let now = inner.clock.now();
        let mut applied = 0;
        for sale_id in inner.book.sale_ids() {
            let entry = inner.book.entry(sale_id)?;
            let mut entry = entry.lock();
            while let Some(next) = entry.sale.due_transition(now) {
                inner.book.set_state(&mut entry, next, now)?;
                applied += 1;
            }
            if entry.sale.state == SaleState::Ended {
                drop(entry);
                self.retire_lane(sale_id);
            }
        }
        inner.challenges.prune(now);
        inner.user_limiter.prune(now);
        inner.source_limiter.prune(now);
        Ok(applied)
    }

    fn retire_lane(&self, sale_id: SaleId) {
        if self.inner.lanes.write().remove(&sale_id).is_some() {
            tracing::debug!(sale_id = %sale_id, "admission lane retired");
        }
    }

    /// Single-writer scheduler loop.
    pub async fn run_scheduler(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick() {
                        tracing::error!(error = %e, "flash sale scheduler tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("flash sale scheduler stopping");
                        return;
                    }
                }
            }
        }
    }
}

fn is_pending(ledger: &ReservationLedger, id: ReservationId) -> bool {
    ledger
        .reservation(id)
        .map(|r| r.state == ReservationState::Pending)
        .unwrap_or(false)
}
