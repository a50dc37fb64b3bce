//! The reservation ledger.
//!
//! # Concurrency
//!
//! Each SKU owns a [`SkuBook`] behind its own mutex; reserve, commit and
//! rollback run as one critical section over `(StockAccount, Reservation)`
//! and append their journal record before releasing it. Operations on
//! different SKUs never contend on anything but the journal append.
//!
//! # Recovery
//!
//! Counters are never persisted directly. Replay rebuilds them from the
//! reservation log as
//! `available = total_issued - committed - pending(not expired)`; pending
//! reservations whose TTL lapsed while the process was down are expired
//! during replay.
//!
//! # Quarantine
//!
//! A counter movement that would break conservation is refused with
//! `InvariantViolation` and the SKU stops accepting writes until
//! [`ReservationLedger::clear_quarantine`] re-derives its counters.

use crate::core::config::ReservationsConfig;
use crate::core::error::{CoreError, CoreResult};
use crate::core::ids::ReservationId;
use crate::core::time::{SharedClock, Timestamp};
use crate::ledger::expiry::ExpirationQueue;
use crate::ledger::reservation::{Reservation, ReservationState};
use crate::ledger::stock::StockAccount;
use crate::ops::observability::{metrics, SharedMetrics};
use crate::storage::Journal;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Journal records of `ledger.wal`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerRecord {
    StockAdded {
        sku: String,
        qty: u64,
    },
    Reserved {
        reservation: Reservation,
    },
    Committed {
        id: ReservationId,
        sku: String,
        at: Timestamp,
    },
    RolledBack {
        id: ReservationId,
        sku: String,
        at: Timestamp,
    },
    Expired {
        id: ReservationId,
        sku: String,
        at: Timestamp,
    },
}

impl LedgerRecord {
    fn settled(id: ReservationId, sku: &str, state: ReservationState, at: Timestamp) -> Self {
        let sku = sku.to_string();
        match state {
            ReservationState::Committed => Self::Committed { id, sku, at },
            ReservationState::RolledBack => Self::RolledBack { id, sku, at },
            _ => Self::Expired { id, sku, at },
        }
    }
}

/// Stock and reservations of one SKU.
#[derive(Debug, Default)]
struct SkuBook {
    account: StockAccount,
    reservations: HashMap<ReservationId, Reservation>,
    quarantine: Option<String>,
}

impl SkuBook {
    fn ensure_writable(&self, sku: &str) -> CoreResult<()> {
        if self.quarantine.is_some() {
            return Err(CoreError::Quarantined {
                key: sku.to_string(),
            });
        }
        Ok(())
    }

    fn pending_qty(&self) -> u64 {
        self.reservations
            .values()
            .filter(|r| r.is_pending())
            .map(|r| r.qty)
            .sum()
    }

    fn committed_qty(&self) -> u64 {
        self.reservations
            .values()
            .filter(|r| r.state == ReservationState::Committed)
            .map(|r| r.qty)
            .sum()
    }
}

/// In-memory authoritative stock with a durable shadow log.
pub struct ReservationLedger {
    books: RwLock<HashMap<String, Arc<Mutex<SkuBook>>>>,
    index: RwLock<HashMap<ReservationId, String>>,
    expiry: Mutex<ExpirationQueue<ReservationId>>,
    pending: AtomicU64,
    journal: Journal<LedgerRecord>,
    clock: SharedClock,
    metrics: SharedMetrics,
    default_ttl_ms: u64,
}

impl ReservationLedger {
    /// Open the ledger and rebuild counters from `journal`.
    pub fn open(
        journal: Journal<LedgerRecord>,
        clock: SharedClock,
        metrics: SharedMetrics,
        config: &ReservationsConfig,
    ) -> CoreResult<Self> {
        let ledger = Self {
            books: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            expiry: Mutex::new(ExpirationQueue::new()),
            pending: AtomicU64::new(0),
            journal,
            clock,
            metrics,
            default_ttl_ms: config.default_ttl_ms,
        };
        ledger.replay()?;
        Ok(ledger)
    }

    fn replay(&self) -> CoreResult<()> {
        let mut issued: HashMap<String, u64> = HashMap::new();
        let mut books: HashMap<String, SkuBook> = HashMap::new();
        let entries = self.journal.replay()?;
        let record_count = entries.len();

        for entry in entries {
            match entry.record {
                LedgerRecord::StockAdded { sku, qty } => {
                    let total = issued.entry(sku.clone()).or_insert(0);
                    *total = total.saturating_add(qty);
                    books.entry(sku).or_default();
                }
                LedgerRecord::Reserved { reservation } => {
                    books
                        .entry(reservation.sku.clone())
                        .or_default()
                        .reservations
                        .insert(reservation.id, reservation);
                }
                LedgerRecord::Committed { id, sku, at } => {
                    replay_settle(&mut books, &sku, id, ReservationState::Committed, at)
                }
                LedgerRecord::RolledBack { id, sku, at } => {
                    replay_settle(&mut books, &sku, id, ReservationState::RolledBack, at)
                }
                LedgerRecord::Expired { id, sku, at } => {
                    replay_settle(&mut books, &sku, id, ReservationState::Expired, at)
                }
            }
        }

        let now = self.clock.now();
        let mut lapsed = 0usize;
        let mut index = self.index.write();
        let mut expiry = self.expiry.lock();
        let mut pending_total = 0u64;

        for (sku, book) in books.iter_mut() {
            for reservation in book.reservations.values_mut() {
                index.insert(reservation.id, sku.clone());
                if !reservation.is_pending() {
                    continue;
                }
                if reservation.is_expired_at(now) {
                    self.journal.append(&LedgerRecord::Expired {
                        id: reservation.id,
                        sku: sku.clone(),
                        at: now,
                    })?;
                    reservation.settle(ReservationState::Expired, now)?;
                    lapsed += 1;
                } else {
                    expiry.schedule(reservation.id, reservation.expires_at.ms);
                    pending_total += 1;
                }
            }

            let total = issued.get(sku).copied().unwrap_or(0);
            match StockAccount::derive(sku, total, book.committed_qty(), book.pending_qty()) {
                Ok(account) => book.account = account,
                Err(e) => {
                    tracing::error!(sku = %sku, error = %e, "ledger replay found inconsistent counters; quarantining");
                    book.account = StockAccount {
                        total_issued: total,
                        ..StockAccount::default()
                    };
                    book.quarantine = Some(e.to_string());
                }
            }
        }
        drop(expiry);
        drop(index);

        self.pending.store(pending_total, Ordering::Relaxed);
        self.metrics.gauge_set(metrics::LEDGER_PENDING, pending_total);
        *self.books.write() = books
            .into_iter()
            .map(|(sku, book)| (sku, Arc::new(Mutex::new(book))))
            .collect();

        tracing::info!(
            records = record_count,
            pending = pending_total,
            lapsed,
            "reservation ledger replayed"
        );
        Ok(())
    }

    fn book(&self, sku: &str) -> Option<Arc<Mutex<SkuBook>>> {
        self.books.read().get(sku).cloned()
    }

    fn sku_of(&self, id: ReservationId) -> CoreResult<String> {
        self.index
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("reservation", id))
    }

    /// Refuse the movement and stop writes on `sku`.
    fn quarantine(&self, book: &mut SkuBook, sku: &str, err: CoreError) -> CoreError {
        if let CoreError::InvariantViolation { detail, .. } = &err {
            tracing::error!(sku = %sku, detail = %detail, "stock invariant violated; quarantining sku");
            book.quarantine = Some(detail.clone());
        }
        err
    }

    fn pending_delta(&self, up: bool) {
        let value = if up {
            self.pending.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.pending.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
        };
        self.metrics.gauge_set(metrics::LEDGER_PENDING, value);
    }

    /// Add `qty` units to `sku`, creating its account on first load.
    pub fn add_stock(&self, sku: &str, qty: u64) -> CoreResult<StockAccount> {
        if sku.is_empty() {
            return Err(CoreError::invalid_input("sku must not be empty"));
        }
        if qty == 0 {
            return Err(CoreError::invalid_input("restock quantity must be > 0"));
        }
        let book = self
            .books
            .write()
            .entry(sku.to_string())
            .or_default()
            .clone();
        let mut book = book.lock();
        book.ensure_writable(sku)?;
        let next = match book.account.restocked(sku, qty) {
            Ok(next) => next,
            Err(e) => return Err(self.quarantine(&mut book, sku, e)),
        };
        self.journal.append(&LedgerRecord::StockAdded {
            sku: sku.to_string(),
            qty,
        })?;
        book.account = next;
        tracing::debug!(sku = %sku, qty, available = next.available, "stock added");
        Ok(next)
    }

    /// Reserve `qty` units of `sku` for `user_id`.
    pub fn reserve(
        &self,
        sku: &str,
        qty: u64,
        ttl: Option<Duration>,
        user_id: &str,
    ) -> CoreResult<Reservation> {
        self.reserve_as(ReservationId::generate(), sku, qty, ttl, user_id)
    }

    /// Reserve under a caller-chosen id.
    ///
    /// Retrying with the same id returns the existing reservation in
    /// whatever state it reached instead of claiming stock twice.
    pub fn reserve_as(
        &self,
        id: ReservationId,
        sku: &str,
        qty: u64,
        ttl: Option<Duration>,
        user_id: &str,
    ) -> CoreResult<Reservation> {
        if qty == 0 {
            return Err(CoreError::invalid_input("reservation quantity must be > 0"));
        }
        let ttl_ms = ttl
            .map(|d| d.as_millis() as u64)
            .unwrap_or(self.default_ttl_ms);
        if ttl_ms == 0 {
            return Err(CoreError::invalid_input("reservation ttl must be > 0"));
        }
        if let Some(existing_sku) = self.index.read().get(&id) {
            if existing_sku != sku {
                return Err(CoreError::conflict(format!(
                    "reservation {} belongs to {}",
                    id, existing_sku
                )));
            }
        }

        let Some(book) = self.book(sku) else {
            self.metrics.counter_inc(metrics::LEDGER_INSUFFICIENT_TOTAL);
            return Err(CoreError::InsufficientStock {
                sku: sku.to_string(),
                requested: qty,
                available: 0,
            });
        };
        let mut book = book.lock();
        if let Some(existing) = book.reservations.get(&id) {
            return Ok(existing.clone());
        }
        book.ensure_writable(sku)?;

        let next = match book.account.reserved(sku, qty) {
            Ok(next) => next,
            Err(e @ CoreError::InsufficientStock { .. }) => {
                self.metrics.counter_inc(metrics::LEDGER_INSUFFICIENT_TOTAL);
                return Err(e);
            }
            Err(e) => return Err(self.quarantine(&mut book, sku, e)),
        };

        let now = self.clock.now();
        let reservation = Reservation {
            id,
            sku: sku.to_string(),
            qty,
            user_id: user_id.to_string(),
            created_at: now,
            expires_at: now.add_ms(ttl_ms),
            state: ReservationState::Pending,
            settled_at: None,
        };
        self.journal.append(&LedgerRecord::Reserved {
            reservation: reservation.clone(),
        })?;

        book.account = next;
        book.reservations.insert(id, reservation.clone());
        self.index.write().insert(id, sku.to_string());
        self.expiry.lock().schedule(id, reservation.expires_at.ms);
        drop(book);

        self.metrics.counter_inc(metrics::LEDGER_RESERVE_TOTAL);
        self.pending_delta(true);
        tracing::debug!(
            reservation_id = %id,
            sku = %sku,
            qty,
            user_id = %user_id,
            expires_at = %reservation.expires_at,
            "stock reserved"
        );
        Ok(reservation)
    }

    /// Realize a pending reservation.
    ///
    /// A reservation past its TTL is expired on the spot and the commit fails
    /// `terminal`, exactly as if the sweeper had reached it first.
    pub fn commit(&self, id: ReservationId) -> CoreResult<Reservation> {
        self.settle(id, ReservationState::Committed)
    }

    /// Return a pending reservation's quantity to available.
    pub fn rollback(&self, id: ReservationId) -> CoreResult<Reservation> {
        self.settle(id, ReservationState::RolledBack)
    }

    fn settle(&self, id: ReservationId, requested: ReservationState) -> CoreResult<Reservation> {
        let sku = self.sku_of(id)?;
        let book = self
            .book(&sku)
            .ok_or_else(|| CoreError::internal(format!("index points at missing sku {}", sku)))?;
        let mut book = book.lock();
        let now = self.clock.now();

        let (qty, lapsed) = {
            let reservation = book
                .reservations
                .get(&id)
                .ok_or_else(|| CoreError::not_found("reservation", id))?;
            reservation.ensure_pending()?;
            (reservation.qty, reservation.is_expired_at(now))
        };
        book.ensure_writable(&sku)?;

        let target = if requested == ReservationState::Committed && lapsed {
            ReservationState::Expired
        } else {
            requested
        };
        let next = match target {
            ReservationState::Committed => book.account.committed(&sku, qty),
            _ => book.account.released(&sku, qty),
        };
        let next = match next {
            Ok(next) => next,
            Err(e) => return Err(self.quarantine(&mut book, &sku, e)),
        };

        self.journal
            .append(&LedgerRecord::settled(id, &sku, target, now))?;
        book.account = next;
        let settled = match book.reservations.get_mut(&id) {
            Some(reservation) => {
                reservation.settle(target, now)?;
                reservation.clone()
            }
            None => return Err(CoreError::not_found("reservation", id)),
        };
        drop(book);

        self.expiry.lock().cancel(&id);
        self.pending_delta(false);
        self.record_settled(&settled);

        if target != requested {
            return Err(CoreError::terminal("reservation", id, target));
        }
        Ok(settled)
    }

    fn record_settled(&self, reservation: &Reservation) {
        let name = match reservation.state {
            ReservationState::Committed => metrics::LEDGER_COMMIT_TOTAL,
            ReservationState::RolledBack => metrics::LEDGER_ROLLBACK_TOTAL,
            _ => metrics::LEDGER_EXPIRED_TOTAL,
        };
        self.metrics.counter_inc(name);
        tracing::debug!(
            reservation_id = %reservation.id,
            sku = %reservation.sku,
            qty = reservation.qty,
            state = %reservation.state,
            "reservation settled"
        );
    }

    /// Expire every pending reservation past its TTL. Idempotent.
    pub fn sweep(&self) -> CoreResult<usize> {
        let now = self.clock.now();
        let due = self.expiry.lock().drain_due(now.ms);
        let mut expired = 0usize;
        let mut deferred = Vec::new();

        for id in due {
            let Ok(sku) = self.sku_of(id) else { continue };
            let Some(book) = self.book(&sku) else { continue };
            let mut book = book.lock();

            let (qty, expires_at) = match book.reservations.get(&id) {
                Some(r) if r.is_pending() => (r.qty, r.expires_at),
                _ => continue,
            };
            if now.is_before(expires_at) {
                deferred.push((id, expires_at));
                continue;
            }
            if book.quarantine.is_some() {
                deferred.push((id, expires_at));
                continue;
            }
            let next = match book.account.released(&sku, qty) {
                Ok(next) => next,
                Err(e) => {
                    let _ = self.quarantine(&mut book, &sku, e);
                    deferred.push((id, expires_at));
                    continue;
                }
            };
            self.journal.append(&LedgerRecord::Expired {
                id,
                sku: sku.clone(),
                at: now,
            })?;
            book.account = next;
            let settled = match book.reservations.get_mut(&id) {
                Some(reservation) => {
                    reservation.settle(ReservationState::Expired, now)?;
                    reservation.clone()
                }
                None => continue,
            };
            drop(book);
            self.pending_delta(false);
            self.record_settled(&settled);
            expired += 1;
        }

        if !deferred.is_empty() {
            let mut expiry = self.expiry.lock();
            for (id, at) in deferred {
                expiry.schedule(id, at.ms);
            }
        }
        if expired > 0 {
            tracing::info!(expired, "reservation sweep");
        }
        Ok(expired)
    }

    /// Units of `sku` that can be reserved now (0 for unknown SKUs).
    pub fn available(&self, sku: &str) -> u64 {
        self.book(sku).map(|b| b.lock().account.available).unwrap_or(0)
    }

    pub fn account(&self, sku: &str) -> Option<StockAccount> {
        self.book(sku).map(|b| b.lock().account)
    }

    pub fn reservation(&self, id: ReservationId) -> Option<Reservation> {
        let sku = self.sku_of(id).ok()?;
        let book = self.book(&sku)?;
        let book = book.lock();
        book.reservations.get(&id).cloned()
    }

    /// Every reservation of `sku`, oldest first.
    pub fn reservations_for(&self, sku: &str) -> Vec<Reservation> {
        let Some(book) = self.book(sku) else {
            return Vec::new();
        };
        let mut out: Vec<Reservation> = book.lock().reservations.values().cloned().collect();
        out.sort_by_key(|r| (r.created_at, r.id));
        out
    }

    pub fn skus(&self) -> Vec<String> {
        let mut skus: Vec<String> = self.books.read().keys().cloned().collect();
        skus.sort();
        skus
    }

    pub fn pending_count(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn quarantined(&self) -> Vec<String> {
        let books: Vec<(String, Arc<Mutex<SkuBook>>)> = self
            .books
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        let mut out: Vec<String> = books
            .into_iter()
            .filter(|(_, b)| b.lock().quarantine.is_some())
            .map(|(k, _)| k)
            .collect();
        out.sort();
        out
    }

    /// Operator repair: re-derive counters and lift the write ban.
    pub fn clear_quarantine(&self, sku: &str) -> CoreResult<StockAccount> {
        let book = self
            .book(sku)
            .ok_or_else(|| CoreError::not_found("sku", sku))?;
        let mut book = book.lock();
        let account = StockAccount::derive(
            sku,
            book.account.total_issued,
            book.committed_qty(),
            book.pending_qty(),
        )?;
        book.account = account;
        if let Some(reason) = book.quarantine.take() {
            tracing::warn!(sku = %sku, reason = %reason, "quarantine cleared");
        }
        Ok(account)
    }

    /// Run the expiry sweeper until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep() {
                        tracing::error!(error = %e, "reservation sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("reservation sweeper stopping");
                        return;
                    }
                }
            }
        }
    }
}

fn replay_settle(
    books: &mut HashMap<String, SkuBook>,
    sku: &str,
    id: ReservationId,
    state: ReservationState,
    at: Timestamp,
) {
    let settled = books
        .get_mut(sku)
        .and_then(|b| b.reservations.get_mut(&id))
        .map(|r| r.settle(state, at));
    match settled {
        Some(Ok(())) => {}
        Some(Err(e)) => tracing::warn!(reservation_id = %id, error = %e, "ignoring duplicate settlement in journal"),
        None => tracing::warn!(reservation_id = %id, sku = %sku, "settlement for unknown reservation in journal"),
    }
}
