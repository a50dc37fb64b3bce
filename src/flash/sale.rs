//! Flash sales, their lifecycle and per-user purchase counters.
//!
//! ```text
//! scheduled ──at start──▶ active ──sold_qty = total_qty──▶ sold_out
//!                           │                                  │
//!                           └──────at end──▶ ended ◀───────────┘
//! ```
//!
//! Lifecycle transitions are applied by the single scheduler task;
//! `sold_out` is evaluated after each confirmed purchase.

use crate::core::error::{CoreError, CoreResult};
use crate::core::ids::{OrderId, ReservationId, SaleId};
use crate::core::time::Timestamp;
use crate::storage::Journal;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaleState {
    Scheduled,
    Active,
    Ended,
    SoldOut,
}

impl SaleState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::SoldOut => "sold_out",
        }
    }
}

impl std::fmt::Display for SaleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a new sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFlashSale {
    pub sku: String,
    pub original_price: u64,
    pub sale_price: u64,
    pub total_qty: u64,
    pub max_per_user: u32,
    pub start: Timestamp,
    pub end: Timestamp,
}

impl NewFlashSale {
    pub fn validate(&self) -> CoreResult<()> {
        if self.sku.is_empty() {
            return Err(CoreError::invalid_input("sale sku must not be empty"));
        }
        if self.total_qty == 0 {
            return Err(CoreError::invalid_input("sale total_qty must be > 0"));
        }
        if self.max_per_user == 0 {
            return Err(CoreError::invalid_input("sale max_per_user must be > 0"));
        }
        if !self.start.is_before(self.end) {
            return Err(CoreError::invalid_input("sale start must precede end"));
        }
        if self.sale_price > self.original_price {
            return Err(CoreError::invalid_input(
                "sale_price cannot exceed original_price",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashSale {
    pub id: SaleId,
    pub sku: String,
    pub original_price: u64,
    pub sale_price: u64,
    pub total_qty: u64,
    /// Units confirmed; never exceeds `total_qty`.
    pub sold_qty: u64,
    pub max_per_user: u32,
    pub start: Timestamp,
    pub end: Timestamp,
    pub state: SaleState,
}

impl FlashSale {
    pub fn from_params(id: SaleId, params: NewFlashSale) -> Self {
        Self {
            id,
            sku: params.sku,
            original_price: params.original_price,
            sale_price: params.sale_price,
            total_qty: params.total_qty,
            sold_qty: 0,
            max_per_user: params.max_per_user,
            start: params.start,
            end: params.end,
            state: SaleState::Scheduled,
        }
    }

    /// Ledger key holding this sale's dedicated stock.
    pub fn stock_key(&self) -> String {
        format!("{}@{}", self.sku, self.id)
    }

    /// Clock-driven transition due at `now`, if any.
    pub fn due_transition(&self, now: Timestamp) -> Option<SaleState> {
        match self.state {
            SaleState::Scheduled if now.is_at_or_after(self.end) => Some(SaleState::Ended),
            SaleState::Scheduled if now.is_at_or_after(self.start) => Some(SaleState::Active),
            SaleState::Active | SaleState::SoldOut if now.is_at_or_after(self.end) => {
                Some(SaleState::Ended)
            }
            _ => None,
        }
    }

    /// Reject purchases unless the sale is active and inside its window.
    pub fn ensure_open(&self, now: Timestamp) -> CoreResult<()> {
        match self.state {
            SaleState::SoldOut => Err(CoreError::SoldOut {
                sale_id: self.id.to_string(),
            }),
            SaleState::Active if now.is_before(self.end) => Ok(()),
            SaleState::Active => Err(CoreError::NotActive {
                sale_id: self.id.to_string(),
                state: SaleState::Ended.to_string(),
            }),
            state => Err(CoreError::NotActive {
                sale_id: self.id.to_string(),
                state: state.to_string(),
            }),
        }
    }

    pub fn remaining(&self) -> u64 {
        self.total_qty.saturating_sub(self.sold_qty)
    }
}

/// Journal records of `flash.wal`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlashRecord {
    SaleCreated {
        sale: FlashSale,
    },
    StateChanged {
        sale_id: SaleId,
        state: SaleState,
        at: Timestamp,
    },
    /// A hold was granted; it counts against the user's cap while pending.
    Admitted {
        sale_id: SaleId,
        user_id: String,
        reservation_id: ReservationId,
        qty: u64,
    },
    /// A checkout took the hold over; nobody else may confirm it.
    Claimed {
        sale_id: SaleId,
        reservation_id: ReservationId,
        claimant: String,
        at: Timestamp,
    },
    Purchased {
        sale_id: SaleId,
        user_id: String,
        reservation_id: ReservationId,
        qty: u64,
        order_id: OrderId,
        at: Timestamp,
    },
}

/// Admission bookkeeping for one reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    pub sale_id: SaleId,
    pub user_id: String,
    pub reservation_id: ReservationId,
    pub qty: u64,
    pub order_id: Option<OrderId>,
    /// Checkout that owns the hold, if any.
    pub claimed_by: Option<String>,
}

/// One sale plus its per-user counters, serialized by its own mutex.
#[derive(Debug)]
pub struct SaleEntry {
    pub sale: FlashSale,
    /// Confirmed units per user.
    purchased: HashMap<String, u64>,
    /// Unconfirmed holds per user.
    holds: HashMap<String, Vec<(ReservationId, u64)>>,
}

impl SaleEntry {
    fn new(sale: FlashSale) -> Self {
        Self {
            sale,
            purchased: HashMap::new(),
            holds: HashMap::new(),
        }
    }

    pub fn purchased(&self, user_id: &str) -> u64 {
        self.purchased.get(user_id).copied().unwrap_or(0)
    }

    /// Units counted against `user_id`'s cap: purchases plus holds for which
    /// `still_pending` answers true. Holds that left pending are forgotten.
    pub fn committed_to_user(
        &mut self,
        user_id: &str,
        still_pending: impl Fn(ReservationId) -> bool,
    ) -> u64 {
        let mut held = 0;
        if let Some(holds) = self.holds.get_mut(user_id) {
            holds.retain(|(id, _)| still_pending(*id));
            held = holds.iter().map(|(_, qty)| qty).sum();
            if holds.is_empty() {
                self.holds.remove(user_id);
            }
        }
        self.purchased(user_id) + held
    }

    fn add_hold(&mut self, user_id: &str, reservation_id: ReservationId, qty: u64) {
        self.holds
            .entry(user_id.to_string())
            .or_default()
            .push((reservation_id, qty));
    }

    /// Move a hold into the purchased counter. Returns true when the sale
    /// just sold out.
    fn record_purchase(&mut self, user_id: &str, reservation_id: ReservationId, qty: u64) -> bool {
        if let Some(holds) = self.holds.get_mut(user_id) {
            holds.retain(|(id, _)| *id != reservation_id);
            if holds.is_empty() {
                self.holds.remove(user_id);
            }
        }
        *self.purchased.entry(user_id.to_string()).or_insert(0) += qty;
        self.sale.sold_qty = self.sale.sold_qty.saturating_add(qty);
        self.sale.sold_qty >= self.sale.total_qty && self.sale.state == SaleState::Active
    }
}

/// Every flash sale, with durable counters.
pub struct FlashSaleBook {
    sales: RwLock<HashMap<SaleId, Arc<Mutex<SaleEntry>>>>,
    admissions: RwLock<HashMap<ReservationId, Admission>>,
    journal: Journal<FlashRecord>,
}

impl FlashSaleBook {
    pub fn open(journal: Journal<FlashRecord>) -> CoreResult<Self> {
        let mut sales: HashMap<SaleId, SaleEntry> = HashMap::new();
        let mut admissions: HashMap<ReservationId, Admission> = HashMap::new();
        let entries = journal.replay()?;
        let records = entries.len();

        for entry in entries {
            match entry.record {
                FlashRecord::SaleCreated { sale } => {
                    sales.insert(sale.id, SaleEntry::new(sale));
                }
                FlashRecord::StateChanged { sale_id, state, .. } => {
                    if let Some(entry) = sales.get_mut(&sale_id) {
                        entry.sale.state = state;
                    }
                }
                FlashRecord::Admitted {
                    sale_id,
                    user_id,
                    reservation_id,
                    qty,
                } => {
                    if let Some(entry) = sales.get_mut(&sale_id) {
                        entry.add_hold(&user_id, reservation_id, qty);
                    }
                    admissions.insert(
                        reservation_id,
                        Admission {
                            sale_id,
                            user_id,
                            reservation_id,
                            qty,
                            order_id: None,
                            claimed_by: None,
                        },
                    );
                }
                FlashRecord::Claimed {
                    reservation_id,
                    claimant,
                    ..
                } => {
                    if let Some(admission) = admissions.get_mut(&reservation_id) {
                        admission.claimed_by = Some(claimant);
                    }
                }
                FlashRecord::Purchased {
                    sale_id,
                    user_id,
                    reservation_id,
                    qty,
                    order_id,
                    ..
                } => {
                    if let Some(entry) = sales.get_mut(&sale_id) {
                        entry.record_purchase(&user_id, reservation_id, qty);
                    }
                    if let Some(admission) = admissions.get_mut(&reservation_id) {
                        admission.order_id = Some(order_id);
                    }
                }
            }
        }

        tracing::info!(records, sales = sales.len(), "flash sale book replayed");
        Ok(Self {
            sales: RwLock::new(
                sales
                    .into_iter()
                    .map(|(id, e)| (id, Arc::new(Mutex::new(e))))
                    .collect(),
            ),
            admissions: RwLock::new(admissions),
            journal,
        })
    }

    pub fn create(&self, sale: FlashSale) -> CoreResult<FlashSale> {
        if self.sales.read().contains_key(&sale.id) {
            return Err(CoreError::conflict(format!("sale {} already exists", sale.id)));
        }
        self.journal.append(&FlashRecord::SaleCreated { sale: sale.clone() })?;
        self.sales
            .write()
            .insert(sale.id, Arc::new(Mutex::new(SaleEntry::new(sale.clone()))));
        Ok(sale)
    }

    pub fn entry(&self, sale_id: SaleId) -> CoreResult<Arc<Mutex<SaleEntry>>> {
        self.sales
            .read()
            .get(&sale_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("sale", sale_id))
    }

    pub fn get(&self, sale_id: SaleId) -> Option<FlashSale> {
        self.entry(sale_id).ok().map(|e| e.lock().sale.clone())
    }

    /// Sales ordered by start time, optionally filtered by state.
    pub fn list(&self, state: Option<SaleState>) -> Vec<FlashSale> {
        let entries: Vec<Arc<Mutex<SaleEntry>>> = self.sales.read().values().cloned().collect();
        let mut sales: Vec<FlashSale> = entries
            .iter()
            .map(|e| e.lock().sale.clone())
            .filter(|s| state.map_or(true, |st| s.state == st))
            .collect();
        sales.sort_by_key(|s| (s.start, s.id));
        sales
    }

    /// Durably change a sale's state while its entry is locked.
    pub fn set_state(&self, entry: &mut SaleEntry, state: SaleState, at: Timestamp) -> CoreResult<()> {
        if entry.sale.state == state {
            return Ok(());
        }
        self.journal.append(&FlashRecord::StateChanged {
            sale_id: entry.sale.id,
            state,
            at,
        })?;
        tracing::info!(
            sale_id = %entry.sale.id,
            from = %entry.sale.state,
            to = %state,
            sold_qty = entry.sale.sold_qty,
            "flash sale state changed"
        );
        entry.sale.state = state;
        Ok(())
    }

    /// Record a granted hold while the entry is locked.
    pub fn admit(
        &self,
        entry: &mut SaleEntry,
        user_id: &str,
        reservation_id: ReservationId,
        qty: u64,
    ) -> CoreResult<()> {
        let sale_id = entry.sale.id;
        self.journal.append(&FlashRecord::Admitted {
            sale_id,
            user_id: user_id.to_string(),
            reservation_id,
            qty,
        })?;
        entry.add_hold(user_id, reservation_id, qty);
        self.admissions.write().insert(
            reservation_id,
            Admission {
                sale_id,
                user_id: user_id.to_string(),
                reservation_id,
                qty,
                order_id: None,
                claimed_by: None,
            },
        );
        Ok(())
    }

    /// Record `claimant` as the owner of a hold while the entry is locked.
    pub fn claim(
        &self,
        entry: &mut SaleEntry,
        reservation_id: ReservationId,
        claimant: &str,
        at: Timestamp,
    ) -> CoreResult<()> {
        self.journal.append(&FlashRecord::Claimed {
            sale_id: entry.sale.id,
            reservation_id,
            claimant: claimant.to_string(),
            at,
        })?;
        if let Some(a) = self.admissions.write().get_mut(&reservation_id) {
            a.claimed_by = Some(claimant.to_string());
        }
        Ok(())
    }

    /// Record a confirmed purchase while the entry is locked. Returns true
    /// when the sale just sold out.
    pub fn purchase(
        &self,
        entry: &mut SaleEntry,
        admission: &Admission,
        order_id: OrderId,
        at: Timestamp,
    ) -> CoreResult<bool> {
        self.journal.append(&FlashRecord::Purchased {
            sale_id: admission.sale_id,
            user_id: admission.user_id.clone(),
            reservation_id: admission.reservation_id,
            qty: admission.qty,
            order_id,
            at,
        })?;
        let sold_out = entry.record_purchase(&admission.user_id, admission.reservation_id, admission.qty);
        if let Some(a) = self.admissions.write().get_mut(&admission.reservation_id) {
            a.order_id = Some(order_id);
        }
        Ok(sold_out)
    }

    pub fn admission(&self, reservation_id: ReservationId) -> Option<Admission> {
        self.admissions.read().get(&reservation_id).cloned()
    }

    pub fn sale_ids(&self) -> Vec<SaleId> {
        self.sales.read().keys().copied().collect()
    }
}
