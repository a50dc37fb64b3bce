//! External collaborators the checkout saga drives.
//!
//! Both seams are idempotent by contract: the gateway dedupes charges on the
//! idempotency key and refunds on the charge id, the order store dedupes on
//! the saga id. The in-process implementations honor the same contract and
//! carry fault switches used by tests and the local runtime.

use crate::core::error::{CoreError, CoreResult};
use crate::core::ids::{ChargeId, OrderId, SagaId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Charge `amount`; repeated calls with the same key return the first
    /// charge.
    async fn charge(&self, idempotency_key: &str, amount: u64, method: &str) -> CoreResult<ChargeId>;

    /// Refund a charge; repeated calls return the first refund id.
    async fn refund(&self, charge_id: ChargeId, amount: u64) -> CoreResult<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChargeRecord {
    charge_id: ChargeId,
    amount: u64,
    method: String,
    refund_id: Option<String>,
}

/// In-process gateway.
#[derive(Debug, Default)]
pub struct LocalPaymentGateway {
    charges: Mutex<HashMap<String, ChargeRecord>>,
    keys: Mutex<HashMap<ChargeId, String>>,
    declined: Mutex<HashSet<String>>,
    latency: Mutex<Duration>,
    fail_refunds: AtomicBool,
}

impl LocalPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decline every charge made with `method`.
    pub fn decline_method(&self, method: &str) {
        self.declined.lock().insert(method.to_string());
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn set_fail_refunds(&self, fail: bool) {
        self.fail_refunds.store(fail, Ordering::SeqCst);
    }

    pub fn charge_for(&self, idempotency_key: &str) -> Option<ChargeId> {
        self.charges
            .lock()
            .get(idempotency_key)
            .map(|c| c.charge_id)
    }

    pub fn is_refunded(&self, charge_id: ChargeId) -> bool {
        let Some(key) = self.keys.lock().get(&charge_id).cloned() else {
            return false;
        };
        self.charges
            .lock()
            .get(&key)
            .map(|c| c.refund_id.is_some())
            .unwrap_or(false)
    }

    /// Charges that were made and not refunded.
    pub fn settled_count(&self) -> usize {
        self.charges
            .lock()
            .values()
            .filter(|c| c.refund_id.is_none())
            .count()
    }
}

#[async_trait]
impl PaymentGateway for LocalPaymentGateway {
    async fn charge(&self, idempotency_key: &str, amount: u64, method: &str) -> CoreResult<ChargeId> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.declined.lock().contains(method) {
            return Err(CoreError::PaymentDeclined {
                reason: format!("method {method} declined"),
            });
        }
        let mut charges = self.charges.lock();
        if let Some(existing) = charges.get(idempotency_key) {
            if existing.amount != amount || existing.method != method {
                return Err(CoreError::conflict(format!(
                    "charge key {idempotency_key} reused with different terms"
                )));
            }
            return Ok(existing.charge_id);
        }
        let charge_id = ChargeId::generate();
        charges.insert(
            idempotency_key.to_string(),
            ChargeRecord {
                charge_id,
                amount,
                method: method.to_string(),
                refund_id: None,
            },
        );
        self.keys.lock().insert(charge_id, idempotency_key.to_string());
        tracing::debug!(charge_id = %charge_id, amount, "gateway charge accepted");
        Ok(charge_id)
    }

    async fn refund(&self, charge_id: ChargeId, amount: u64) -> CoreResult<String> {
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(CoreError::unavailable("gateway refunds unavailable"));
        }
        let key = self
            .keys
            .lock()
            .get(&charge_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("charge", charge_id))?;
        let mut charges = self.charges.lock();
        let record = charges
            .get_mut(&key)
            .ok_or_else(|| CoreError::not_found("charge", charge_id))?;
        if amount > record.amount {
            return Err(CoreError::invalid_input("refund exceeds charge"));
        }
        let refund_id = record
            .refund_id
            .get_or_insert_with(|| format!("rf_{}", charge_id.as_uuid().simple()))
            .clone();
        Ok(refund_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    pub saga_id: SagaId,
    pub order_id: OrderId,
    pub user_id: String,
    pub sku: String,
    pub qty: u64,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: OrderId,
    pub saga_id: SagaId,
    pub user_id: String,
    pub sku: String,
    pub qty: u64,
    pub amount: u64,
    pub status: OrderStatus,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Create the order for a saga; a second call for the same saga returns
    /// the existing record.
    async fn create(&self, order: NewOrder) -> CoreResult<OrderRecord>;

    /// Cancel an order; cancelling twice is a no-op.
    async fn cancel(&self, order_id: OrderId) -> CoreResult<()>;

    async fn get(&self, order_id: OrderId) -> CoreResult<Option<OrderRecord>>;
}

#[derive(Debug, Default)]
struct OrderTables {
    orders: HashMap<OrderId, OrderRecord>,
    by_saga: HashMap<SagaId, OrderId>,
}

/// In-process order store.
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    tables: Mutex<OrderTables>,
    fail_creates: AtomicBool,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn for_saga(&self, saga_id: SagaId) -> Option<OrderRecord> {
        let tables = self.tables.lock();
        tables
            .by_saga
            .get(&saga_id)
            .and_then(|id| tables.orders.get(id))
            .cloned()
    }

    /// Orders currently in `created`.
    pub fn live_count(&self) -> usize {
        self.tables
            .lock()
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Created)
            .count()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create(&self, order: NewOrder) -> CoreResult<OrderRecord> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(CoreError::unavailable("order store unavailable"));
        }
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.by_saga.get(&order.saga_id) {
            if let Some(record) = tables.orders.get(existing) {
                return Ok(record.clone());
            }
        }
        let record = OrderRecord {
            order_id: order.order_id,
            saga_id: order.saga_id,
            user_id: order.user_id,
            sku: order.sku,
            qty: order.qty,
            amount: order.amount,
            status: OrderStatus::Created,
        };
        tables.by_saga.insert(record.saga_id, record.order_id);
        tables.orders.insert(record.order_id, record.clone());
        Ok(record)
    }

    async fn cancel(&self, order_id: OrderId) -> CoreResult<()> {
        let mut tables = self.tables.lock();
        let record = tables
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| CoreError::not_found("order", order_id))?;
        record.status = OrderStatus::Cancelled;
        Ok(())
    }

    async fn get(&self, order_id: OrderId) -> CoreResult<Option<OrderRecord>> {
        Ok(self.tables.lock().orders.get(&order_id).cloned())
    }
}
