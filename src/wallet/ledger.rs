//! Wallet and escrow ledger.
//!
//! # Optimistic concurrency
//!
//! Each `(user, currency)` wallet lives in its own cell: balance, txn log,
//! holds and quarantine flag behind one mutex. A mutation reads what it
//! needs without holding any cell, computes successors, then commits
//! through `compare_and_commit`, which locks only the touched cells (in key
//! order), checks every wallet still has the version that was read and
//! every hold the state that was read, appends one journal record, and
//! installs balances, txns and holds together. A moved version sends the
//! mutation around again, up to `cas_max_attempts` times, before surfacing
//! `conflict`. Unrelated wallets never wait on each other.
//!
//! The journal record of one commit carries the balances and their
//! transactions, so a balance never becomes durable without its txn.

use crate::core::config::WalletConfig;
use crate::core::error::{CoreError, CoreResult};
use crate::core::ids::{HoldId, TxnId};
use crate::core::time::{SharedClock, Timestamp};
use crate::ops::observability::{metrics, SharedMetrics};
use crate::storage::Journal;
use crate::wallet::model::{
    Balance, Hold, HoldState, Reconciliation, ReleaseTarget, TxnKind, Wallet, WalletKey, WalletTxn,
};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Journal records of `wallet.wal`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletRecord {
    /// One atomic unit: new balances, their txns and hold changes.
    Commit {
        wallets: Vec<(WalletKey, Wallet)>,
        txns: Vec<WalletTxn>,
        holds: Vec<Hold>,
    },
}

/// State of one wallet.
#[derive(Debug, Default)]
struct WalletCell {
    wallet: Wallet,
    txns: Vec<WalletTxn>,
    /// Holds drawn on this wallet.
    holds: HashMap<HoldId, Hold>,
    quarantine: Option<String>,
}

/// A planned atomic unit.
#[derive(Debug, Default)]
struct Mutation {
    /// `(key, version read, successor)`.
    wallets: Vec<(WalletKey, u64, Wallet)>,
    txns: Vec<WalletTxn>,
    /// `(state read, successor)`; `None` for a new hold.
    holds: Vec<(Option<HoldState>, Hold)>,
}

enum Plan<T> {
    Commit(Mutation, T),
    /// Nothing to write (idempotent replay of an earlier request).
    Done(T),
}

enum CasFailure {
    Moved,
    Failed(CoreError),
}

/// Per-user balances with escrow holds.
pub struct WalletLedger {
    cells: RwLock<HashMap<WalletKey, Arc<Mutex<WalletCell>>>>,
    /// Which wallet each hold is drawn on.
    hold_index: RwLock<HashMap<HoldId, WalletKey>>,
    holds_by_ref: RwLock<HashMap<String, HoldId>>,
    journal: Journal<WalletRecord>,
    clock: SharedClock,
    metrics: SharedMetrics,
    cas_max_attempts: u32,
}

impl WalletLedger {
    pub fn open(
        journal: Journal<WalletRecord>,
        clock: SharedClock,
        metrics: SharedMetrics,
        config: &WalletConfig,
    ) -> CoreResult<Self> {
        let mut cells: HashMap<WalletKey, WalletCell> = HashMap::new();
        let mut hold_index: HashMap<HoldId, WalletKey> = HashMap::new();
        let mut holds_by_ref: HashMap<String, HoldId> = HashMap::new();
        let entries = journal.replay()?;
        let records = entries.len();
        for entry in entries {
            match entry.record {
                WalletRecord::Commit {
                    wallets,
                    txns,
                    holds,
                } => {
                    for (key, wallet) in wallets {
                        cells.entry(key).or_default().wallet = wallet;
                    }
                    for txn in txns {
                        cells.entry(txn.wallet.clone()).or_default().txns.push(txn);
                    }
                    for hold in holds {
                        if !hold.reference.is_empty() {
                            holds_by_ref.insert(hold.reference.clone(), hold.id);
                        }
                        hold_index.insert(hold.id, hold.wallet.clone());
                        cells
                            .entry(hold.wallet.clone())
                            .or_default()
                            .holds
                            .insert(hold.id, hold);
                    }
                }
            }
        }
        let open_holds: usize = cells
            .values()
            .map(|c| c.holds.values().filter(|h| h.is_open()).count())
            .sum();
        tracing::info!(records, wallets = cells.len(), open_holds, "wallet ledger replayed");
        Ok(Self {
            cells: RwLock::new(
                cells
                    .into_iter()
                    .map(|(key, cell)| (key, Arc::new(Mutex::new(cell))))
                    .collect(),
            ),
            hold_index: RwLock::new(hold_index),
            holds_by_ref: RwLock::new(holds_by_ref),
            journal,
            clock,
            metrics,
            cas_max_attempts: config.cas_max_attempts.max(1),
        })
    }

    fn cell(&self, key: &WalletKey) -> Option<Arc<Mutex<WalletCell>>> {
        self.cells.read().get(key).cloned()
    }

    fn cell_or_create(&self, key: &WalletKey) -> Arc<Mutex<WalletCell>> {
        if let Some(cell) = self.cell(key) {
            return cell;
        }
        self.cells.write().entry(key.clone()).or_default().clone()
    }

    /// Committed state of a wallet; untouched wallets read as zero.
    fn read_wallet(&self, key: &WalletKey) -> Wallet {
        self.cell(key).map(|c| c.lock().wallet).unwrap_or_default()
    }

    fn read_hold(&self, hold_id: HoldId) -> Option<Hold> {
        let key = self.hold_index.read().get(&hold_id).cloned()?;
        let cell = self.cell(&key)?;
        let hold = cell.lock().holds.get(&hold_id).cloned();
        hold
    }

    fn read_hold_by_ref(&self, reference: &str) -> Option<Hold> {
        let hold_id = self.holds_by_ref.read().get(reference).copied()?;
        self.read_hold(hold_id)
    }

    fn txn(&self, wallet: &WalletKey, kind: TxnKind, amount: u64, reference: &str, now: Timestamp) -> WalletTxn {
        WalletTxn {
            id: TxnId::generate(),
            wallet: wallet.clone(),
            kind,
            amount,
            reference: reference.to_string(),
            created_at: now,
        }
    }

    /// Run `plan` under optimistic CAS with bounded retries.
    fn mutate<T>(
        &self,
        operation: &'static str,
        mut plan: impl FnMut(Timestamp) -> CoreResult<Plan<T>>,
    ) -> CoreResult<T> {
        for attempt in 1..=self.cas_max_attempts {
            let now = self.clock.now();
            let (mutation, out) = match plan(now) {
                Ok(Plan::Commit(mutation, out)) => (mutation, out),
                Ok(Plan::Done(out)) => return Ok(out),
                Err(e) => return Err(self.on_failure(e)),
            };
            match self.compare_and_commit(mutation) {
                Ok(()) => {
                    self.metrics.counter_inc(metrics::WALLET_MUTATIONS_TOTAL);
                    return Ok(out);
                }
                Err(CasFailure::Moved) => {
                    self.metrics.counter_inc(metrics::WALLET_CAS_CONFLICTS_TOTAL);
                    tracing::trace!(operation, attempt, "wallet version moved; retrying");
                }
                Err(CasFailure::Failed(e)) => return Err(self.on_failure(e)),
            }
        }
        tracing::debug!(operation, attempts = self.cas_max_attempts, "wallet CAS retries exhausted");
        Err(CoreError::conflict(format!(
            "{} lost {} optimistic attempts",
            operation, self.cas_max_attempts
        )))
    }

    fn on_failure(&self, err: CoreError) -> CoreError {
        if let CoreError::InvariantViolation { key, detail } = &err {
            let hit: Vec<(WalletKey, Arc<Mutex<WalletCell>>)> = self
                .cells
                .read()
                .iter()
                .filter(|(k, _)| k.to_string() == *key)
                .map(|(k, c)| (k.clone(), Arc::clone(c)))
                .collect();
            for (k, cell) in hit {
                tracing::error!(wallet = %k, detail = %detail, "wallet invariant violated; quarantining");
                cell.lock().quarantine = Some(detail.clone());
            }
        }
        err
    }

    fn compare_and_commit(&self, mutation: Mutation) -> Result<(), CasFailure> {
        // Key order is the lock order.
        let touched: BTreeMap<WalletKey, Arc<Mutex<WalletCell>>> = mutation
            .wallets
            .iter()
            .map(|(key, _, _)| (key.clone(), self.cell_or_create(key)))
            .collect();
        let mut guards: BTreeMap<WalletKey, MutexGuard<'_, WalletCell>> = touched
            .iter()
            .map(|(key, cell)| (key.clone(), cell.lock()))
            .collect();

        for (key, read_version, next) in &mutation.wallets {
            let Some(cell) = guards.get(key) else {
                return Err(CasFailure::Failed(CoreError::internal("wallet cell not locked")));
            };
            if cell.quarantine.is_some() {
                return Err(CasFailure::Failed(CoreError::Quarantined {
                    key: key.to_string(),
                }));
            }
            if cell.wallet.version != *read_version {
                return Err(CasFailure::Moved);
            }
            if next.version != read_version + 1 {
                return Err(CasFailure::Failed(CoreError::internal(format!(
                    "wallet {} version must advance by one",
                    key
                ))));
            }
        }
        for (read_state, hold) in &mutation.holds {
            let Some(cell) = guards.get(&hold.wallet) else {
                return Err(CasFailure::Failed(CoreError::internal(format!(
                    "hold {} changed without its wallet",
                    hold.id
                ))));
            };
            if cell.holds.get(&hold.id).map(|h| &h.state) != read_state.as_ref() {
                return Err(CasFailure::Moved);
            }
        }

        // Claim new references before the append; a concurrent hold under
        // the same reference on another wallet sees them taken.
        let mut claimed: Vec<&str> = Vec::new();
        {
            let mut by_ref = self.holds_by_ref.write();
            for (read_state, hold) in &mutation.holds {
                if read_state.is_some() || hold.reference.is_empty() {
                    continue;
                }
                if by_ref.contains_key(&hold.reference) {
                    for reference in &claimed {
                        by_ref.remove(*reference);
                    }
                    return Err(CasFailure::Moved);
                }
                by_ref.insert(hold.reference.clone(), hold.id);
                claimed.push(&hold.reference);
            }
        }

        let record = WalletRecord::Commit {
            wallets: mutation
                .wallets
                .iter()
                .map(|(k, _, w)| (k.clone(), *w))
                .collect(),
            txns: mutation.txns.clone(),
            holds: mutation.holds.iter().map(|(_, h)| h.clone()).collect(),
        };
        if let Err(e) = self.journal.append(&record) {
            let mut by_ref = self.holds_by_ref.write();
            for reference in &claimed {
                by_ref.remove(*reference);
            }
            return Err(CasFailure::Failed(e));
        }

        for (key, _, next) in mutation.wallets {
            if let Some(cell) = guards.get_mut(&key) {
                cell.wallet = next;
            }
        }
        for txn in mutation.txns {
            if let Some(cell) = guards.get_mut(&txn.wallet) {
                cell.txns.push(txn);
            }
        }
        let mut hold_index = self.hold_index.write();
        for (_, hold) in mutation.holds {
            hold_index.insert(hold.id, hold.wallet.clone());
            if let Some(cell) = guards.get_mut(&hold.wallet) {
                cell.holds.insert(hold.id, hold);
            }
        }
        Ok(())
    }

    /// Credit `amount` to available.
    pub fn deposit(&self, user_id: &str, currency: &str, amount: u64) -> CoreResult<Balance> {
        let key = validated_key(user_id, currency, amount)?;
        let balance = self.mutate("deposit", |now| {
            let current = self.read_wallet(&key);
            let next = Wallet {
                available: current
                    .available
                    .checked_add(amount)
                    .ok_or_else(|| CoreError::invalid_input("deposit overflows balance"))?,
                version: current.version + 1,
                ..current
            };
            let mutation = Mutation {
                wallets: vec![(key.clone(), current.version, next)],
                txns: vec![self.txn(&key, TxnKind::Deposit, amount, "", now)],
                holds: Vec::new(),
            };
            Ok(Plan::Commit(mutation, Balance::from(next)))
        })?;
        tracing::debug!(wallet = %key, amount, available = balance.available, "deposit");
        Ok(balance)
    }

    /// Debit `amount` from available.
    pub fn withdraw(&self, user_id: &str, currency: &str, amount: u64) -> CoreResult<Balance> {
        let key = validated_key(user_id, currency, amount)?;
        let balance = self.mutate("withdraw", |now| {
            let current = self.read_wallet(&key);
            if current.available < amount {
                return Err(CoreError::InsufficientFunds {
                    requested: amount,
                    available: current.available,
                });
            }
            let next = Wallet {
                available: current.available - amount,
                version: current.version + 1,
                ..current
            };
            let mutation = Mutation {
                wallets: vec![(key.clone(), current.version, next)],
                txns: vec![self.txn(&key, TxnKind::Withdraw, amount, "", now)],
                holds: Vec::new(),
            };
            Ok(Plan::Commit(mutation, Balance::from(next)))
        })?;
        tracing::debug!(wallet = %key, amount, available = balance.available, "withdraw");
        Ok(balance)
    }

    /// Move `amount` from available to held under `reference`.
    ///
    /// A non-empty `reference` makes the call idempotent: repeating it
    /// returns the hold created the first time.
    pub fn hold(&self, user_id: &str, currency: &str, amount: u64, reference: &str) -> CoreResult<HoldId> {
        let key = validated_key(user_id, currency, amount)?;
        self.mutate("hold", |now| {
            if !reference.is_empty() {
                if let Some(existing) = self.read_hold_by_ref(reference) {
                    if existing.wallet != key || existing.amount != amount {
                        return Err(CoreError::conflict(format!(
                            "hold reference {} already used for a different hold",
                            reference
                        )));
                    }
                    return Ok(Plan::Done(existing.id));
                }
            }

            let current = self.read_wallet(&key);
            if current.available < amount {
                return Err(CoreError::InsufficientFunds {
                    requested: amount,
                    available: current.available,
                });
            }
            let held = current
                .held
                .checked_add(amount)
                .ok_or_else(|| CoreError::invalid_input("hold overflows held balance"))?;
            let next = Wallet {
                available: current.available - amount,
                held,
                version: current.version + 1,
            };
            let hold = Hold {
                id: HoldId::generate(),
                wallet: key.clone(),
                amount,
                reference: reference.to_string(),
                state: HoldState::Open,
                created_at: now,
            };
            let hold_id = hold.id;
            let mutation = Mutation {
                wallets: vec![(key.clone(), current.version, next)],
                txns: vec![self.txn(&key, TxnKind::Hold, amount, &hold_id.to_string(), now)],
                holds: vec![(None, hold)],
            };
            Ok(Plan::Commit(mutation, hold_id))
        })
    }

    /// Release an open hold to the holder or to a payee.
    pub fn release(&self, hold_id: HoldId, target: ReleaseTarget) -> CoreResult<Hold> {
        let released = self.mutate("release", |now| {
            let hold = self
                .read_hold(hold_id)
                .ok_or_else(|| CoreError::not_found("hold", hold_id))?;
            if !hold.is_open() {
                return Err(CoreError::terminal("hold", hold_id, hold.state.as_str()));
            }

            let key = hold.wallet.clone();
            let current = self.read_wallet(&key);
            let held = current.held.checked_sub(hold.amount).ok_or_else(|| {
                CoreError::InvariantViolation {
                    key: key.to_string(),
                    detail: format!(
                        "held {} below open hold {} of {}",
                        current.held, hold_id, hold.amount
                    ),
                }
            })?;
            let reference = hold_id.to_string();
            let mut mutation = Mutation::default();
            let mut next = Wallet {
                held,
                version: current.version + 1,
                ..current
            };

            let next_state = match &target {
                ReleaseTarget::ToUser => {
                    next.available = current
                        .available
                        .checked_add(hold.amount)
                        .ok_or_else(|| CoreError::invalid_input("release overflows balance"))?;
                    mutation
                        .txns
                        .push(self.txn(&key, TxnKind::ReleaseToUser, hold.amount, &reference, now));
                    mutation.wallets.push((key.clone(), current.version, next));
                    HoldState::ReleasedToUser
                }
                ReleaseTarget::ToPayee { payee_user_id } => {
                    if payee_user_id.is_empty() {
                        return Err(CoreError::invalid_input("payee must not be empty"));
                    }
                    let payee = WalletKey::new(payee_user_id.clone(), key.currency.clone());
                    mutation
                        .txns
                        .push(self.txn(&key, TxnKind::ReleaseToPayee, hold.amount, &reference, now));
                    if payee == key {
                        next.available = next
                            .available
                            .checked_add(hold.amount)
                            .ok_or_else(|| CoreError::invalid_input("release overflows balance"))?;
                        mutation.wallets.push((key.clone(), current.version, next));
                    } else {
                        let payee_current = self.read_wallet(&payee);
                        let payee_next = Wallet {
                            available: payee_current
                                .available
                                .checked_add(hold.amount)
                                .ok_or_else(|| CoreError::invalid_input("payee balance overflow"))?,
                            version: payee_current.version + 1,
                            ..payee_current
                        };
                        mutation.wallets.push((key.clone(), current.version, next));
                        mutation
                            .wallets
                            .push((payee.clone(), payee_current.version, payee_next));
                    }
                    mutation
                        .txns
                        .push(self.txn(&payee, TxnKind::Deposit, hold.amount, &reference, now));
                    HoldState::ReleasedToPayee {
                        payee_user_id: payee_user_id.clone(),
                    }
                }
            };

            let mut settled = hold;
            settled.state = next_state;
            mutation.holds.push((Some(HoldState::Open), settled.clone()));
            Ok(Plan::Commit(mutation, settled))
        })?;
        tracing::debug!(
            hold_id = %hold_id,
            wallet = %released.wallet,
            amount = released.amount,
            state = released.state.as_str(),
            "hold released"
        );
        Ok(released)
    }

    /// Current balance; untouched wallets read as zero at version 0.
    pub fn balance(&self, user_id: &str, currency: &str) -> Balance {
        let key = WalletKey::new(user_id, currency);
        Balance::from(self.read_wallet(&key))
    }

    pub fn get_hold(&self, hold_id: HoldId) -> Option<Hold> {
        self.read_hold(hold_id)
    }

    pub fn hold_by_ref(&self, reference: &str) -> Option<Hold> {
        self.read_hold_by_ref(reference)
    }

    /// Transactions of one wallet in append order.
    pub fn txns_for(&self, user_id: &str, currency: &str) -> Vec<WalletTxn> {
        let key = WalletKey::new(user_id, currency);
        self.cell(&key)
            .map(|c| c.lock().txns.clone())
            .unwrap_or_default()
    }

    /// Recompute a wallet's balances from its transaction log.
    pub fn reconcile(&self, user_id: &str, currency: &str) -> Reconciliation {
        let key = WalletKey::new(user_id, currency);
        let Some(cell) = self.cell(&key) else {
            return Reconciliation {
                recorded: Balance::from(Wallet::default()),
                computed_available: 0,
                computed_held: 0,
                txn_count: 0,
            };
        };
        let cell = cell.lock();
        let recorded = Balance::from(cell.wallet);
        let txns = cell.txns.as_slice();

        let mut available: i128 = 0;
        let mut held: i128 = 0;
        for txn in txns {
            let amount = i128::from(txn.amount);
            match txn.kind {
                TxnKind::Deposit => available += amount,
                TxnKind::Withdraw => available -= amount,
                TxnKind::Hold => {
                    available -= amount;
                    held += amount;
                }
                TxnKind::ReleaseToUser => {
                    available += amount;
                    held -= amount;
                }
                TxnKind::ReleaseToPayee => held -= amount,
            }
        }
        Reconciliation {
            recorded,
            computed_available: available,
            computed_held: held,
            txn_count: txns.len(),
        }
    }

    pub fn quarantined(&self) -> Vec<WalletKey> {
        let mut keys: Vec<WalletKey> = self
            .cells
            .read()
            .iter()
            .filter(|(_, cell)| cell.lock().quarantine.is_some())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Lift a quarantine once the wallet reconciles against its log.
    pub fn clear_quarantine(&self, user_id: &str, currency: &str) -> CoreResult<()> {
        let key = WalletKey::new(user_id, currency);
        let reconciliation = self.reconcile(user_id, currency);
        if !reconciliation.matches() {
            return Err(CoreError::InvariantViolation {
                key: key.to_string(),
                detail: format!(
                    "log says available {} held {}, record says {} / {}",
                    reconciliation.computed_available,
                    reconciliation.computed_held,
                    reconciliation.recorded.available,
                    reconciliation.recorded.held
                ),
            });
        }
        let Some(cell) = self.cell(&key) else {
            return Ok(());
        };
        let lifted = cell.lock().quarantine.take();
        if let Some(reason) = lifted {
            tracing::warn!(wallet = %key, reason = %reason, "wallet quarantine cleared");
        }
        Ok(())
    }
}

fn validated_key(user_id: &str, currency: &str, amount: u64) -> CoreResult<WalletKey> {
    if user_id.is_empty() || currency.is_empty() {
        return Err(CoreError::invalid_input("user and currency are required"));
    }
    if amount == 0 {
        return Err(CoreError::invalid_input("amount must be > 0"));
    }
    Ok(WalletKey::new(user_id, currency))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::ManualClock;
    use crate::ops::observability::MetricsRegistry;

    fn ledger() -> WalletLedger {
        WalletLedger::open(
            Journal::in_memory("wallet"),
            ManualClock::new(0),
            MetricsRegistry::shared(),
            &WalletConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn hold_reference_is_idempotent() {
        let wallets = ledger();
        wallets.deposit("u", "EUR", 10).unwrap();
        let a = wallets.hold("u", "EUR", 4, "saga-1").unwrap();
        let b = wallets.hold("u", "EUR", 4, "saga-1").unwrap();
        assert_eq!(a, b);
        assert_eq!(wallets.balance("u", "EUR").held, 4);
        assert!(matches!(
            wallets.hold("u", "EUR", 5, "saga-1"),
            Err(CoreError::Conflict { .. })
        ));
    }

    #[test]
    fn release_to_self_as_payee_nets_out() {
        let wallets = ledger();
        wallets.deposit("u", "EUR", 10).unwrap();
        let hold = wallets.hold("u", "EUR", 3, "").unwrap();
        wallets
            .release(
                hold,
                ReleaseTarget::ToPayee {
                    payee_user_id: "u".into(),
                },
            )
            .unwrap();
        let balance = wallets.balance("u", "EUR");
        assert_eq!((balance.available, balance.held), (10, 0));
        assert_eq!(balance.version, 3);
        assert!(wallets.reconcile("u", "EUR").matches());
    }

    #[test]
    fn zero_amounts_are_rejected() {
        let wallets = ledger();
        assert!(matches!(
            wallets.deposit("u", "EUR", 0),
            Err(CoreError::InvalidInput { .. })
        ));
        assert_eq!(wallets.balance("u", "EUR").version, 0);
    }
}
