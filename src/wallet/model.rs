//! Wallet records.

use crate::core::ids::{HoldId, TxnId};
use crate::core::time::Timestamp;
use serde::{Deserialize, Serialize};

/// `(user, currency)` address of a wallet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WalletKey {
    pub user_id: String,
    pub currency: String,
}

impl WalletKey {
    pub fn new(user_id: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            currency: currency.into(),
        }
    }
}

impl std::fmt::Display for WalletKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.currency)
    }
}

/// Balance record guarded by optimistic version CAS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub available: u64,
    pub held: u64,
    /// Incremented by exactly one on every mutation.
    pub version: u64,
}

/// Client view of a wallet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub available: u64,
    pub held: u64,
    pub version: u64,
}

impl From<Wallet> for Balance {
    fn from(w: Wallet) -> Self {
        Self {
            available: w.available,
            held: w.held,
            version: w.version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnKind {
    Deposit,
    Withdraw,
    Hold,
    ReleaseToUser,
    ReleaseToPayee,
}

impl TxnKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdraw => "withdraw",
            Self::Hold => "hold",
            Self::ReleaseToUser => "release_to_user",
            Self::ReleaseToPayee => "release_to_payee",
        }
    }
}

/// Append-only movement record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTxn {
    pub id: TxnId,
    pub wallet: WalletKey,
    pub kind: TxnKind,
    pub amount: u64,
    /// Caller reference (hold id, saga id, external ref). Not interpreted.
    pub reference: String,
    pub created_at: Timestamp,
}

/// Where released funds go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseTarget {
    /// Refund to the holder's available balance.
    ToUser,
    /// Settle to the payee's wallet in the same currency.
    ToPayee { payee_user_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldState {
    Open,
    ReleasedToUser,
    ReleasedToPayee { payee_user_id: String },
}

impl HoldState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::ReleasedToUser => "released_to_user",
            Self::ReleasedToPayee { .. } => "released_to_payee",
        }
    }
}

/// Escrowed funds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: HoldId,
    pub wallet: WalletKey,
    pub amount: u64,
    pub reference: String,
    pub state: HoldState,
    pub created_at: Timestamp,
}

impl Hold {
    pub fn is_open(&self) -> bool {
        self.state == HoldState::Open
    }
}

/// Balance recomputed from the transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub recorded: Balance,
    pub computed_available: i128,
    pub computed_held: i128,
    pub txn_count: usize,
}

impl Reconciliation {
    pub fn matches(&self) -> bool {
        self.computed_available == i128::from(self.recorded.available)
            && self.computed_held == i128::from(self.recorded.held)
    }
}
