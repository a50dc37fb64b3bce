//! Wallet and escrow ledger (C5).
//!
//! Per-`(user, currency)` balances `{available, held, version}` with an
//! append-only transaction log. Holds escrow funds for checkout; releasing a
//! hold either refunds the holder or settles to a payee wallet in the same
//! atomic unit.

pub mod ledger;
pub mod model;

pub use ledger::{WalletLedger, WalletRecord};
pub use model::{
    Balance, Hold, HoldState, Reconciliation, ReleaseTarget, TxnKind, Wallet, WalletKey, WalletTxn,
};
