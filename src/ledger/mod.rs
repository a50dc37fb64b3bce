//! Inventory reservation ledger (C3).
//!
//! The single source of truth for "is there stock?":
//! - [`stock`] - per-SKU counters with checked movements
//! - [`reservation`] - reservation records and their terminal transition
//! - [`expiry`] - expiry queue driving the TTL sweeper
//! - [`store`] - the ledger: per-SKU critical sections, journal, replay
//!
//! No interleaving of reserve, commit, rollback or sweep can observe
//! `available < 0` or `reserved < 0`; a movement that would is refused and
//! the SKU is quarantined.

pub mod expiry;
pub mod reservation;
pub mod stock;
pub mod store;

pub use reservation::{Reservation, ReservationState};
pub use stock::StockAccount;
pub use store::{LedgerRecord, ReservationLedger};
