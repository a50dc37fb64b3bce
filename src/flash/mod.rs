//! Flash-sale admission and atomic reservation (C2).
//!
//! - [`rate_limit`] - token buckets keyed by user and by source
//! - [`pow`] - SHA-256 proof-of-work challenges with adaptive difficulty
//! - [`queue`] - bounded per-sale FIFO drained by a shared worker pool
//! - [`sale`] - sale lifecycle, per-user counters and their journal
//! - [`engine`] - the admission pipeline tying these to the ledger

pub mod engine;
pub mod pow;
pub mod queue;
pub mod rate_limit;
pub mod sale;

pub use engine::{Confirmation, FlashSaleEngine, PurchaseAttempt};
pub use pow::ChallengeIssue;
pub use sale::{FlashRecord, FlashSale, FlashSaleBook, NewFlashSale, SaleState};
