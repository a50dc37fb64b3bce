//! cellmart - cell-partitioned commerce core.
//!
//! cellmart keeps inventory, flash-sale admission, checkout and wallet
//! escrow correct under bursty load. Callers are hashed onto cells; each
//! purchase either takes effect exactly once or leaves no trace.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Frontdoor (auth → route)                       │
//! └─────────────────────────────────────────────────────────────────┘
//!          │                                   │
//! ┌────────────────────────┐       ┌────────────────────────────────┐
//! │  Cell Router (C1)      │       │  Checkout Saga (C4)            │
//! │  hash ring + health    │       │  reserve → pay → order → commit│
//! └────────────────────────┘       └────────────────────────────────┘
//!          │                            │            │
//! ┌────────────────────────┐   ┌──────────────┐ ┌──────────────────┐
//! │ Flash-Sale Admission   │──▶│ Reservation  │ │ Wallet / Escrow  │
//! │ (C2) PoW, rate, FIFO   │   │ Ledger (C3)  │ │ Ledger (C5)      │
//! └────────────────────────┘   └──────────────┘ └──────────────────┘
//!                                      │                 │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │             Journals: ledger / flash / wallet / saga            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Component wiring and lifecycle
//! - [`core::frontdoor`] - Token validation and routing at the boundary
//! - [`core::time`] - Clocks and deadlines
//! - [`core::error`] - Error taxonomy and wire codes
//!
//! ## Components
//! - [`control`] - Cell routing and health probing
//! - [`flash`] - Flash-sale admission
//! - [`ledger`] - Stock reservations
//! - [`saga`] - Checkout orchestration
//! - [`wallet`] - Balances, holds and escrow
//!
//! ## Storage
//! - [`storage::journal`] - Append-only record journals
//!
//! ## Operations
//! - [`ops::observability`] - Metrics and health reports
//!
//! # Key Invariants
//!
//! - Committed units of a SKU never exceed its stock
//! - `available + reserved + committed` is constant per stock account
//! - One durable outcome per checkout idempotency key
//! - A wallet balance is the sum of its transactions

// Core infrastructure
pub mod core;

// Cell routing
pub mod control;

// Domain components
pub mod flash;
pub mod ledger;
pub mod saga;
pub mod wallet;

// Storage layer
pub mod storage;

// Operations and observability
pub mod ops;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, frontdoor, ids, runtime, time};
pub use control::routing;
pub use ops::observability;
