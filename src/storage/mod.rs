//! Storage layer.
//!
//! All durable state flows through typed journals: a component appends a
//! record for every state change before acknowledging it, and rebuilds its
//! in-memory indices by replaying that journal at boot.
//!
//! # Collections
//!
//! - `ledger.wal` - stock accounts and reservations
//! - `flash.wal` - flash sales and per-user purchase counters
//! - `wallet.wal` - wallets, wallet transactions and holds
//! - `saga.wal` - sagas and their step journal

pub mod journal;

pub use journal::{read_journal_file, Journal, JournalEntry, SyncMode};

use crate::core::error::CoreResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const LEDGER_JOURNAL: &str = "ledger";
pub const FLASH_JOURNAL: &str = "flash";
pub const WALLET_JOURNAL: &str = "wallet";
pub const SAGA_JOURNAL: &str = "saga";

/// Hands out one journal per collection.
#[derive(Debug, Clone)]
pub struct Storage {
    dir: Option<PathBuf>,
    mode: SyncMode,
}

impl Storage {
    /// File-backed storage rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>, mode: SyncMode) -> CoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        tracing::info!(storage_dir = %dir.display(), ?mode, "storage opened");
        Ok(Self {
            dir: Some(dir),
            mode,
        })
    }

    /// Volatile storage; every journal starts empty.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            mode: SyncMode::Buffered,
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn journal_path(&self, name: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{}.wal", name)))
    }

    pub fn journal<R>(&self, name: &str) -> CoreResult<Journal<R>>
    where
        R: Serialize + DeserializeOwned,
    {
        match self.journal_path(name) {
            Some(path) => Journal::open(&path, self.mode),
            None => Ok(Journal::in_memory(name)),
        }
    }
}
