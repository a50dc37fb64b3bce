//! Inspect command implementation.

use crate::flash::FlashRecord;
use crate::ledger::LedgerRecord;
use crate::saga::SagaRecord;
use crate::storage::{read_journal_file, FLASH_JOURNAL, LEDGER_JOURNAL, SAGA_JOURNAL, WALLET_JOURNAL};
use crate::wallet::WalletRecord;
use anyhow::{Context, Result};
use clap::Args;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Dump a journal file as JSON lines.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Journal file, e.g. data/saga.wal.
    pub path: PathBuf,

    /// Record type (ledger, flash, wallet, saga); inferred from the file
    /// name when omitted.
    #[arg(long)]
    pub kind: Option<String>,

    /// Print only the last N records.
    #[arg(long)]
    pub tail: Option<usize>,
}

/// Run the inspect command.
pub fn run_inspect(args: InspectArgs) -> Result<()> {
    let kind = match args.kind.clone() {
        Some(kind) => kind,
        None => infer_kind(&args.path)?,
    };
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let count = match kind.as_str() {
        LEDGER_JOURNAL => dump::<LedgerRecord>(&args.path, args.tail, &mut out)?,
        FLASH_JOURNAL => dump::<FlashRecord>(&args.path, args.tail, &mut out)?,
        WALLET_JOURNAL => dump::<WalletRecord>(&args.path, args.tail, &mut out)?,
        SAGA_JOURNAL => dump::<SagaRecord>(&args.path, args.tail, &mut out)?,
        other => anyhow::bail!("unknown journal kind {other:?}"),
    };
    eprintln!("{count} records in {}", args.path.display());
    Ok(())
}

fn infer_kind(path: &Path) -> Result<String> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .with_context(|| format!("cannot infer journal kind from {}", path.display()))?;
    Ok(stem.to_string())
}

/// Write each entry as one JSON line; returns the total record count.
fn dump<R>(path: &Path, tail: Option<usize>, out: &mut impl Write) -> Result<usize>
where
    R: DeserializeOwned + Serialize,
{
    let entries = read_journal_file::<R>(path)
        .with_context(|| format!("failed to read journal {}", path.display()))?;
    let skip = tail.map_or(0, |n| entries.len().saturating_sub(n));
    for entry in entries.iter().skip(skip) {
        serde_json::to_writer(&mut *out, entry)?;
        writeln!(out)?;
    }
    Ok(entries.len())
}
