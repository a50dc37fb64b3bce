//! Append-only durable record log.
//!
//! Every state change of the ledgers and the saga orchestrator is appended
//! here before it is acknowledged. Frames are length-prefixed `bincode`
//! entries:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────────┐
//! │ len: u32 LE  │ bincode(JournalEntry { index, ts, rec }) │
//! └──────────────┴──────────────────────────────────────────┘
//! ```
//!
//! A crash mid-append leaves at most one torn frame at the tail. It is
//! detected when the journal is opened and truncated away; every earlier
//! frame stays valid. An append that fails while the process lives is cut
//! back off the file before the error is returned, so a record the caller
//! was told failed never replays. If that cut fails too, the journal is
//! poisoned and refuses further appends.

use crate::core::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Length prefix size in bytes.
const FRAME_HEADER_LEN: usize = 4;

/// Upper bound on a single frame; anything larger is treated as corruption.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// When appended frames reach stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// `fsync` every frame before acknowledging.
    Strict,
    /// Leave flushing to the OS page cache.
    Buffered,
}

impl SyncMode {
    /// Parse the `durability.mode` config value.
    pub fn from_config(mode: &str) -> Self {
        match mode {
            "buffered" => Self::Buffered,
            _ => Self::Strict,
        }
    }
}

/// A decoded journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry<R> {
    /// Dense, monotone record index starting at 0.
    pub index: u64,
    /// Wall-clock append time (diagnostics only).
    pub timestamp_ms: u64,
    pub record: R,
}

/// Borrowed view used for encoding; field order matches [`JournalEntry`].
#[derive(Serialize)]
struct EntryRef<'a, R> {
    index: u64,
    timestamp_ms: u64,
    record: &'a R,
}

enum Backend {
    /// `len` is the byte length covered by acknowledged frames.
    File { path: PathBuf, file: File, len: u64 },
    Memory { bytes: Vec<u8> },
}

struct JournalInner {
    backend: Backend,
    next_index: u64,
    poisoned: Option<String>,
    #[cfg(test)]
    fault: Option<tests::Fault>,
}

/// Typed append-only journal.
pub struct Journal<R> {
    name: String,
    mode: SyncMode,
    inner: Mutex<JournalInner>,
    _record: PhantomData<fn() -> R>,
}

impl<R> Journal<R>
where
    R: Serialize + DeserializeOwned,
{
    /// Create a volatile journal (tests, tooling).
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: SyncMode::Buffered,
            inner: Mutex::new(JournalInner {
                backend: Backend::Memory { bytes: Vec::new() },
                next_index: 0,
                poisoned: None,
                #[cfg(test)]
                fault: None,
            }),
            _record: PhantomData,
        }
    }

    /// Open or create a file-backed journal, truncating a torn tail.
    pub fn open(path: &Path, mode: SyncMode) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let existing = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let (entries, valid_len) = decode_frames::<R>(&existing)?;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        if (valid_len as usize) < existing.len() {
            tracing::warn!(
                path = %path.display(),
                valid_len,
                file_len = existing.len(),
                "truncating torn journal tail"
            );
            file.set_len(valid_len)?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::End(0))?;

        let next_index = entries.last().map(|e| e.index + 1).unwrap_or(0);
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("journal")
            .to_string();

        tracing::debug!(journal = %name, records = next_index, "journal opened");

        Ok(Self {
            name,
            mode,
            inner: Mutex::new(JournalInner {
                backend: Backend::File {
                    path: path.to_path_buf(),
                    file,
                    len: valid_len,
                },
                next_index,
                poisoned: None,
                #[cfg(test)]
                fault: None,
            }),
            _record: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of records appended so far.
    pub fn len(&self) -> u64 {
        self.inner.lock().next_index
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> Option<PathBuf> {
        match &self.inner.lock().backend {
            Backend::File { path, .. } => Some(path.clone()),
            Backend::Memory { .. } => None,
        }
    }

    /// Append a record; returns its index once durable per [`SyncMode`].
    pub fn append(&self, record: &R) -> CoreResult<u64> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(reason) = &inner.poisoned {
            return Err(CoreError::storage(format!(
                "journal {} refuses appends: {}",
                self.name, reason
            )));
        }
        let index = inner.next_index;
        let entry = EntryRef {
            index,
            timestamp_ms: wall_clock_ms(),
            record,
        };
        let payload = bincode::serialize(&entry)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(CoreError::storage(format!(
                "record of {} bytes exceeds frame limit",
                payload.len()
            )));
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);

        match &mut inner.backend {
            Backend::File { file, len, .. } => {
                let strict = self.mode == SyncMode::Strict;
                #[cfg(test)]
                let written = match inner.fault.take() {
                    Some(fault) => fault.apply(file, &frame),
                    None => write_frame(file, &frame, strict),
                };
                #[cfg(not(test))]
                let written = write_frame(file, &frame, strict);

                if let Err(e) = written {
                    match rewind(file, *len) {
                        Ok(()) => tracing::warn!(
                            journal = %self.name,
                            index,
                            error = %e,
                            "journal append failed; frame discarded"
                        ),
                        Err(undo) => {
                            tracing::error!(
                                journal = %self.name,
                                index,
                                error = %e,
                                undo_error = %undo,
                                "journal append failed and could not be undone"
                            );
                            inner.poisoned = Some(format!("unrecovered append failure: {e}"));
                        }
                    }
                    return Err(e.into());
                }
                *len += frame.len() as u64;
            }
            Backend::Memory { bytes } => bytes.extend_from_slice(&frame),
        }

        inner.next_index += 1;
        Ok(index)
    }

    /// Decode every record in append order.
    pub fn replay(&self) -> CoreResult<Vec<JournalEntry<R>>> {
        let inner = self.inner.lock();
        let bytes = match &inner.backend {
            Backend::File { path, .. } => std::fs::read(path)?,
            Backend::Memory { bytes } => bytes.clone(),
        };
        drop(inner);
        let (entries, _) = decode_frames::<R>(&bytes)?;
        Ok(entries)
    }
}

fn write_frame(file: &mut File, frame: &[u8], strict: bool) -> std::io::Result<()> {
    file.write_all(frame)?;
    if strict {
        file.sync_data()?;
    }
    Ok(())
}

/// Cut the file back to `len` bytes and park the cursor there.
fn rewind(file: &mut File, len: u64) -> std::io::Result<()> {
    file.set_len(len)?;
    file.seek(SeekFrom::Start(len))?;
    file.sync_data()
}

/// Read a journal file without holding it open for append.
pub fn read_journal_file<R: DeserializeOwned>(path: &Path) -> CoreResult<Vec<JournalEntry<R>>> {
    let bytes = std::fs::read(path)?;
    let (entries, _) = decode_frames::<R>(&bytes)?;
    Ok(entries)
}

/// Decode frames, returning the entries and the byte length they cover.
///
/// An incomplete or undecodable final frame is treated as a torn write.
/// An undecodable frame followed by more data is corruption.
fn decode_frames<R: DeserializeOwned>(bytes: &[u8]) -> CoreResult<(Vec<JournalEntry<R>>, u64)> {
    let mut entries = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let remaining = bytes.len() - offset;
        if remaining < FRAME_HEADER_LEN {
            break;
        }
        let mut len_buf = [0u8; FRAME_HEADER_LEN];
        len_buf.copy_from_slice(&bytes[offset..offset + FRAME_HEADER_LEN]);
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(CoreError::storage(format!(
                "frame at offset {} declares {} bytes",
                offset, len
            )));
        }
        let end = offset + FRAME_HEADER_LEN + len;
        if end > bytes.len() {
            break;
        }
        match bincode::deserialize::<JournalEntry<R>>(&bytes[offset + FRAME_HEADER_LEN..end]) {
            Ok(entry) => entries.push(entry),
            Err(_) if end == bytes.len() => break,
            Err(e) => {
                return Err(CoreError::storage(format!(
                    "corrupt frame at offset {}: {}",
                    offset, e
                )))
            }
        }
        offset = end;
    }

    Ok((entries, offset as u64))
}

fn wall_clock_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
