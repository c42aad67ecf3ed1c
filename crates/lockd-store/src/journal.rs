//! Append-only audit journal. Each record is length-prefixed and sealed with
//! the device key, so the log is tamper-evident as well as private.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use lockd_types::to_canonical_cbor;

use crate::{StoreError, lock, seal::Sealer};

const JOURNAL_DIR: &str = "journal";
const JOURNAL_FILE: &str = "audit.log";
const JOURNAL_AAD: &str = "journal";

pub type JournalSeq = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    Incident,
    LockTransition,
    CommandOutcome,
    Verification,
}

#[derive(Debug, Clone, Copy)]
pub struct JournalEntry<'a> {
    pub kind: JournalKind,
    pub payload: &'a [u8],
}

impl<'a> JournalEntry<'a> {
    pub fn new(kind: JournalKind, payload: &'a [u8]) -> Self {
        Self { kind, payload }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnedJournalEntry {
    pub seq: JournalSeq,
    pub kind: JournalKind,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Serialize)]
struct DiskRecord<'a> {
    seq: JournalSeq,
    kind: JournalKind,
    #[serde(with = "serde_bytes")]
    payload: &'a [u8],
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("sealed entry rejected: {0}")]
    Seal(#[from] StoreError),
    #[error("corrupt entry: {0}")]
    Corrupt(String),
}

/// Shared by the audit sink and anything that needs to replay transitions.
pub trait Journal: Send + Sync {
    fn append(&self, entry: JournalEntry<'_>) -> Result<JournalSeq, JournalError>;

    /// Loads entries starting at `from` (inclusive). Passing 0 returns the full log.
    fn load_from(&self, from: JournalSeq) -> Result<Vec<OwnedJournalEntry>, JournalError>;

    fn next_seq(&self) -> JournalSeq;
}

/// An incomplete final record cut off at open, as left by a crash mid-append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TornTail {
    /// Length the file was cut back to.
    pub kept_bytes: u64,
    pub dropped_bytes: u64,
    pub reason: String,
}

#[derive(Debug)]
pub struct FsJournal {
    path: PathBuf,
    sealer: Sealer,
    next_seq: Mutex<JournalSeq>,
    repaired: Option<TornTail>,
}

impl FsJournal {
    /// Opens the journal, cutting off an incomplete final record. Damage
    /// anywhere before the tail is still an error.
    pub fn open(root: impl AsRef<Path>, sealer: Sealer) -> Result<Self, JournalError> {
        let journal_dir = root.as_ref().join(JOURNAL_DIR);
        fs::create_dir_all(&journal_dir)?;
        let path = journal_dir.join(JOURNAL_FILE);
        if !path.exists() {
            File::create(&path)?;
        }
        let scan = scan_records(&path, &sealer)?;
        let repaired = match scan.torn {
            Some(reason) => {
                let total = fs::metadata(&path)?.len();
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(scan.complete_bytes)?;
                file.sync_all()?;
                let tail = TornTail {
                    kept_bytes: scan.complete_bytes,
                    dropped_bytes: total.saturating_sub(scan.complete_bytes),
                    reason,
                };
                log::warn!(
                    "journal {}: dropped {} bytes of an incomplete final record ({})",
                    path.display(),
                    tail.dropped_bytes,
                    tail.reason
                );
                Some(tail)
            }
            None => None,
        };
        let next_seq = scan.entries.last().map(|entry| entry.seq + 1).unwrap_or(0);
        Ok(Self {
            path,
            sealer,
            next_seq: Mutex::new(next_seq),
            repaired,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Set when `open` had to cut off a torn final record.
    pub fn repaired(&self) -> Option<&TornTail> {
        self.repaired.as_ref()
    }
}

impl Journal for FsJournal {
    fn append(&self, entry: JournalEntry<'_>) -> Result<JournalSeq, JournalError> {
        let mut next = lock(&self.next_seq);
        let seq = *next;
        let record = DiskRecord {
            seq,
            kind: entry.kind,
            payload: entry.payload,
        };
        let bytes = self.sealer.seal(JOURNAL_AAD, &to_canonical_cbor(&record)?)?;
        let len = u32::try_from(bytes.len())
            .map_err(|_| JournalError::Corrupt("entry larger than 4GiB".into()))?;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)?;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        *next += 1;
        Ok(seq)
    }

    fn load_from(&self, from: JournalSeq) -> Result<Vec<OwnedJournalEntry>, JournalError> {
        let mut entries = scan_records(&self.path, &self.sealer)?.entries;
        entries.retain(|entry| entry.seq >= from);
        Ok(entries)
    }

    fn next_seq(&self) -> JournalSeq {
        *lock(&self.next_seq)
    }
}

struct Scan {
    entries: Vec<OwnedJournalEntry>,
    /// Offset just past the last complete record.
    complete_bytes: u64,
    torn: Option<String>,
}

/// Reads every complete record. Running out of bytes inside the final
/// record ends the scan with `torn` set; a record that is present in full
/// but fails to unseal or decode is corruption.
fn scan_records(path: &Path, sealer: &Sealer) -> Result<Scan, JournalError> {
    let file_len = fs::metadata(path)?.len();
    let mut file = File::open(path)?;
    let mut scan = Scan {
        entries: Vec::new(),
        complete_bytes: 0,
        torn: None,
    };
    loop {
        let mut len_buf = [0u8; 4];
        let read = read_up_to(&mut file, &mut len_buf)?;
        if read == 0 {
            break;
        }
        if read < len_buf.len() {
            scan.torn = Some(format!("truncated length header ({read} of 4 bytes)"));
            break;
        }
        let len = u64::from(u32::from_le_bytes(len_buf));
        let remaining = file_len.saturating_sub(scan.complete_bytes + 4);
        if len > remaining {
            scan.torn = Some(format!("truncated entry payload ({remaining} of {len} bytes)"));
            break;
        }
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        let plain = sealer.open(JOURNAL_AAD, &buf)?;
        scan.entries.push(serde_cbor::from_slice(&plain)?);
        scan.complete_bytes += 4 + len;
    }
    Ok(scan)
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> Result<usize, JournalError> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(filled)
}

/// In-memory journal for tests and ephemeral runs.
#[derive(Debug, Default, Clone)]
pub struct MemJournal {
    entries: Arc<Mutex<Vec<OwnedJournalEntry>>>,
}

impl MemJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<OwnedJournalEntry> {
        lock(&self.entries).clone()
    }
}

impl Journal for MemJournal {
    fn append(&self, entry: JournalEntry<'_>) -> Result<JournalSeq, JournalError> {
        let mut guard = lock(&self.entries);
        let seq = guard.len() as JournalSeq;
        guard.push(OwnedJournalEntry {
            seq,
            kind: entry.kind,
            payload: entry.payload.to_vec(),
        });
        Ok(seq)
    }

    fn load_from(&self, from: JournalSeq) -> Result<Vec<OwnedJournalEntry>, JournalError> {
        Ok(self
            .entries()
            .into_iter()
            .filter(|entry| entry.seq >= from)
            .collect())
    }

    fn next_seq(&self) -> JournalSeq {
        lock(&self.entries).len() as JournalSeq
    }
}
