//! Durable, device-key encrypted storage for the lock enforcement core: a
//! keyed record store (filesystem, in-memory, fallback pair), a sealed
//! append-only journal, and the typed stores built on them.

mod fallback;
mod fs_store;
pub mod journal;
pub mod key;
mod locks;
mod mem_store;
mod outbox;
pub mod queue;
mod seal;
mod slot;
mod verification_log;

pub use fallback::FallbackStore;
pub use fs_store::FsStore;
pub use journal::{
    FsJournal, Journal, JournalEntry, JournalError, JournalKind, MemJournal, OwnedJournalEntry,
    TornTail,
};
pub use key::DeviceKey;
pub use locks::LockStore;
pub use mem_store::MemStore;
pub use outbox::{Alert, AlertOutbox, DEFAULT_OUTBOX_CAPACITY};
pub use queue::{CommandQueue, Dequeued, QueueError, QueueLimits};
pub use seal::Sealer;
pub use slot::{HeartbeatState, Slot};
pub use verification_log::{DEFAULT_VERIFICATION_HISTORY, VerificationLog};

use serde::{Serialize, de::DeserializeOwned};
use std::{
    io,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

pub type StoreResult<T> = Result<T, StoreError>;
pub type DynStore = Arc<dyn Store>;

/// Keyed record store. Every `put` is durable before it returns.
pub trait Store: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()>;
    /// `Ok(None)` when the key has never been written.
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;
    fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Canonical-CBOR record helpers on top of any [`Store`].
pub trait RecordStore {
    fn put_record<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()>;
    fn get_record<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>>;
}

impl<S: Store + ?Sized> RecordStore for S {
    fn put_record<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let bytes = lockd_types::to_canonical_cbor(value)?;
        self.put(key, &bytes)
    }

    fn get_record<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(serde_cbor::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CBOR serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("sealed record '{key}' could not be opened: {reason}")]
    Seal { key: String, reason: String },
    #[error("invalid record key '{0}'")]
    InvalidKey(String),
    #[error("key material unavailable: {0}")]
    KeyMaterial(String),
    #[error("primary and fallback stores both failed for '{key}': {primary}; {secondary}")]
    BothFailed {
        key: String,
        primary: Box<StoreError>,
        secondary: Box<StoreError>,
    },
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source: err,
    }
}

/// Record keys become file names: lowercase ascii, digits, `.`, `_`, `-`.
pub(crate) fn validate_key(key: &str) -> StoreResult<()> {
    let ok = !key.is_empty()
        && key.len() <= 128
        && !key.starts_with('.')
        && key.bytes().all(|b| {
            b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-')
        });
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// Mutex guard that survives a panicked holder. Store state is only ever
/// replaced wholesale after a successful persist, so it is never half-written.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
