use lockd_types::EpochMs;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::sync::Mutex;

use crate::{DynStore, RecordStore, StoreResult, lock};

/// Single typed record with a cached copy. Used for small state blobs
/// (heartbeat bookkeeping, loan snapshot, identity baseline).
pub struct Slot<T> {
    store: DynStore,
    key: &'static str,
    value: Mutex<Option<T>>,
}

impl<T> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot").field("key", &self.key).finish()
    }
}

impl<T> Slot<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    pub fn open(store: DynStore, key: &'static str) -> StoreResult<Self> {
        let value = store.get_record(key)?;
        Ok(Self {
            store,
            key,
            value: Mutex::new(value),
        })
    }

    pub fn get(&self) -> Option<T> {
        lock(&self.value).clone()
    }

    pub fn set(&self, value: T) -> StoreResult<()> {
        let mut guard = lock(&self.value);
        self.store.put_record(self.key, &value)?;
        *guard = Some(value);
        Ok(())
    }

    pub fn clear(&self) -> StoreResult<()> {
        let mut guard = lock(&self.value);
        self.store.delete(self.key)?;
        *guard = None;
        Ok(())
    }
}

impl<T> Slot<T>
where
    T: Clone + Default + Serialize + DeserializeOwned,
{
    /// Read-modify-write under the slot lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> StoreResult<R> {
        let mut guard = lock(&self.value);
        let mut next = guard.clone().unwrap_or_default();
        let out = f(&mut next);
        self.store.put_record(self.key, &next)?;
        *guard = Some(next);
        Ok(out)
    }
}

/// Heartbeat bookkeeping that must survive restarts so backoff and "last
/// confirmed" survive a reboot while offline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatState {
    pub last_success_ms: Option<EpochMs>,
    pub last_attempt_ms: Option<EpochMs>,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}
