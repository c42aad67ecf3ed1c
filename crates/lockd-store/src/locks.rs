use lockd_types::{DeviceLock, LockState};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::{DynStore, RecordStore, StoreResult, lock};

const LOCKS_KEY: &str = "active-locks";

/// Persisted map of active locks keyed by lock id.
pub struct LockStore {
    store: DynStore,
    locks: Mutex<BTreeMap<String, DeviceLock>>,
}

impl std::fmt::Debug for LockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockStore")
            .field("locks", &lock(&self.locks).len())
            .finish()
    }
}

impl LockStore {
    pub fn open(store: DynStore) -> StoreResult<Self> {
        let locks: BTreeMap<String, DeviceLock> = store.get_record(LOCKS_KEY)?.unwrap_or_default();
        Ok(Self {
            store,
            locks: Mutex::new(locks),
        })
    }

    pub fn all(&self) -> Vec<DeviceLock> {
        lock(&self.locks).values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<DeviceLock> {
        lock(&self.locks).get(id).cloned()
    }

    pub fn state(&self) -> LockState {
        LockState::derive(lock(&self.locks).values())
    }

    /// Insert or replace by id. Returns the previous lock with that id.
    pub fn upsert(&self, device_lock: DeviceLock) -> StoreResult<Option<DeviceLock>> {
        let mut guard = lock(&self.locks);
        let mut next = guard.clone();
        let previous = next.insert(device_lock.id.clone(), device_lock);
        self.store.put_record(LOCKS_KEY, &next)?;
        *guard = next;
        Ok(previous)
    }

    pub fn remove(&self, id: &str) -> StoreResult<Option<DeviceLock>> {
        let mut guard = lock(&self.locks);
        if !guard.contains_key(id) {
            return Ok(None);
        }
        let mut next = guard.clone();
        let removed = next.remove(id);
        self.store.put_record(LOCKS_KEY, &next)?;
        *guard = next;
        Ok(removed)
    }
}
