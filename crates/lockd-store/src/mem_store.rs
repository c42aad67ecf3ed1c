use crate::{Store, StoreResult, lock, validate_key};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

#[derive(Clone, Default)]
pub struct MemStore {
    records: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStore")
            .field("records", &lock(&self.records).len())
            .finish()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.records).keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Store for MemStore {
    fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        validate_key(key)?;
        lock(&self.records).insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(lock(&self.records).get(key).cloned())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        lock(&self.records).remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecordStore;

    #[test]
    fn clones_share_records() {
        let store = MemStore::new();
        let clone = store.clone();
        store.put_record("counter", &7u64).expect("put");
        assert_eq!(clone.get_record::<u64>("counter").expect("get"), Some(7));
        assert_eq!(clone.keys(), vec!["counter".to_string()]);
    }
}
