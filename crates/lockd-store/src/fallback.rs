use crate::{DynStore, Store, StoreError, StoreResult};

/// Primary store mirrored to a secondary location. Writes go to both and fail
/// only when both fail; reads prefer the primary and fall back on error or
/// absence.
#[derive(Clone)]
pub struct FallbackStore {
    primary: DynStore,
    secondary: DynStore,
}

impl std::fmt::Debug for FallbackStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackStore").finish_non_exhaustive()
    }
}

impl FallbackStore {
    pub fn new(primary: DynStore, secondary: DynStore) -> Self {
        Self { primary, secondary }
    }

    fn both<F>(&self, key: &str, op: F) -> StoreResult<()>
    where
        F: Fn(&dyn Store) -> StoreResult<()>,
    {
        match (op(self.primary.as_ref()), op(self.secondary.as_ref())) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(err), Ok(())) => {
                log::warn!("primary store failed for '{key}'; fallback holds the record: {err}");
                Ok(())
            }
            (Ok(()), Err(err)) => {
                log::warn!("fallback store failed for '{key}': {err}");
                Ok(())
            }
            (Err(primary), Err(secondary)) => Err(StoreError::BothFailed {
                key: key.to_string(),
                primary: Box::new(primary),
                secondary: Box::new(secondary),
            }),
        }
    }
}

impl Store for FallbackStore {
    fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        self.both(key, |store| store.put(key, bytes))
    }

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        match self.primary.get(key) {
            Ok(Some(bytes)) => Ok(Some(bytes)),
            Ok(None) => self.secondary.get(key),
            Err(primary) => {
                log::warn!("primary store read failed for '{key}'; trying fallback: {primary}");
                self.secondary.get(key).map_err(|secondary| StoreError::BothFailed {
                    key: key.to_string(),
                    primary: Box::new(primary),
                    secondary: Box::new(secondary),
                })
            }
        }
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.both(key, |store| store.delete(key))
    }
}
