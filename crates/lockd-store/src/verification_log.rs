use lockd_types::VerificationStatus;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::{DynStore, RecordStore, StoreResult, lock};

const VERIFICATION_KEY: &str = "verification-log";
pub const DEFAULT_VERIFICATION_HISTORY: usize = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LogState {
    last: Option<VerificationStatus>,
    history: VecDeque<VerificationStatus>,
}

/// Last-known capability verification plus a bounded history.
pub struct VerificationLog {
    store: DynStore,
    max_history: usize,
    state: Mutex<LogState>,
}

impl std::fmt::Debug for VerificationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationLog")
            .field("max_history", &self.max_history)
            .finish()
    }
}

impl VerificationLog {
    pub fn open(store: DynStore, max_history: usize) -> StoreResult<Self> {
        let state = store.get_record(VERIFICATION_KEY)?.unwrap_or_default();
        Ok(Self {
            store,
            max_history,
            state: Mutex::new(state),
        })
    }

    pub fn record(&self, status: VerificationStatus) -> StoreResult<()> {
        let mut guard = lock(&self.state);
        let mut next = guard.clone();
        next.history.push_back(status.clone());
        while next.history.len() > self.max_history {
            next.history.pop_front();
        }
        next.last = Some(status);
        self.store.put_record(VERIFICATION_KEY, &next)?;
        *guard = next;
        Ok(())
    }

    pub fn last(&self) -> Option<VerificationStatus> {
        lock(&self.state).last.clone()
    }

    pub fn history(&self) -> Vec<VerificationStatus> {
        lock(&self.state).history.iter().cloned().collect()
    }
}
