use lockd_types::{EpochMs, Severity};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::{DynStore, RecordStore, StoreResult, lock};

const OUTBOX_KEY: &str = "alert-outbox";
pub const DEFAULT_OUTBOX_CAPACITY: usize = 200;

/// Report awaiting best-effort delivery to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub kind: String,
    pub severity: Severity,
    /// JSON body posted as-is.
    pub body: String,
    pub created_at_ms: EpochMs,
    #[serde(default)]
    pub attempts: u32,
}

pub struct AlertOutbox {
    store: DynStore,
    capacity: usize,
    alerts: Mutex<VecDeque<Alert>>,
}

impl std::fmt::Debug for AlertOutbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertOutbox")
            .field("queued", &lock(&self.alerts).len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl AlertOutbox {
    pub fn open(store: DynStore, capacity: usize) -> StoreResult<Self> {
        let alerts: VecDeque<Alert> = store.get_record(OUTBOX_KEY)?.unwrap_or_default();
        Ok(Self {
            store,
            capacity: capacity.max(1),
            alerts: Mutex::new(alerts),
        })
    }

    fn commit(&self, mutate: impl FnOnce(&mut VecDeque<Alert>)) -> StoreResult<()> {
        let mut guard = lock(&self.alerts);
        let mut next = guard.clone();
        mutate(&mut next);
        self.store.put_record(OUTBOX_KEY, &next)?;
        *guard = next;
        Ok(())
    }

    /// Queue an alert. When full, the oldest non-critical alert is dropped
    /// first; critical alerts are only dropped when nothing else is left.
    pub fn push(&self, alert: Alert) -> StoreResult<()> {
        let capacity = self.capacity;
        self.commit(|alerts| {
            alerts.push_back(alert);
            while alerts.len() > capacity {
                let victim = alerts
                    .iter()
                    .position(|a| a.severity < Severity::Critical)
                    .unwrap_or(0);
                if let Some(dropped) = alerts.remove(victim) {
                    log::warn!("alert outbox full; dropping {} alert {}", dropped.kind, dropped.id);
                }
            }
        })
    }

    pub fn pending(&self) -> Vec<Alert> {
        lock(&self.alerts).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.alerts).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.alerts).is_empty()
    }

    pub fn ack(&self, id: &str) -> StoreResult<()> {
        self.commit(|alerts| alerts.retain(|a| a.id != id))
    }

    pub fn record_attempt(&self, id: &str) -> StoreResult<()> {
        self.commit(|alerts| {
            if let Some(alert) = alerts.iter_mut().find(|a| a.id == id) {
                alert.attempts += 1;
            }
        })
    }
}
