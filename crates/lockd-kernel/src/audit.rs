//! Audit trail: incidents and lock transitions, journaled and logged.

use lockd_store::{Journal, JournalEntry, JournalKind};
use lockd_types::{EpochMs, Incident, LockState, Severity};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockTransition {
    pub lock_id: String,
    pub action: TransitionAction,
    pub before: LockState,
    pub after: LockState,
    pub at_ms: EpochMs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionAction {
    Applied,
    Replaced,
    Removed,
    Dismissed,
    PinUnlocked,
    Expired,
    Escalated,
}

#[derive(Clone)]
pub struct AuditLog {
    journal: Arc<dyn Journal>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("next_seq", &self.journal.next_seq())
            .finish()
    }
}

impl AuditLog {
    pub fn new(journal: Arc<dyn Journal>) -> Self {
        Self { journal }
    }

    /// Never fails: an audit write error is logged, not propagated.
    pub fn incident(&self, incident: Incident) {
        match incident.severity {
            Severity::Critical => log::error!(
                "[{}] {:?}: {} {}",
                incident.severity,
                incident.kind,
                incident.details,
                incident.subject.as_deref().unwrap_or("")
            ),
            Severity::High | Severity::Medium => log::warn!(
                "[{}] {:?}: {} {}",
                incident.severity,
                incident.kind,
                incident.details,
                incident.subject.as_deref().unwrap_or("")
            ),
            Severity::Info => log::info!("{:?}: {}", incident.kind, incident.details),
        }
        self.append(JournalKind::Incident, &incident);
    }

    pub fn transition(&self, transition: &LockTransition) {
        log::info!(
            "lock {} {:?}: {} -> {}",
            transition.lock_id,
            transition.action,
            transition.before,
            transition.after
        );
        self.append(JournalKind::LockTransition, transition);
    }

    fn append<T: Serialize>(&self, kind: JournalKind, value: &T) {
        let result = serde_cbor::to_vec(value)
            .map_err(|e| e.to_string())
            .and_then(|bytes| {
                self.journal
                    .append(JournalEntry::new(kind, &bytes))
                    .map_err(|e| e.to_string())
            });
        if let Err(err) = result {
            log::error!("audit journal append failed ({kind:?}): {err}");
        }
    }

    /// Incidents in journal order at or above `min`.
    pub fn incidents(&self, min: Severity) -> Vec<Incident> {
        self.decode(JournalKind::Incident)
            .into_iter()
            .filter(|i: &Incident| i.severity >= min)
            .collect()
    }

    pub fn transitions(&self) -> Vec<LockTransition> {
        self.decode(JournalKind::LockTransition)
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, kind: JournalKind) -> Vec<T> {
        match self.journal.load_from(0) {
            Ok(entries) => entries
                .into_iter()
                .filter(|e| e.kind == kind)
                .filter_map(|e| serde_cbor::from_slice(&e.payload).ok())
                .collect(),
            Err(err) => {
                log::error!("audit journal unreadable: {err}");
                Vec::new()
            }
        }
    }
}
