use serde::{Deserialize, Serialize};
use std::fmt;

use crate::EpochMs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "INFO",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentKind {
    SignatureInvalid,
    CommandRejected,
    CommandFailed,
    CommandExecuted,
    CriticalCommand,
    LockApplied,
    LockRemoved,
    TamperDetected,
    DeviceMismatch,
    HeartbeatFailed,
    HeartbeatBlocked,
    Deactivation,
    CapabilityDegraded,
    CapabilityLost,
    RecoveryAttempt,
    RecoveryExhausted,
    StorageFailure,
    PinRejected,
}

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub kind: IncidentKind,
    pub severity: Severity,
    pub details: String,
    /// Command or lock id the incident concerns, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub at_ms: EpochMs,
}

impl Incident {
    pub fn new(
        kind: IncidentKind,
        severity: Severity,
        details: impl Into<String>,
        at_ms: EpochMs,
    ) -> Self {
        Self {
            kind,
            severity,
            details: details.into(),
            subject: None,
            at_ms,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}
