use lockd_store::{JournalError, QueueError, StoreError};
use lockd_types::{EpochMs, Incident, IncidentKind, Severity, ValidationError};
use thiserror::Error;

use crate::device::DeviceError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("backend public key is invalid: {0}")]
    InvalidKey(String),
    #[error("signature is malformed: {0}")]
    Malformed(String),
    #[error("signature does not verify")]
    Mismatch,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("request timed out after {0} ms")]
    Timeout(u64),
    #[error("backend returned status {status}")]
    Status { status: u16 },
    #[error("response body exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("response could not be decoded: {0}")]
    Decode(String),
    #[error("backend rejected the request: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("untrusted command: {0}")]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("privileged capability unavailable: {0}")]
    Capability(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("execution failed: {0}")]
    Execution(String),
}

impl KernelError {
    /// Structured incident for this failure. Callers attach a subject.
    pub fn to_incident(&self, at_ms: EpochMs) -> Incident {
        let (kind, severity) = match self {
            KernelError::Validation(_) => (IncidentKind::CommandRejected, Severity::Medium),
            KernelError::Signature(_) => (IncidentKind::SignatureInvalid, Severity::Critical),
            KernelError::Network(_) => (IncidentKind::HeartbeatFailed, Severity::Medium),
            KernelError::Capability(_) => (IncidentKind::CapabilityLost, Severity::Critical),
            KernelError::Storage(_) => (IncidentKind::StorageFailure, Severity::High),
            KernelError::Execution(_) => (IncidentKind::CommandFailed, Severity::High),
        };
        Incident::new(kind, severity, self.to_string(), at_ms)
    }
}

/// Incident for a command the queue refused. Replays and malformed input are
/// routine; a full or failing queue is not.
pub fn queue_rejection(err: &QueueError, command_id: &str, at_ms: EpochMs) -> Incident {
    let severity = match err {
        QueueError::Full { .. } | QueueError::Store(_) => Severity::High,
        QueueError::Duplicate(_) | QueueError::Validation(_) => Severity::Medium,
    };
    Incident::new(IncidentKind::CommandRejected, severity, err.to_string(), at_ms)
        .with_subject(command_id)
}

impl From<StoreError> for KernelError {
    fn from(err: StoreError) -> Self {
        KernelError::Storage(err.to_string())
    }
}

impl From<JournalError> for KernelError {
    fn from(err: JournalError) -> Self {
        KernelError::Storage(err.to_string())
    }
}

impl From<QueueError> for KernelError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Validation(err) => KernelError::Validation(err),
            QueueError::Store(err) => KernelError::Storage(err.to_string()),
            other => KernelError::Execution(other.to_string()),
        }
    }
}

impl From<DeviceError> for KernelError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::PermissionDenied(msg) => KernelError::Capability(msg),
            other => KernelError::Execution(other.to_string()),
        }
    }
}
