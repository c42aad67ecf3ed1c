use serde::{Deserialize, Serialize};

use crate::EpochMs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationResult {
    Success,
    /// Capability present but one of its powers failed.
    Degraded,
    /// Capability revoked.
    Failed,
    /// The check itself raised.
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFlags {
    pub capability_active: bool,
    pub remote_lock: bool,
    pub password_policy: bool,
}

impl CapabilityFlags {
    pub fn all() -> Self {
        Self {
            capability_active: true,
            remote_lock: true,
            password_policy: true,
        }
    }

    pub fn classify(&self) -> VerificationResult {
        if !self.capability_active {
            VerificationResult::Failed
        } else if self.remote_lock && self.password_policy {
            VerificationResult::Success
        } else {
            VerificationResult::Degraded
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationStatus {
    pub result: VerificationResult,
    pub flags: CapabilityFlags,
    pub consecutive_failures: u32,
    pub checked_at_ms: EpochMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl VerificationStatus {
    pub fn is_healthy(&self) -> bool {
        self.result == VerificationResult::Success
    }
}
