use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{EpochMs, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockType {
    Soft,
    Hard,
}

impl LockType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SOFT" | "SOFT_LOCK" => Some(LockType::Soft),
            "HARD" | "HARD_LOCK" => Some(LockType::Hard),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockStatus {
    Active,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockReason {
    AdminAction,
    PaymentReminder,
    PaymentOverdue,
    SystemTamper,
    DeviceMismatch,
    DeveloperOptionsAttempt,
    SafeModeAttempt,
    ComplianceViolation,
    CapabilityLost,
}

impl LockReason {
    pub fn parse(s: &str) -> Option<Self> {
        let reason = match s.trim().to_ascii_uppercase().as_str() {
            "ADMIN_ACTION" => LockReason::AdminAction,
            "PAYMENT_REMINDER" => LockReason::PaymentReminder,
            "PAYMENT_OVERDUE" => LockReason::PaymentOverdue,
            "SYSTEM_TAMPER" => LockReason::SystemTamper,
            "DEVICE_MISMATCH" => LockReason::DeviceMismatch,
            "DEVELOPER_OPTIONS_ATTEMPT" => LockReason::DeveloperOptionsAttempt,
            "SAFE_MODE_ATTEMPT" => LockReason::SafeModeAttempt,
            "COMPLIANCE_VIOLATION" => LockReason::ComplianceViolation,
            "CAPABILITY_LOST" => LockReason::CapabilityLost,
            _ => return None,
        };
        Some(reason)
    }

    /// Map a free-text reason from the backend onto the closest reason code.
    pub fn from_backend_text(text: &str) -> Self {
        let lower = text.to_ascii_lowercase();
        if lower.contains("payment") || lower.contains("overdue") {
            LockReason::PaymentOverdue
        } else if lower.contains("security") || lower.contains("mismatch") {
            LockReason::DeviceMismatch
        } else if lower.contains("tamper") {
            LockReason::SystemTamper
        } else {
            LockReason::AdminAction
        }
    }

    /// Text shown on the lock screen.
    pub fn describe(&self) -> &'static str {
        match self {
            LockReason::AdminAction => "Locked by your provider",
            LockReason::PaymentReminder => "Payment due soon",
            LockReason::PaymentOverdue => "Payment overdue",
            LockReason::SystemTamper => "Device security settings were changed",
            LockReason::DeviceMismatch => "Device identity could not be verified",
            LockReason::DeveloperOptionsAttempt => "Developer options are not allowed",
            LockReason::SafeModeAttempt => "Safe mode is not allowed",
            LockReason::ComplianceViolation => "Device is out of compliance",
            LockReason::CapabilityLost => "Device management was disabled",
        }
    }
}

impl fmt::Display for LockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockReason::AdminAction => "ADMIN_ACTION",
            LockReason::PaymentReminder => "PAYMENT_REMINDER",
            LockReason::PaymentOverdue => "PAYMENT_OVERDUE",
            LockReason::SystemTamper => "SYSTEM_TAMPER",
            LockReason::DeviceMismatch => "DEVICE_MISMATCH",
            LockReason::DeveloperOptionsAttempt => "DEVELOPER_OPTIONS_ATTEMPT",
            LockReason::SafeModeAttempt => "SAFE_MODE_ATTEMPT",
            LockReason::ComplianceViolation => "COMPLIANCE_VIOLATION",
            LockReason::CapabilityLost => "CAPABILITY_LOST",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TamperKind {
    DeveloperOptions,
    UsbDebugging,
    BootloaderUnlocked,
    Rooted,
    CustomRom,
    UnauthorizedAccessibility,
    ProtectedAppRemoved,
    SafeMode,
}

impl TamperKind {
    /// Stable suffix used for per-kind lock ids.
    pub fn slug(&self) -> &'static str {
        match self {
            TamperKind::DeveloperOptions => "developer_options",
            TamperKind::UsbDebugging => "usb_debugging",
            TamperKind::BootloaderUnlocked => "bootloader_unlocked",
            TamperKind::Rooted => "rooted",
            TamperKind::CustomRom => "custom_rom",
            TamperKind::UnauthorizedAccessibility => "unauthorized_accessibility",
            TamperKind::ProtectedAppRemoved => "protected_app_removed",
            TamperKind::SafeMode => "safe_mode",
        }
    }
}

/// Which producer created a lock. Triggers only ever clear locks of their own origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockOrigin {
    Admin,
    Payment,
    Tamper,
    Mismatch,
    Network,
    Recovery,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLock {
    pub id: String,
    pub lock_type: LockType,
    pub status: LockStatus,
    pub reason: LockReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tamper: Option<TamperKind>,
    pub origin: LockOrigin,
    pub message: String,
    pub created_at_ms: EpochMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<EpochMs>,
    pub backend_unlock_only: bool,
    pub pin_required: bool,
    /// `sha256:`-prefixed digest of the unlock PIN, when PIN unlock is permitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin_digest: Option<String>,
    pub dismissible: bool,
    #[serde(default)]
    pub failed_attempts: u32,
    #[serde(default)]
    pub max_attempts: u32,
}

pub const DEFAULT_MAX_PIN_ATTEMPTS: u32 = 5;

impl DeviceLock {
    /// Hard lock: non-dismissible, no expiry, cleared only by an authenticated backend.
    pub fn hard(
        id: impl Into<String>,
        reason: LockReason,
        origin: LockOrigin,
        message: impl Into<String>,
        now_ms: EpochMs,
    ) -> Self {
        Self {
            id: id.into(),
            lock_type: LockType::Hard,
            status: LockStatus::Active,
            reason,
            tamper: None,
            origin,
            message: message.into(),
            created_at_ms: now_ms,
            expires_at_ms: None,
            backend_unlock_only: true,
            pin_required: false,
            pin_digest: None,
            dismissible: false,
            failed_attempts: 0,
            max_attempts: 0,
        }
    }

    /// Soft lock: dismissible warning-level lock.
    pub fn soft(
        id: impl Into<String>,
        reason: LockReason,
        origin: LockOrigin,
        message: impl Into<String>,
        now_ms: EpochMs,
    ) -> Self {
        Self {
            id: id.into(),
            lock_type: LockType::Soft,
            status: LockStatus::Active,
            reason,
            tamper: None,
            origin,
            message: message.into(),
            created_at_ms: now_ms,
            expires_at_ms: None,
            backend_unlock_only: false,
            pin_required: false,
            pin_digest: None,
            dismissible: true,
            failed_attempts: 0,
            max_attempts: 0,
        }
    }

    pub fn with_expiry(mut self, expires_at_ms: EpochMs) -> Self {
        self.expires_at_ms = Some(expires_at_ms);
        self
    }

    pub fn with_tamper(mut self, kind: TamperKind) -> Self {
        self.tamper = Some(kind);
        self
    }

    /// Permit end-user PIN unlock. Not allowed on backend-only locks; `validate` rejects that.
    pub fn with_pin(mut self, pin_digest: impl Into<String>) -> Self {
        self.pin_required = true;
        self.pin_digest = Some(pin_digest.into());
        self.max_attempts = DEFAULT_MAX_PIN_ATTEMPTS;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == LockStatus::Active
    }

    pub fn is_expired(&self, now_ms: EpochMs) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms >= at)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        if self.lock_type == LockType::Hard && self.dismissible {
            return Err(ValidationError::InvalidLock(format!(
                "hard lock '{}' cannot be dismissible",
                self.id
            )));
        }
        if self.backend_unlock_only && self.pin_required {
            return Err(ValidationError::InvalidLock(format!(
                "lock '{}' is backend-unlock-only and cannot accept a PIN",
                self.id
            )));
        }
        if self.pin_required && self.pin_digest.is_none() {
            return Err(ValidationError::InvalidLock(format!(
                "lock '{}' requires a PIN but carries no digest",
                self.id
            )));
        }
        Ok(())
    }

    /// Whether two locks would present the same effect on the device. Ignores
    /// bookkeeping fields (creation time, attempt counters).
    pub fn same_effect(&self, other: &DeviceLock) -> bool {
        self.id == other.id
            && self.lock_type == other.lock_type
            && self.status == other.status
            && self.reason == other.reason
            && self.tamper == other.tamper
            && self.message == other.message
            && self.expires_at_ms == other.expires_at_ms
            && self.backend_unlock_only == other.backend_unlock_only
            && self.pin_required == other.pin_required
            && self.pin_digest == other.pin_digest
            && self.dismissible == other.dismissible
    }
}

/// Canonical 3-valued lock state. Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    Unlocked,
    SoftLock,
    HardLock,
}

impl LockState {
    /// `HARD_LOCK` iff any active lock is hard; else `SOFT_LOCK` iff any active
    /// lock is soft; else `UNLOCKED`.
    pub fn derive<'a, I>(locks: I) -> Self
    where
        I: IntoIterator<Item = &'a DeviceLock>,
    {
        let mut state = LockState::Unlocked;
        for lock in locks.into_iter().filter(|l| l.is_active()) {
            match lock.lock_type {
                LockType::Hard => return LockState::HardLock,
                LockType::Soft => state = LockState::SoftLock,
            }
        }
        state
    }

    pub fn is_locked(&self) -> bool {
        *self != LockState::Unlocked
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockState::Unlocked => "UNLOCKED",
            LockState::SoftLock => "SOFT_LOCK",
            LockState::HardLock => "HARD_LOCK",
        })
    }
}
