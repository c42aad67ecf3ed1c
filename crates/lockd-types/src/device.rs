//! Observed device state, as reported by the platform sensor.

use serde::{Deserialize, Serialize};

use crate::EpochMs;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceIdentity {
    pub serial_number: String,
    pub android_id: String,
    pub device_fingerprint: String,
    pub imeis: Vec<String>,
    pub model: String,
    pub manufacturer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    /// Free-form as reported (e.g. "4 GB").
    pub installed_ram: String,
    pub total_storage: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPosture {
    pub rooted: bool,
    pub usb_debugging: bool,
    pub developer_mode: bool,
    pub bootloader_unlocked: bool,
    pub custom_rom: bool,
    pub unauthorized_accessibility: bool,
    pub protected_app_removed: bool,
    pub safe_mode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoanStatus {
    Active,
    Approved,
    Overdue,
    Completed,
    Paid,
    Closed,
    FullyPaid,
}

impl LoanStatus {
    pub fn parse(s: &str) -> Option<Self> {
        let status = match s.trim().to_ascii_lowercase().as_str() {
            "active" => LoanStatus::Active,
            "approved" => LoanStatus::Approved,
            "overdue" | "past_due" => LoanStatus::Overdue,
            "completed" => LoanStatus::Completed,
            "paid" => LoanStatus::Paid,
            "closed" => LoanStatus::Closed,
            "fully_paid" => LoanStatus::FullyPaid,
            _ => return None,
        };
        Some(status)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoanStatus::Active => "active",
            LoanStatus::Approved => "approved",
            LoanStatus::Overdue => "overdue",
            LoanStatus::Completed => "completed",
            LoanStatus::Paid => "paid",
            LoanStatus::Closed => "closed",
            LoanStatus::FullyPaid => "fully_paid",
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            LoanStatus::Completed | LoanStatus::Paid | LoanStatus::Closed | LoanStatus::FullyPaid
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanSnapshot {
    #[serde(default)]
    pub loan_number: String,
    pub status: LoanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_due_at_ms: Option<EpochMs>,
    #[serde(default)]
    pub days_overdue: u32,
    /// `sha256:` digest of the backend-issued unlock password for the reminder lock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_pin_digest: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSnapshot {
    pub identity: DeviceIdentity,
    pub resources: Resources,
    pub security: SecurityPosture,
    pub installed_apps: Vec<String>,
    pub system_properties: Vec<String>,
    pub location: Option<LocationFix>,
    pub battery_level: Option<u8>,
    pub loan: Option<LoanSnapshot>,
}

/// Identity registered at enrollment. Empty fields are not compared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityBaseline {
    pub serial_number: String,
    pub device_fingerprint: String,
    pub imeis: Vec<String>,
    pub installed_ram: String,
    pub total_storage: String,
    pub security: SecurityPosture,
}

impl IdentityBaseline {
    pub fn is_empty(&self) -> bool {
        self.serial_number.is_empty()
            && self.device_fingerprint.is_empty()
            && self.imeis.is_empty()
            && self.installed_ram.is_empty()
            && self.total_storage.is_empty()
    }

    /// Enroll from the current snapshot.
    pub fn from_snapshot(snapshot: &DeviceSnapshot) -> Self {
        Self {
            serial_number: snapshot.identity.serial_number.clone(),
            device_fingerprint: snapshot.identity.device_fingerprint.clone(),
            imeis: snapshot.identity.imeis.clone(),
            installed_ram: snapshot.resources.installed_ram.clone(),
            total_storage: snapshot.resources.total_storage.clone(),
            security: SecurityPosture::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_statuses() {
        for s in ["completed", "PAID", "closed", "fully_paid"] {
            assert!(LoanStatus::parse(s).expect("status").is_settled(), "{s}");
        }
        assert!(!LoanStatus::Active.is_settled());
        assert!(!LoanStatus::Overdue.is_settled());
        assert_eq!(LoanStatus::parse("past_due"), Some(LoanStatus::Overdue));
    }

    #[test]
    fn snapshot_decodes_with_missing_sections() {
        let snap: DeviceSnapshot =
            serde_json::from_str(r#"{"identity":{"serial_number":"SN1"}}"#).expect("parse");
        assert_eq!(snap.identity.serial_number, "SN1");
        assert!(snap.loan.is_none());
        assert!(!snap.security.rooted);
    }
}
