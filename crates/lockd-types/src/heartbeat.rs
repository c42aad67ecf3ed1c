//! Heartbeat request wire shape. Field names follow the backend's device
//! endpoint, which is flat rather than nested.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::device::DeviceSnapshot;
use crate::digest::Digest;
use crate::lock::LockState;
use crate::EpochMs;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub device_id: String,
    pub serial_number: String,
    pub android_id: String,
    pub device_fingerprint: String,
    pub device_imeis: Vec<String>,
    pub model: String,
    pub manufacturer: String,
    pub installed_ram: String,
    pub total_storage: String,
    pub is_device_rooted: bool,
    pub is_usb_debugging_enabled: bool,
    pub is_developer_mode_enabled: bool,
    pub is_bootloader_unlocked: bool,
    pub is_custom_rom: bool,
    pub installed_apps_hash: String,
    pub system_properties_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loan_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loan_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_payment_due: Option<EpochMs>,
    pub lock_state: Option<LockState>,
    pub timestamp: EpochMs,
    pub nonce: String,
    /// Base64 device signature. Empty while the body hash is computed.
    #[serde(default)]
    pub signature: String,
}

impl HeartbeatRequest {
    pub fn from_snapshot(
        device_id: &str,
        snapshot: &DeviceSnapshot,
        lock_state: LockState,
        timestamp: EpochMs,
        nonce: String,
    ) -> Self {
        let loan = snapshot.loan.as_ref();
        Self {
            device_id: device_id.to_string(),
            serial_number: snapshot.identity.serial_number.clone(),
            android_id: snapshot.identity.android_id.clone(),
            device_fingerprint: snapshot.identity.device_fingerprint.clone(),
            device_imeis: snapshot.identity.imeis.clone(),
            model: snapshot.identity.model.clone(),
            manufacturer: snapshot.identity.manufacturer.clone(),
            installed_ram: snapshot.resources.installed_ram.clone(),
            total_storage: snapshot.resources.total_storage.clone(),
            is_device_rooted: snapshot.security.rooted,
            is_usb_debugging_enabled: snapshot.security.usb_debugging,
            is_developer_mode_enabled: snapshot.security.developer_mode,
            is_bootloader_unlocked: snapshot.security.bootloader_unlocked,
            is_custom_rom: snapshot.security.custom_rom,
            installed_apps_hash: Digest::of_sorted_strings(&snapshot.installed_apps).to_hex(),
            system_properties_hash: Digest::of_sorted_strings(&snapshot.system_properties).to_hex(),
            latitude: snapshot.location.map(|l| l.latitude),
            longitude: snapshot.location.map(|l| l.longitude),
            battery_level: snapshot.battery_level,
            loan_number: loan.map(|l| l.loan_number.clone()).filter(|n| !n.is_empty()),
            loan_status: loan.map(|l| l.status.as_str().to_string()),
            next_payment_due: loan.and_then(|l| l.next_due_at_ms),
            lock_state: Some(lock_state),
            timestamp,
            nonce,
            signature: String::new(),
        }
    }

    /// Digest of the request with the signature blanked.
    pub fn body_hash(&self) -> Result<Digest, serde_cbor::Error> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        Digest::of_cbor(&unsigned)
    }

    /// `device_id|timestamp|nonce|body_hash`
    pub fn signing_payload(&self) -> Result<String, serde_cbor::Error> {
        Ok(format!(
            "{}|{}|{}|{}",
            self.device_id,
            self.timestamp,
            self.nonce,
            self.body_hash()?.to_hex()
        ))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextPayment {
    #[serde(default)]
    pub date_time: String,
    #[serde(default)]
    pub unlock_password: Option<String>,
}

impl NextPayment {
    /// Accepts RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS` taken as UTC.
    pub fn due_at_ms(&self) -> Option<EpochMs> {
        let raw = self.date_time.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return u64::try_from(dt.timestamp_millis()).ok();
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .and_then(|naive| u64::try_from(naive.and_utc().timestamp_millis()).ok())
    }
}
