//! Platform collaborators. The kernel decides; these traits act on the device.

use async_trait::async_trait;
use lockd_types::{CapabilityFlags, DeviceSnapshot, EpochMs, LockReason, LockState, WipeScope};
use std::path::Path;
use thiserror::Error;

use crate::error::NetworkError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("operation not supported: {0}")]
    Unsupported(String),
    #[error("privileged capability refused: {0}")]
    PermissionDenied(String),
    #[error("device operation failed: {0}")]
    Failed(String),
}

/// Restrictions applied on CRITICAL escalation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Restrictions {
    pub camera_disabled: bool,
    pub usb_disabled: bool,
    pub developer_options_disabled: bool,
}

impl Restrictions {
    pub fn lockdown() -> Self {
        Self {
            camera_disabled: true,
            usb_disabled: true,
            developer_options_disabled: true,
        }
    }
}

/// Elevated device-management capability.
pub trait DevicePolicy: Send + Sync {
    /// Device-lock primitive: bring enforcement in line with `state`.
    fn enforce(&self, state: LockState) -> Result<(), DeviceError>;
    /// Immediate screen lock.
    fn lock_now(&self) -> Result<(), DeviceError>;
    fn set_restrictions(&self, restrictions: Restrictions) -> Result<(), DeviceError>;
    fn wipe(&self, scope: WipeScope) -> Result<(), DeviceError>;
    fn reboot(&self) -> Result<(), DeviceError>;
    fn check_capability(&self) -> Result<CapabilityFlags, DeviceError>;
    fn rebind_capability(&self) -> Result<(), DeviceError>;
    /// Clear and re-apply the restriction set last applied.
    fn reapply_restrictions(&self) -> Result<(), DeviceError>;
    /// Backend signalled the loan is settled; management may stand down.
    fn release_management(&self) -> Result<(), DeviceError>;
}

/// What the lock screen shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockView {
    pub state: LockState,
    pub lock_id: Option<String>,
    pub reason: Option<LockReason>,
    pub message: String,
    /// Shown for hard and backend-only locks.
    pub support_contact: Option<String>,
    pub pin_allowed: bool,
    pub dismissible: bool,
    pub expires_at_ms: Option<EpochMs>,
}

pub trait LockPresenter: Send + Sync {
    fn present(&self, view: &LockView);
    fn warn(&self, message: &str, expires_at_ms: Option<EpochMs>);
}

pub trait PackageInstaller: Send + Sync {
    fn install(&self, artifact: &Path, package: Option<&str>) -> Result<(), DeviceError>;
}

/// Downloads an update into the staging path. Returns bytes written.
#[async_trait]
pub trait PackageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, NetworkError>;
}

/// Raw device-info collection.
pub trait DeviceSensor: Send + Sync {
    fn snapshot(&self) -> Result<DeviceSnapshot, DeviceError>;
}
