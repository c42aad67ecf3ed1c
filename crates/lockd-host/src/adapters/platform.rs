//! File-backed platform adapters for hosts without a device-owner API.
//!
//! The platform directory is the contract with whatever agent owns the
//! hardware: it writes `device.json` and `capability.json`, and reads back
//! `enforcement.json` and `lockscreen.json`, which this module keeps current.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, PoisonError};

use lockd_kernel::{
    DeviceError, DevicePolicy, DeviceSensor, LockPresenter, LockView, PackageInstaller,
    Restrictions,
};
use lockd_types::{CapabilityFlags, DeviceSnapshot, EpochMs, LockReason, LockState, WipeScope};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

pub const DEVICE_FILE: &str = "device.json";
pub const CAPABILITY_FILE: &str = "capability.json";
pub const ENFORCEMENT_FILE: &str = "enforcement.json";
pub const LOCKSCREEN_FILE: &str = "lockscreen.json";

/// What the platform agent is asked to enforce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enforcement {
    pub state: LockState,
    pub camera_disabled: bool,
    pub usb_disabled: bool,
    pub developer_options_disabled: bool,
    /// Bumped on every lock-now request.
    pub lock_now_requests: u64,
    pub wipe_requested: Option<WipeScope>,
    pub reboot_requested: bool,
    pub management_released: bool,
}

impl Default for Enforcement {
    fn default() -> Self {
        Self {
            state: LockState::Unlocked,
            camera_disabled: false,
            usb_disabled: false,
            developer_options_disabled: false,
            lock_now_requests: 0,
            wipe_requested: None,
            reboot_requested: false,
            management_released: false,
        }
    }
}

impl Enforcement {
    fn restrictions(&self) -> Restrictions {
        Restrictions {
            camera_disabled: self.camera_disabled,
            usb_disabled: self.usb_disabled,
            developer_options_disabled: self.developer_options_disabled,
        }
    }

    fn set_restrictions(&mut self, r: Restrictions) {
        self.camera_disabled = r.camera_disabled;
        self.usb_disabled = r.usb_disabled;
        self.developer_options_disabled = r.developer_options_disabled;
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, DeviceError> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| DeviceError::Failed(format!("{}: {e}", path.display()))),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(DeviceError::Failed(format!("{}: {err}", path.display()))),
    }
}

/// Write-then-rename so the agent never reads a torn file.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), DeviceError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| DeviceError::Failed(e.to_string()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| DeviceError::Failed(format!("{}: {e}", parent.display())))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).map_err(|e| DeviceError::Failed(format!("{}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| DeviceError::Failed(format!("{}: {e}", path.display())))
}

/// [`DevicePolicy`] that records enforcement in `enforcement.json` and reads
/// the capability the platform agent reports in `capability.json`.
#[derive(Debug)]
pub struct FilePolicy {
    dir: PathBuf,
    enforcement: Mutex<Enforcement>,
}

impl FilePolicy {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, DeviceError> {
        let dir = dir.into();
        let enforcement = read_json(&dir.join(ENFORCEMENT_FILE))?.unwrap_or_default();
        Ok(Self {
            dir,
            enforcement: Mutex::new(enforcement),
        })
    }

    pub fn enforcement(&self) -> Enforcement {
        self.enforcement.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update(&self, f: impl FnOnce(&mut Enforcement)) -> Result<(), DeviceError> {
        let mut guard = self.enforcement.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        f(&mut next);
        write_json(&self.dir.join(ENFORCEMENT_FILE), &next)?;
        *guard = next;
        Ok(())
    }

    fn capability(&self) -> Result<CapabilityFlags, DeviceError> {
        Ok(read_json(&self.dir.join(CAPABILITY_FILE))?.unwrap_or_else(CapabilityFlags::all))
    }
}

impl DevicePolicy for FilePolicy {
    fn enforce(&self, state: LockState) -> Result<(), DeviceError> {
        if state != LockState::Unlocked && !self.capability()?.remote_lock {
            return Err(DeviceError::PermissionDenied("remote lock is not granted".into()));
        }
        tracing::info!(state = ?state, "enforcing lock state");
        self.update(|e| e.state = state)
    }

    fn lock_now(&self) -> Result<(), DeviceError> {
        if !self.capability()?.capability_active {
            return Err(DeviceError::PermissionDenied("device management is not active".into()));
        }
        self.update(|e| e.lock_now_requests += 1)
    }

    fn set_restrictions(&self, restrictions: Restrictions) -> Result<(), DeviceError> {
        tracing::info!(?restrictions, "applying restrictions");
        self.update(|e| e.set_restrictions(restrictions))
    }

    fn wipe(&self, scope: WipeScope) -> Result<(), DeviceError> {
        tracing::warn!(scope = ?scope, "wipe requested");
        self.update(|e| e.wipe_requested = Some(scope))
    }

    fn reboot(&self) -> Result<(), DeviceError> {
        tracing::warn!("reboot requested");
        self.update(|e| e.reboot_requested = true)
    }

    fn check_capability(&self) -> Result<CapabilityFlags, DeviceError> {
        self.capability()
    }

    fn rebind_capability(&self) -> Result<(), DeviceError> {
        // The agent rebinds when it sees the enforcement record rewritten.
        let current = self.enforcement();
        self.update(|e| *e = current)
    }

    fn reapply_restrictions(&self) -> Result<(), DeviceError> {
        let restrictions = self.enforcement().restrictions();
        self.update(|e| e.set_restrictions(Restrictions::default()))?;
        self.update(|e| e.set_restrictions(restrictions))
    }

    fn release_management(&self) -> Result<(), DeviceError> {
        tracing::info!("device management released by backend");
        self.update(|e| e.management_released = true)
    }
}

/// Reads the snapshot the platform agent maintains in `device.json`.
#[derive(Debug, Clone)]
pub struct FileSensor {
    path: PathBuf,
}

impl FileSensor {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(DEVICE_FILE),
        }
    }
}

impl DeviceSensor for FileSensor {
    fn snapshot(&self) -> Result<DeviceSnapshot, DeviceError> {
        read_json(&self.path)?.ok_or_else(|| {
            DeviceError::Unsupported(format!("no device snapshot at {}", self.path.display()))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockScreen {
    pub state: LockState,
    pub lock_id: Option<String>,
    pub reason: Option<LockReason>,
    pub message: String,
    pub support_contact: Option<String>,
    pub pin_allowed: bool,
    pub dismissible: bool,
    pub expires_at_ms: Option<EpochMs>,
    #[serde(default)]
    pub warning: Option<String>,
}

impl From<&LockView> for LockScreen {
    fn from(view: &LockView) -> Self {
        Self {
            state: view.state,
            lock_id: view.lock_id.clone(),
            reason: view.reason,
            message: view.message.clone(),
            support_contact: view.support_contact.clone(),
            pin_allowed: view.pin_allowed,
            dismissible: view.dismissible,
            expires_at_ms: view.expires_at_ms,
            warning: None,
        }
    }
}

/// Publishes the lock screen to `lockscreen.json` for the UI agent.
#[derive(Debug)]
pub struct FilePresenter {
    path: PathBuf,
    last: Mutex<Option<LockScreen>>,
}

impl FilePresenter {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(LOCKSCREEN_FILE),
            last: Mutex::new(None),
        }
    }

    fn publish(&self, screen: LockScreen) {
        if let Err(err) = write_json(&self.path, &screen) {
            tracing::error!(%err, "lock screen not published");
        }
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(screen);
    }
}

impl LockPresenter for FilePresenter {
    fn present(&self, view: &LockView) {
        tracing::info!(state = ?view.state, lock_id = ?view.lock_id, "presenting lock screen");
        self.publish(LockScreen::from(view));
    }

    fn warn(&self, message: &str, expires_at_ms: Option<EpochMs>) {
        tracing::info!(warning = message, "presenting warning");
        let mut screen = self
            .last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| LockScreen {
                state: LockState::Unlocked,
                lock_id: None,
                reason: None,
                message: String::new(),
                support_contact: None,
                pin_allowed: false,
                dismissible: true,
                expires_at_ms: None,
                warning: None,
            });
        screen.warning = Some(message.to_string());
        if screen.state == LockState::Unlocked {
            screen.expires_at_ms = expires_at_ms;
        }
        self.publish(screen);
    }
}

/// Installs a staged package by running a configured program with the
/// artifact path appended.
#[derive(Debug, Clone, Default)]
pub struct CommandInstaller {
    argv: Option<Vec<String>>,
}

impl CommandInstaller {
    pub fn new(argv: Option<Vec<String>>) -> Self {
        Self {
            argv: argv.filter(|a| !a.is_empty()),
        }
    }
}

impl PackageInstaller for CommandInstaller {
    fn install(&self, artifact: &Path, package: Option<&str>) -> Result<(), DeviceError> {
        let Some((program, args)) = self.argv.as_ref().and_then(|a| a.split_first()) else {
            return Err(DeviceError::Unsupported("no install command configured".into()));
        };
        let mut cmd = Command::new(program);
        cmd.args(args).arg(artifact);
        if let Some(package) = package {
            cmd.env("LOCKD_PACKAGE", package);
        }
        let status = cmd
            .status()
            .map_err(|e| DeviceError::Failed(format!("spawn {program}: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(DeviceError::Failed(format!("{program} exited with {status}")))
        }
    }
}
