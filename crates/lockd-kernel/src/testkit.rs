//! In-memory collaborators for tests and dry runs.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use lockd_store::Alert;
use lockd_types::{
    CapabilityFlags, CommandKind, DeviceSnapshot, EpochMs, HeartbeatRequest, LockState, WipeScope,
    WireCommand,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::device::{
    DeviceError, DevicePolicy, DeviceSensor, LockPresenter, LockView, PackageFetcher,
    PackageInstaller, Restrictions,
};
use crate::error::NetworkError;
use crate::heartbeat::{AlertSink, HeartbeatTransport};
use crate::signing::{DeviceSigner, Ed25519Signer, Ed25519Verifier};

fn guard<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Enforce(LockState),
    LockNow,
    Restrictions(Restrictions),
    Wipe(WipeScope),
    Reboot,
    CheckCapability,
    Rebind,
    Reapply,
    Release,
}

/// Which recovery strategy restores the capability on the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealOn {
    Rebind,
    Reapply,
    LockNow,
}

#[derive(Debug)]
pub struct MockDevice {
    calls: Mutex<Vec<DeviceCall>>,
    capability: Mutex<CapabilityFlags>,
    capability_error: AtomicBool,
    fail_enforce: AtomicBool,
    heal_on: Mutex<Option<HealOn>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            capability: Mutex::new(CapabilityFlags::all()),
            capability_error: AtomicBool::new(false),
            fail_enforce: AtomicBool::new(false),
            heal_on: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        guard(&self.calls).clone()
    }

    pub fn enforce_calls(&self) -> Vec<LockState> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DeviceCall::Enforce(state) => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: &DeviceCall) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn set_capability(&self, flags: CapabilityFlags) {
        *guard(&self.capability) = flags;
    }

    pub fn revoke_capability(&self) {
        self.set_capability(CapabilityFlags::default());
    }

    pub fn set_capability_error(&self, fail: bool) {
        self.capability_error.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_enforce(&self, fail: bool) {
        self.fail_enforce.store(fail, Ordering::SeqCst);
    }

    pub fn heal_on(&self, strategy: Option<HealOn>) {
        *guard(&self.heal_on) = strategy;
    }

    fn record(&self, call: DeviceCall) {
        guard(&self.calls).push(call);
    }

    fn maybe_heal(&self, step: HealOn) {
        if *guard(&self.heal_on) == Some(step) {
            self.set_capability(CapabilityFlags::all());
        }
    }
}

impl DevicePolicy for MockDevice {
    fn enforce(&self, state: LockState) -> Result<(), DeviceError> {
        self.record(DeviceCall::Enforce(state));
        if self.fail_enforce.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied("device admin inactive".into()));
        }
        Ok(())
    }

    fn lock_now(&self) -> Result<(), DeviceError> {
        self.record(DeviceCall::LockNow);
        self.maybe_heal(HealOn::LockNow);
        Ok(())
    }

    fn set_restrictions(&self, restrictions: Restrictions) -> Result<(), DeviceError> {
        self.record(DeviceCall::Restrictions(restrictions));
        Ok(())
    }

    fn wipe(&self, scope: WipeScope) -> Result<(), DeviceError> {
        self.record(DeviceCall::Wipe(scope));
        Ok(())
    }

    fn reboot(&self) -> Result<(), DeviceError> {
        self.record(DeviceCall::Reboot);
        Ok(())
    }

    fn check_capability(&self) -> Result<CapabilityFlags, DeviceError> {
        self.record(DeviceCall::CheckCapability);
        if self.capability_error.load(Ordering::SeqCst) {
            return Err(DeviceError::Failed("capability check raised".into()));
        }
        Ok(*guard(&self.capability))
    }

    fn rebind_capability(&self) -> Result<(), DeviceError> {
        self.record(DeviceCall::Rebind);
        self.maybe_heal(HealOn::Rebind);
        Ok(())
    }

    fn reapply_restrictions(&self) -> Result<(), DeviceError> {
        self.record(DeviceCall::Reapply);
        self.maybe_heal(HealOn::Reapply);
        Ok(())
    }

    fn release_management(&self) -> Result<(), DeviceError> {
        self.record(DeviceCall::Release);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingPresenter {
    views: Mutex<Vec<LockView>>,
    warnings: Mutex<Vec<(String, Option<EpochMs>)>>,
}

impl RecordingPresenter {
    pub fn views(&self) -> Vec<LockView> {
        guard(&self.views).clone()
    }

    pub fn last(&self) -> Option<LockView> {
        guard(&self.views).last().cloned()
    }

    pub fn warnings(&self) -> Vec<(String, Option<EpochMs>)> {
        guard(&self.warnings).clone()
    }
}

impl LockPresenter for RecordingPresenter {
    fn present(&self, view: &LockView) {
        guard(&self.views).push(view.clone());
    }

    fn warn(&self, message: &str, expires_at_ms: Option<EpochMs>) {
        guard(&self.warnings).push((message.to_string(), expires_at_ms));
    }
}

/// Sensor returning whatever snapshot the test last set.
#[derive(Debug, Default)]
pub struct StaticSensor {
    snapshot: Mutex<DeviceSnapshot>,
}

impl StaticSensor {
    pub fn new(snapshot: DeviceSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    pub fn set(&self, snapshot: DeviceSnapshot) {
        *guard(&self.snapshot) = snapshot;
    }

    pub fn update(&self, f: impl FnOnce(&mut DeviceSnapshot)) {
        f(&mut guard(&self.snapshot));
    }
}

impl DeviceSensor for StaticSensor {
    fn snapshot(&self) -> Result<DeviceSnapshot, DeviceError> {
        Ok(guard(&self.snapshot).clone())
    }
}

/// Replays queued responses in order; an empty script means "unreachable".
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<Value, NetworkError>>>,
    sent: Mutex<Vec<HeartbeatRequest>>,
}

impl ScriptedTransport {
    pub fn push(&self, response: Result<Value, NetworkError>) {
        guard(&self.responses).push_back(response);
    }

    pub fn sent(&self) -> Vec<HeartbeatRequest> {
        guard(&self.sent).clone()
    }
}

#[async_trait]
impl HeartbeatTransport for ScriptedTransport {
    async fn send(&self, request: &HeartbeatRequest) -> Result<Value, NetworkError> {
        guard(&self.sent).push(request.clone());
        guard(&self.responses)
            .pop_front()
            .unwrap_or_else(|| Err(NetworkError::Unreachable("no scripted response".into())))
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<Alert>>,
    fail: AtomicBool,
}

impl RecordingSink {
    pub fn delivered(&self) -> Vec<Alert> {
        guard(&self.delivered).clone()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn deliver(&self, alert: &Alert) -> Result<(), NetworkError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NetworkError::Unreachable("sink offline".into()));
        }
        guard(&self.delivered).push(alert.clone());
        Ok(())
    }
}

/// Serves artifacts from memory, keyed by URL.
#[derive(Debug, Default)]
pub struct MemFetcher {
    artifacts: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemFetcher {
    pub fn insert(&self, url: impl Into<String>, bytes: Vec<u8>) {
        guard(&self.artifacts).insert(url.into(), bytes);
    }
}

#[async_trait]
impl PackageFetcher for MemFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, NetworkError> {
        let bytes = guard(&self.artifacts)
            .get(url)
            .cloned()
            .ok_or(NetworkError::Status { status: 404 })?;
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| NetworkError::Unreachable(e.to_string()))?;
        Ok(bytes.len() as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
    pub artifact: PathBuf,
    pub package: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct RecordingInstaller {
    installs: Mutex<Vec<Installed>>,
    fail: AtomicBool,
}

impl RecordingInstaller {
    pub fn installs(&self) -> Vec<Installed> {
        guard(&self.installs).clone()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl PackageInstaller for RecordingInstaller {
    fn install(&self, artifact: &Path, package: Option<&str>) -> Result<(), DeviceError> {
        let bytes = std::fs::read(artifact).map_err(|e| DeviceError::Failed(e.to_string()))?;
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeviceError::Failed("installer refused package".into()));
        }
        guard(&self.installs).push(Installed {
            artifact: artifact.to_path_buf(),
            package: package.map(str::to_string),
            bytes,
        });
        Ok(())
    }
}

/// Stand-in for the backend's command signing key.
pub struct TestBackend {
    signer: Ed25519Signer,
}

impl std::fmt::Debug for TestBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestBackend").field("signer", &self.signer).finish()
    }
}

impl Default for TestBackend {
    fn default() -> Self {
        Self::from_seed([42u8; 32])
    }
}

impl TestBackend {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signer: Ed25519Signer::from_seed(&seed),
        }
    }

    pub fn public_key_hex(&self) -> String {
        self.signer.public_key_hex()
    }

    pub fn verifier(&self) -> Ed25519Verifier {
        Ed25519Verifier::from_bytes(self.signer.verifying_key().as_bytes())
            .unwrap_or_else(|e| panic!("test key invalid: {e}"))
    }

    /// Build and sign a command addressed to `device_id`.
    pub fn command(
        &self,
        id: &str,
        kind: &str,
        device_id: &str,
        params: &[(&str, &str)],
    ) -> WireCommand {
        let mut wire = WireCommand {
            id: id.to_string(),
            kind: kind.to_string(),
            device_id: device_id.to_string(),
            parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            issued_at: 1_000,
            sequence_number: 1,
            nonce: format!("nonce-{id}"),
            ..Default::default()
        };
        self.sign(&mut wire);
        wire
    }

    pub fn sign(&self, wire: &mut WireCommand) {
        let kind = CommandKind::parse(&wire.kind)
            .map(|k| k.wire_name().to_string())
            .unwrap_or_else(|| wire.kind.clone());
        let payload = format!(
            "{}|{}|{}|{}|{}",
            wire.id, kind, wire.issued_at, wire.sequence_number, wire.nonce
        );
        wire.signature = BASE64.encode(self.signer.sign(payload.as_bytes()));
    }
}

/// Bytes that pass the package well-formedness check.
pub fn fake_apk(len: usize) -> Vec<u8> {
    let mut bytes = b"PK\x03\x04".to_vec();
    bytes.resize(len.max(4), 0x5a);
    bytes
}
