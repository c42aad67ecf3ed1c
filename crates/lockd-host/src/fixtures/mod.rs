//! Host wiring over the kernel's in-memory collaborators, for tests and
//! dry runs. Storage is real (encrypted files under a caller-owned dir).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lockd_kernel::testkit::{
    MemFetcher, MockDevice, RecordingInstaller, RecordingPresenter, RecordingSink,
    ScriptedTransport, StaticSensor, TestBackend,
};
use lockd_kernel::{Clock, Collaborators, Ed25519Signer, ManualClock};
use lockd_types::{DeviceSnapshot, EpochMs};

use crate::config::{HostConfig, Intervals};
use crate::error::HostError;
use crate::host::DeviceHost;

pub const DEVICE_ID: &str = "dev-host-1";
pub const NOW: EpochMs = 1_700_000_000_000;

pub fn snapshot() -> DeviceSnapshot {
    let mut snap = DeviceSnapshot::default();
    snap.identity.serial_number = "SN-7781".into();
    snap.identity.device_fingerprint = "acme/tablet/v3:14/user".into();
    snap.identity.imeis = vec!["356938035643809".into()];
    snap.resources.installed_ram = "4 GB".into();
    snap.resources.total_storage = "64 GB".into();
    snap
}

/// Handles onto every mock behind a [`Collaborators`] set.
pub struct Mocks {
    pub device: Arc<MockDevice>,
    pub presenter: Arc<RecordingPresenter>,
    pub sensor: Arc<StaticSensor>,
    pub transport: Arc<ScriptedTransport>,
    pub sink: Arc<RecordingSink>,
    pub fetcher: Arc<MemFetcher>,
    pub installer: Arc<RecordingInstaller>,
    pub backend: TestBackend,
}

impl Default for Mocks {
    fn default() -> Self {
        Self {
            device: Arc::new(MockDevice::new()),
            presenter: Arc::new(RecordingPresenter::default()),
            sensor: Arc::new(StaticSensor::new(snapshot())),
            transport: Arc::new(ScriptedTransport::default()),
            sink: Arc::new(RecordingSink::default()),
            fetcher: Arc::new(MemFetcher::default()),
            installer: Arc::new(RecordingInstaller::default()),
            backend: TestBackend::default(),
        }
    }
}

impl Mocks {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            device: self.device.clone(),
            presenter: self.presenter.clone(),
            sensor: self.sensor.clone(),
            verifier: Arc::new(self.backend.verifier()),
            signer: Arc::new(Ed25519Signer::from_seed(&[3u8; 32])),
            transport: self.transport.clone(),
            fetcher: self.fetcher.clone(),
            installer: self.installer.clone(),
            alert_sink: self.sink.clone(),
        }
    }
}

/// Config rooted at `data_dir` with short daemon timers. Heartbeat and
/// self-check are pushed out so tests trigger them explicitly.
pub fn test_config(data_dir: &Path, backend: &TestBackend) -> HostConfig {
    let mut config = HostConfig {
        data_dir: data_dir.to_path_buf(),
        device_id: DEVICE_ID.into(),
        backend_public_key: Some(backend.public_key_hex()),
        support_contact: Some("+1 555 0199".into()),
        intervals: Intervals {
            executor: Duration::from_millis(20),
            heartbeat: Duration::from_secs(3600),
            self_check: Duration::from_secs(3600),
        },
        ..HostConfig::default()
    };
    config.recovery.backoff.base_ms = 0;
    config
}

/// A [`DeviceHost`] over mocks, plus everything a test needs to drive it.
pub struct TestHost {
    pub host: DeviceHost,
    pub mocks: Mocks,
    pub clock: ManualClock,
}

impl TestHost {
    pub fn open(data_dir: &Path) -> Result<Self, HostError> {
        let mocks = Mocks::default();
        let clock = ManualClock::new(NOW);
        let config = test_config(data_dir, &mocks.backend);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let host = DeviceHost::open_with(config, mocks.collaborators(), shared)?;
        Ok(Self { host, mocks, clock })
    }
}
