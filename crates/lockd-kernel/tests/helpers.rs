#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use lockd_kernel::testkit::{
    MemFetcher, MockDevice, RecordingInstaller, RecordingPresenter, RecordingSink,
    ScriptedTransport, StaticSensor, TestBackend,
};
use lockd_kernel::{
    Backoff, Collaborators, DeviceKernel, Ed25519Signer, KernelConfig, ManualClock, RecoveryPolicy,
};
use lockd_store::{DynStore, MemJournal, MemStore};
use lockd_types::{DeviceSnapshot, EpochMs, LoanSnapshot, LoanStatus};
use tempfile::TempDir;

pub const DEVICE_ID: &str = "dev-1";
pub const NOW: EpochMs = 1_700_000_000_000;
pub const DAY: u64 = 24 * 60 * 60 * 1000;

pub fn snapshot() -> DeviceSnapshot {
    let mut snap = DeviceSnapshot::default();
    snap.identity.serial_number = "SN-0042".into();
    snap.identity.device_fingerprint = "acme/phone/v1:14/user".into();
    snap.identity.imeis = vec!["356938035643809".into(), "356938035643817".into()];
    snap.resources.installed_ram = "6 GB".into();
    snap.resources.total_storage = "128 GB".into();
    snap
}

pub fn loan(
    status: LoanStatus,
    next_due_at_ms: Option<EpochMs>,
    days_overdue: u32,
) -> LoanSnapshot {
    LoanSnapshot {
        loan_number: "LN-7".into(),
        status,
        next_due_at_ms,
        days_overdue,
        unlock_pin_digest: None,
    }
}

/// A kernel over in-memory stores with every collaborator recorded.
pub struct Harness {
    pub kernel: DeviceKernel,
    pub device: Arc<MockDevice>,
    pub presenter: Arc<RecordingPresenter>,
    pub sensor: Arc<StaticSensor>,
    pub transport: Arc<ScriptedTransport>,
    pub sink: Arc<RecordingSink>,
    pub fetcher: Arc<MemFetcher>,
    pub installer: Arc<RecordingInstaller>,
    pub backend: TestBackend,
    pub clock: ManualClock,
    pub store: DynStore,
    pub journal: Arc<MemJournal>,
    pub staging: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemStore::new()), Arc::new(MemJournal::new()))
    }

    pub fn with_store(store: DynStore, journal: Arc<MemJournal>) -> Self {
        let device = Arc::new(MockDevice::new());
        let presenter = Arc::new(RecordingPresenter::default());
        let sensor = Arc::new(StaticSensor::new(snapshot()));
        let transport = Arc::new(ScriptedTransport::default());
        let sink = Arc::new(RecordingSink::default());
        let fetcher = Arc::new(MemFetcher::default());
        let installer = Arc::new(RecordingInstaller::default());
        let backend = TestBackend::default();
        let clock = ManualClock::new(NOW);
        let staging = TempDir::new().expect("staging dir");

        let kernel = DeviceKernel::open(
            store.clone(),
            journal.clone(),
            Collaborators {
                device: device.clone(),
                presenter: presenter.clone(),
                sensor: sensor.clone(),
                verifier: Arc::new(backend.verifier()),
                signer: Arc::new(Ed25519Signer::from_seed(&[7u8; 32])),
                transport: transport.clone(),
                fetcher: fetcher.clone(),
                installer: installer.clone(),
                alert_sink: sink.clone(),
            },
            KernelConfig {
                device_id: DEVICE_ID.into(),
                support_contact: Some("+1 555 0100".into()),
                staging_dir: staging.path().join("updates"),
                heartbeat_timeout: Duration::from_secs(2),
                recovery: RecoveryPolicy {
                    backoff: Backoff {
                        base_ms: 0,
                        ..RecoveryPolicy::default().backoff
                    },
                    ..Default::default()
                },
                ..Default::default()
            },
            Arc::new(clock.clone()),
        )
        .expect("open kernel");
        kernel.start().expect("start");

        Self {
            kernel,
            device,
            presenter,
            sensor,
            transport,
            sink,
            fetcher,
            installer,
            backend,
            clock,
            store,
            journal,
            staging,
        }
    }

    /// Simulate a process restart over the same persisted state.
    pub fn restart(self) -> Self {
        Self::with_store(self.store.clone(), self.journal.clone())
    }
}
