//! The device kernel: owns every store handle and wires the components
//! together. Hosts drive it on their own schedule; nothing here spawns.

use lockd_store::{
    AlertOutbox, CommandQueue, DEFAULT_OUTBOX_CAPACITY, DEFAULT_VERIFICATION_HISTORY, DynStore,
    HeartbeatState, Journal, LockStore, QueueLimits, Slot, VerificationLog,
};
use lockd_types::{
    DeviceLock, DeviceSnapshot, IdentityBaseline, Incident, LoanSnapshot, LockState, OfflineCommand,
    Severity, TamperKind, VerificationStatus, WireCommand,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditLog, LockTransition};
use crate::authority::{LockAuthority, PinOutcome};
use crate::clock::Clock;
use crate::device::{DevicePolicy, DeviceSensor, LockPresenter, PackageFetcher, PackageInstaller};
use crate::error::{KernelError, queue_rejection};
use crate::executor::{CommandExecutor, ExecutorParts, Processed};
use crate::heartbeat::{
    AlertSink, CycleOutcome, HeartbeatProtocol, HeartbeatTransport, ProtocolParts,
};
use crate::recovery::{RecoveryManager, RecoveryParts, RecoveryPolicy};
use crate::signing::{CommandVerifier, DeviceSigner};
use crate::triggers::payment::{self, DEFAULT_REMINDER_WINDOW_MS, PaymentDecision};
use crate::triggers::{TriggerContext, mismatch, tamper};

const HEARTBEAT_STATE_KEY: &str = "heartbeat-state";
const LOAN_KEY: &str = "loan-snapshot";
const BASELINE_KEY: &str = "identity-baseline";

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub device_id: String,
    pub support_contact: Option<String>,
    /// Private directory for update downloads.
    pub staging_dir: PathBuf,
    pub reminder_window_ms: u64,
    pub queue_limits: QueueLimits,
    pub outbox_capacity: usize,
    pub verification_history: usize,
    pub heartbeat_timeout: Duration,
    pub recovery: RecoveryPolicy,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            support_contact: None,
            staging_dir: std::env::temp_dir().join("lockd-staging"),
            reminder_window_ms: DEFAULT_REMINDER_WINDOW_MS,
            queue_limits: QueueLimits::default(),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            verification_history: DEFAULT_VERIFICATION_HISTORY,
            heartbeat_timeout: Duration::from_secs(30),
            recovery: RecoveryPolicy::default(),
        }
    }
}

/// Platform and network collaborators supplied by the host.
pub struct Collaborators {
    pub device: Arc<dyn DevicePolicy>,
    pub presenter: Arc<dyn LockPresenter>,
    pub sensor: Arc<dyn DeviceSensor>,
    pub verifier: Arc<dyn CommandVerifier>,
    pub signer: Arc<dyn DeviceSigner>,
    pub transport: Arc<dyn HeartbeatTransport>,
    pub fetcher: Arc<dyn PackageFetcher>,
    pub installer: Arc<dyn PackageInstaller>,
    pub alert_sink: Arc<dyn AlertSink>,
}

/// What one local trigger pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerReport {
    pub expired: Vec<String>,
    pub tampered: Vec<TamperKind>,
    pub enrolled: bool,
    pub identifier_mismatch: bool,
    pub payment: Option<PaymentDecision>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeartbeatReport {
    pub cycle: CycleOutcome,
    pub processed: Vec<Processed>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KernelStatus {
    pub device_id: String,
    pub lock_state: LockState,
    pub locks: Vec<DeviceLock>,
    pub pending_commands: usize,
    pub queued_alerts: usize,
    pub heartbeat: HeartbeatState,
    pub verification: Option<VerificationStatus>,
    pub loan: Option<LoanSnapshot>,
}

pub struct DeviceKernel {
    config: KernelConfig,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
    device: Arc<dyn DevicePolicy>,
    sensor: Arc<dyn DeviceSensor>,
    alert_sink: Arc<dyn AlertSink>,
    authority: Arc<LockAuthority>,
    queue: Arc<CommandQueue>,
    outbox: Arc<AlertOutbox>,
    loan: Arc<Slot<LoanSnapshot>>,
    baseline: Slot<IdentityBaseline>,
    executor: CommandExecutor,
    heartbeat: HeartbeatProtocol,
    recovery: RecoveryManager,
}

impl std::fmt::Debug for DeviceKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKernel")
            .field("device_id", &self.config.device_id)
            .field("authority", &self.authority)
            .field("queue", &self.queue)
            .field("outbox", &self.outbox)
            .finish()
    }
}

impl DeviceKernel {
    /// Load every persisted record. Needs no network; call [`Self::start`]
    /// next to re-drive the lock screen.
    pub fn open(
        store: DynStore,
        journal: Arc<dyn Journal>,
        collaborators: Collaborators,
        config: KernelConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, KernelError> {
        if config.device_id.trim().is_empty() {
            return Err(KernelError::Execution("device id is not configured".into()));
        }
        let Collaborators {
            device,
            presenter,
            sensor,
            verifier,
            signer,
            transport,
            fetcher,
            installer,
            alert_sink,
        } = collaborators;

        let audit = AuditLog::new(journal);
        let authority = Arc::new(LockAuthority::new(
            LockStore::open(store.clone())?,
            device.clone(),
            presenter.clone(),
            audit.clone(),
            clock.clone(),
            config.support_contact.clone(),
        ));
        let queue = Arc::new(CommandQueue::open(store.clone(), config.queue_limits)?);
        let outbox = Arc::new(AlertOutbox::open(store.clone(), config.outbox_capacity)?);
        let loan = Arc::new(Slot::open(store.clone(), LOAN_KEY)?);
        let baseline = Slot::open(store.clone(), BASELINE_KEY)?;

        let executor = CommandExecutor::new(
            ExecutorParts {
                queue: queue.clone(),
                authority: authority.clone(),
                verifier,
                device: device.clone(),
                presenter,
                fetcher,
                installer,
                audit: audit.clone(),
                clock: clock.clone(),
            },
            config.device_id.as_str(),
            config.staging_dir.clone(),
        );
        let heartbeat = HeartbeatProtocol::new(
            ProtocolParts {
                transport,
                signer,
                sensor: sensor.clone(),
                authority: authority.clone(),
                queue: queue.clone(),
                device: device.clone(),
                audit: audit.clone(),
                clock: clock.clone(),
                state: Arc::new(Slot::open(store.clone(), HEARTBEAT_STATE_KEY)?),
                loan: loan.clone(),
            },
            config.device_id.as_str(),
            config.heartbeat_timeout,
            config.reminder_window_ms,
        );
        let recovery = RecoveryManager::new(
            RecoveryParts {
                device: device.clone(),
                authority: authority.clone(),
                outbox: outbox.clone(),
                log: Arc::new(VerificationLog::open(store, config.verification_history)?),
                audit: audit.clone(),
                clock: clock.clone(),
            },
            config.recovery,
            config.device_id.as_str(),
        );

        Ok(Self {
            config,
            clock,
            audit,
            device,
            sensor,
            alert_sink,
            authority,
            queue,
            outbox,
            loan,
            baseline,
            executor,
            heartbeat,
            recovery,
        })
    }

    /// Boot-time reassertion: persisted locks are enforced before any
    /// network activity, then stale expiries are dropped.
    pub fn start(&self) -> Result<(), KernelError> {
        self.authority.reassert();
        let expired = self.authority.expire(self.clock.now_ms())?;
        if !expired.is_empty() {
            log::info!("{} lock(s) expired while the device was down", expired.len());
        }
        Ok(())
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn authority(&self) -> &LockAuthority {
        &self.authority
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn outbox(&self) -> &AlertOutbox {
        &self.outbox
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn heartbeat(&self) -> &HeartbeatProtocol {
        &self.heartbeat
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    pub fn lock_state(&self) -> LockState {
        self.authority.state()
    }

    /// Record an incident raised outside the kernel, such as storage repair
    /// at open.
    pub fn record_incident(&self, incident: Incident) {
        self.audit.incident(incident);
    }

    pub fn incidents(&self, min: Severity) -> Vec<Incident> {
        self.audit.incidents(min)
    }

    pub fn transitions(&self) -> Vec<LockTransition> {
        self.audit.transitions()
    }

    pub fn status(&self) -> KernelStatus {
        KernelStatus {
            device_id: self.config.device_id.clone(),
            lock_state: self.authority.state(),
            locks: self.authority.locks(),
            pending_commands: self.queue.pending_count(),
            queued_alerts: self.outbox.len(),
            heartbeat: self.heartbeat.state(),
            verification: self.recovery.last_status(),
            loan: self.loan.get(),
        }
    }

    /// Run the tamper, mismatch and payment triggers against a fresh snapshot.
    pub fn evaluate_local_triggers(&self) -> Result<TriggerReport, KernelError> {
        let now = self.clock.now_ms();
        let mut report = TriggerReport::default();
        let snapshot = self.sensor.snapshot()?;
        let ctx = TriggerContext {
            authority: &self.authority,
            device: self.device.as_ref(),
            outbox: &self.outbox,
            audit: &self.audit,
            device_id: &self.config.device_id,
            now_ms: now,
        };

        report.tampered = tamper::apply(&ctx, &snapshot.security)?;

        match self.baseline.get().filter(|b| !b.is_empty()) {
            Some(baseline) => {
                let assessment = mismatch::apply(&ctx, &baseline, &snapshot)?;
                report.identifier_mismatch = assessment.has_identifier_mismatch();
            }
            None => {
                let enrolled = IdentityBaseline::from_snapshot(&snapshot);
                if !enrolled.is_empty() {
                    log::info!("identity baseline enrolled (serial '{}')", enrolled.serial_number);
                    self.baseline.set(enrolled)?;
                    report.enrolled = true;
                }
            }
        }

        if let Some(loan) = self.merge_loan(&snapshot)? {
            let window = self.config.reminder_window_ms;
            report.payment = Some(payment::apply(&self.authority, &loan, now, window)?);
        }
        // Last, so an expired reminder is replaced before it is dropped.
        report.expired = self.authority.expire(now)?.into_iter().map(|l| l.id).collect();
        Ok(report)
    }

    /// The sensor reports loan identity and overdue days; due date, PIN and a
    /// backend-confirmed settlement come from heartbeats and are kept.
    fn merge_loan(&self, snapshot: &DeviceSnapshot) -> Result<Option<LoanSnapshot>, KernelError> {
        let stored = self.loan.get();
        let Some(mut observed) = snapshot.loan.clone() else {
            return Ok(stored);
        };
        if let Some(stored) = stored.filter(|s| s.loan_number == observed.loan_number) {
            if observed.next_due_at_ms.is_none() {
                observed.next_due_at_ms = stored.next_due_at_ms;
            }
            if observed.unlock_pin_digest.is_none() {
                observed.unlock_pin_digest = stored.unlock_pin_digest;
            }
            if stored.status.is_settled() {
                observed.status = stored.status;
            }
        }
        self.loan.set(observed.clone())?;
        Ok(Some(observed))
    }

    /// Local triggers, one heartbeat exchange, then an immediate drain when
    /// the response delivered commands. A trigger failure is journaled and
    /// does not hold back the exchange.
    pub async fn heartbeat_cycle(&self) -> Result<HeartbeatReport, KernelError> {
        if let Err(err) = self.evaluate_local_triggers() {
            log::warn!("local trigger pass failed: {err}");
            self.audit.incident(err.to_incident(self.clock.now_ms()));
        }
        let cycle = self.heartbeat.run_cycle().await?;
        let processed = if cycle.enqueued > 0 {
            self.executor.drain_all().await?
        } else {
            Vec::new()
        };
        Ok(HeartbeatReport { cycle, processed })
    }

    /// Accept a command that arrived outside a heartbeat (push or import)
    /// and dispatch everything pending.
    pub async fn receive_command(
        &self,
        wire: WireCommand,
    ) -> Result<(OfflineCommand, Vec<Processed>), KernelError> {
        let now = self.clock.now_ms();
        let id = wire.id.clone();
        let cmd = match self.queue.enqueue_wire(wire, now) {
            Ok(cmd) => cmd,
            Err(err) => {
                self.audit.incident(queue_rejection(&err, &id, now));
                return Err(err.into());
            }
        };
        let processed = self.executor.drain_all().await?;
        Ok((cmd, processed))
    }

    pub fn pin_unlock(&self, lock_id: &str, pin: &str) -> Result<PinOutcome, KernelError> {
        self.authority.pin_unlock(lock_id, pin)
    }

    /// Deliver queued alerts oldest first. Stops at the first failure so an
    /// offline device does not burn attempts on every entry.
    pub async fn flush_alerts(&self) -> usize {
        let mut delivered = 0;
        for alert in self.outbox.pending() {
            match self.alert_sink.deliver(&alert).await {
                Ok(()) => {
                    if let Err(err) = self.outbox.ack(&alert.id) {
                        log::error!("alert {} delivered but not acknowledged: {err}", alert.id);
                    }
                    delivered += 1;
                }
                Err(err) => {
                    log::warn!("alert {} ({}) not delivered: {err}", alert.id, alert.kind);
                    if let Err(err) = self.outbox.record_attempt(&alert.id) {
                        log::error!("alert {} attempt not recorded: {err}", alert.id);
                    }
                    break;
                }
            }
        }
        delivered
    }
}
