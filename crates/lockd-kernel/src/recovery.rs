//! Privileged-capability self-verification and recovery.

use lockd_store::{AlertOutbox, VerificationLog};
use lockd_types::{
    CapabilityFlags, DeviceLock, EpochMs, Incident, IncidentKind, LockOrigin, LockReason, Severity,
    VerificationResult, VerificationStatus,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::audit::AuditLog;
use crate::authority::LockAuthority;
use crate::clock::Clock;
use crate::device::{DeviceError, DevicePolicy};
use crate::error::KernelError;
use crate::heartbeat::Backoff;
use crate::triggers::TriggerContext;

pub const EMERGENCY_LOCK_ID: &str = "recovery.emergency";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Recovery runs allowed per window.
    pub max_attempts: u32,
    pub window_ms: u64,
    /// Pause between a strategy and its re-check, growing with each
    /// strategy tried in one run.
    pub backoff: Backoff,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            window_ms: 60 * 60 * 1000,
            backoff: Backoff {
                base_ms: 5_000,
                max_ms: 60_000,
                max_attempts: Strategy::ORDER.len() as u32,
            },
        }
    }
}

impl RecoveryPolicy {
    /// Pause after the `tried`-th strategy (1-based).
    pub fn pause_after(&self, tried: u32) -> Duration {
        let ms = self.backoff.delay_ms(tried).unwrap_or(self.backoff.max_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RebindCapability,
    ReapplyRestrictions,
    LockNowAndRecheck,
}

impl Strategy {
    pub const ORDER: [Strategy; 3] = [
        Strategy::RebindCapability,
        Strategy::ReapplyRestrictions,
        Strategy::LockNowAndRecheck,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Healthy,
    Recovered(Strategy),
    Exhausted,
    Throttled { retry_at_ms: EpochMs },
    InProgress,
}

pub struct RecoveryManager {
    device: Arc<dyn DevicePolicy>,
    authority: Arc<LockAuthority>,
    outbox: Arc<AlertOutbox>,
    log: Arc<VerificationLog>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    policy: RecoveryPolicy,
    device_id: String,
    in_progress: AtomicBool,
    attempts: Mutex<VecDeque<EpochMs>>,
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("policy", &self.policy)
            .field("in_progress", &self.in_progress.load(Ordering::SeqCst))
            .finish()
    }
}

struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct RecoveryParts {
    pub device: Arc<dyn DevicePolicy>,
    pub authority: Arc<LockAuthority>,
    pub outbox: Arc<AlertOutbox>,
    pub log: Arc<VerificationLog>,
    pub audit: AuditLog,
    pub clock: Arc<dyn Clock>,
}

impl RecoveryManager {
    pub fn new(parts: RecoveryParts, policy: RecoveryPolicy, device_id: impl Into<String>) -> Self {
        Self {
            device: parts.device,
            authority: parts.authority,
            outbox: parts.outbox,
            log: parts.log,
            audit: parts.audit,
            clock: parts.clock,
            policy,
            device_id: device_id.into(),
            in_progress: AtomicBool::new(false),
            attempts: Mutex::new(VecDeque::new()),
        }
    }

    pub fn policy(&self) -> RecoveryPolicy {
        self.policy
    }

    pub fn last_status(&self) -> Option<VerificationStatus> {
        self.log.last()
    }

    fn check(&self) -> (VerificationResult, CapabilityFlags, Option<String>) {
        match self.device.check_capability() {
            Ok(flags) => (flags.classify(), flags, None),
            Err(err) => (
                VerificationResult::Error,
                CapabilityFlags::default(),
                Some(err.to_string()),
            ),
        }
    }

    /// Check the capability and record the result.
    pub fn self_check(&self) -> VerificationStatus {
        let now = self.clock.now_ms();
        let (result, flags, message) = self.check();
        let previous = self.log.last().map(|s| s.consecutive_failures).unwrap_or(0);
        let consecutive_failures = match result {
            VerificationResult::Success => 0,
            _ => previous + 1,
        };
        let status = VerificationStatus {
            result,
            flags,
            consecutive_failures,
            checked_at_ms: now,
            message,
        };
        if let Err(err) = self.log.record(status.clone()) {
            log::error!("verification status not persisted: {err}");
        }
        let incident = match result {
            VerificationResult::Success => None,
            VerificationResult::Degraded => Some((
                IncidentKind::CapabilityDegraded,
                Severity::Medium,
                format!(
                    "capability degraded (remote_lock={}, password_policy={})",
                    flags.remote_lock, flags.password_policy
                ),
            )),
            VerificationResult::Failed => Some((
                IncidentKind::CapabilityLost,
                Severity::Critical,
                "privileged capability revoked".to_string(),
            )),
            VerificationResult::Error => Some((
                IncidentKind::CapabilityDegraded,
                Severity::Medium,
                format!("capability check raised: {}", status.message.as_deref().unwrap_or("")),
            )),
        };
        if let Some((kind, severity, details)) = incident {
            self.audit.incident(Incident::new(kind, severity, details, now));
        }
        status
    }

    /// Self-check, and recover when the capability is gone.
    pub async fn check_and_recover(&self) -> Result<RecoveryOutcome, KernelError> {
        let status = self.self_check();
        if status.result != VerificationResult::Failed {
            return Ok(RecoveryOutcome::Healthy);
        }
        self.recover().await
    }

    fn admit(&self, now: EpochMs) -> Result<(), EpochMs> {
        let mut attempts = self.attempts.lock().unwrap_or_else(|p| p.into_inner());
        while attempts.front().is_some_and(|at| now.saturating_sub(*at) >= self.policy.window_ms) {
            attempts.pop_front();
        }
        if attempts.len() >= self.policy.max_attempts as usize {
            let oldest = attempts.front().copied().unwrap_or(now);
            return Err(oldest + self.policy.window_ms);
        }
        attempts.push_back(now);
        Ok(())
    }

    /// Emergency-lock, then walk the strategies until the capability returns.
    /// The lock goes on before the attempt cap is consulted, so a throttled
    /// run still leaves the device locked.
    pub async fn recover(&self) -> Result<RecoveryOutcome, KernelError> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(RecoveryOutcome::InProgress);
        }
        let _guard = InProgress(&self.in_progress);

        let now = self.clock.now_ms();
        let reason = LockReason::CapabilityLost;
        self.authority.apply_lock(DeviceLock::hard(
            EMERGENCY_LOCK_ID,
            reason,
            LockOrigin::Recovery,
            reason.describe(),
            now,
        ))?;

        if let Err(retry_at_ms) = self.admit(now) {
            log::warn!("capability recovery throttled until {retry_at_ms}");
            self.audit.incident(Incident::new(
                IncidentKind::RecoveryAttempt,
                Severity::Medium,
                format!(
                    "recovery throttled: {} attempts within {} ms",
                    self.policy.max_attempts, self.policy.window_ms
                ),
                now,
            ));
            self.alert_capability_lost(
                now,
                json!({ "lock_id": EMERGENCY_LOCK_ID, "retry_at_ms": retry_at_ms }),
            );
            return Ok(RecoveryOutcome::Throttled { retry_at_ms });
        }

        for (tried, strategy) in (1u32..).zip(Strategy::ORDER) {
            self.audit.incident(Incident::new(
                IncidentKind::RecoveryAttempt,
                Severity::High,
                format!("trying {strategy:?}"),
                self.clock.now_ms(),
            ));
            if let Err(err) = self.run(strategy) {
                log::warn!("recovery strategy {strategy:?} failed: {err}");
            }
            let pause = self.policy.pause_after(tried);
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            if self.self_check().is_healthy() {
                self.authority.remove_lock(EMERGENCY_LOCK_ID)?;
                self.audit.incident(Incident::new(
                    IncidentKind::RecoveryAttempt,
                    Severity::Info,
                    format!("capability restored by {strategy:?}"),
                    self.clock.now_ms(),
                ));
                return Ok(RecoveryOutcome::Recovered(strategy));
            }
        }

        let now = self.clock.now_ms();
        self.audit.incident(Incident::new(
            IncidentKind::RecoveryExhausted,
            Severity::Critical,
            "all recovery strategies failed; device stays emergency-locked",
            now,
        ));
        self.alert_capability_lost(
            now,
            json!({ "lock_id": EMERGENCY_LOCK_ID, "strategies": Strategy::ORDER.len() }),
        );
        Ok(RecoveryOutcome::Exhausted)
    }

    fn alert_capability_lost(&self, now: EpochMs, details: serde_json::Value) {
        let ctx = TriggerContext {
            authority: &self.authority,
            device: self.device.as_ref(),
            outbox: &self.outbox,
            audit: &self.audit,
            device_id: &self.device_id,
            now_ms: now,
        };
        ctx.queue_alert("capability_lost", Severity::Critical, details);
    }

    fn run(&self, strategy: Strategy) -> Result<(), DeviceError> {
        match strategy {
            Strategy::RebindCapability => self.device.rebind_capability(),
            Strategy::ReapplyRestrictions => self.device.reapply_restrictions(),
            Strategy::LockNowAndRecheck => self.device.lock_now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testkit::{DeviceCall, HealOn, MockDevice, RecordingPresenter};
    use lockd_store::{LockStore, MemJournal, MemStore};

    struct Harness {
        manager: RecoveryManager,
        device: Arc<MockDevice>,
        authority: Arc<LockAuthority>,
        outbox: Arc<AlertOutbox>,
        clock: ManualClock,
    }

    fn harness() -> Harness {
        let store: lockd_store::DynStore = Arc::new(MemStore::new());
        let device = Arc::new(MockDevice::new());
        let clock = ManualClock::new(10_000);
        let audit = AuditLog::new(Arc::new(MemJournal::new()));
        let authority = Arc::new(LockAuthority::new(
            LockStore::open(store.clone()).expect("locks"),
            device.clone(),
            Arc::new(RecordingPresenter::default()),
            audit.clone(),
            Arc::new(clock.clone()),
            None,
        ));
        let outbox = Arc::new(AlertOutbox::open(store.clone(), 10).expect("outbox"));
        let manager = RecoveryManager::new(
            RecoveryParts {
                device: device.clone(),
                authority: authority.clone(),
                outbox: outbox.clone(),
                log: Arc::new(VerificationLog::open(store, 100).expect("log")),
                audit,
                clock: Arc::new(clock.clone()),
            },
            RecoveryPolicy {
                backoff: Backoff {
                    base_ms: 0,
                    ..RecoveryPolicy::default().backoff
                },
                ..Default::default()
            },
            "dev-1",
        );
        Harness {
            manager,
            device,
            authority,
            outbox,
            clock,
        }
    }

    #[tokio::test]
    async fn healthy_capability_needs_no_recovery() {
        let h = harness();
        assert_eq!(h.manager.check_and_recover().await.expect("check"), RecoveryOutcome::Healthy);
        assert!(h.authority.locks().is_empty());
    }

    #[tokio::test]
    async fn degraded_counts_failures_without_recovery() {
        let h = harness();
        h.device.set_capability(CapabilityFlags {
            capability_active: true,
            remote_lock: false,
            password_policy: true,
        });
        h.manager.check_and_recover().await.expect("check");
        h.manager.check_and_recover().await.expect("check");
        let last = h.manager.last_status().expect("status");
        assert_eq!(last.result, VerificationResult::Degraded);
        assert_eq!(last.consecutive_failures, 2);
        assert_eq!(h.device.count(&DeviceCall::Rebind), 0);
    }

    #[tokio::test]
    async fn capability_error_is_recorded_as_error() {
        let h = harness();
        h.device.set_capability_error(true);
        assert_eq!(h.manager.self_check().result, VerificationResult::Error);
    }

    #[tokio::test]
    async fn second_strategy_restores_and_clears_emergency_lock() {
        let h = harness();
        h.device.revoke_capability();
        h.device.heal_on(Some(HealOn::Reapply));
        let outcome = h.manager.check_and_recover().await.expect("recover");
        assert_eq!(outcome, RecoveryOutcome::Recovered(Strategy::ReapplyRestrictions));
        assert!(h.authority.get(EMERGENCY_LOCK_ID).is_none());
        assert_eq!(h.device.count(&DeviceCall::Rebind), 1);
        assert_eq!(h.device.count(&DeviceCall::LockNow), 0);
    }

    #[tokio::test]
    async fn exhaustion_keeps_emergency_lock_and_queues_alert() {
        let h = harness();
        h.device.revoke_capability();
        let outcome = h.manager.check_and_recover().await.expect("recover");
        assert_eq!(outcome, RecoveryOutcome::Exhausted);
        let lock = h.authority.get(EMERGENCY_LOCK_ID).expect("emergency lock");
        assert_eq!(lock.reason, LockReason::CapabilityLost);
        let alerts = h.outbox.pending();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert_eq!(alerts[0].kind, "capability_lost");
    }

    #[tokio::test]
    async fn throttled_run_still_locks_and_alerts() {
        let h = harness();
        h.device.heal_on(Some(HealOn::Rebind));
        for _ in 0..3 {
            h.device.revoke_capability();
            let outcome = h.manager.check_and_recover().await.expect("run");
            assert_eq!(outcome, RecoveryOutcome::Recovered(Strategy::RebindCapability));
            assert!(h.authority.get(EMERGENCY_LOCK_ID).is_none());
            h.clock.advance(60_000);
        }
        assert!(h.outbox.pending().is_empty());

        h.device.revoke_capability();
        let fourth = h.manager.check_and_recover().await.expect("run");
        assert!(matches!(fourth, RecoveryOutcome::Throttled { .. }));
        assert_eq!(h.authority.state(), lockd_types::LockState::HardLock);
        assert!(h.authority.get(EMERGENCY_LOCK_ID).is_some());
        let alerts = h.outbox.pending();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, "capability_lost");
        assert_eq!(alerts[0].severity, Severity::Critical);
    }

    #[test]
    fn strategy_pauses_grow_and_cap() {
        let policy = RecoveryPolicy::default();
        assert_eq!(policy.pause_after(1), Duration::from_secs(5));
        assert_eq!(policy.pause_after(2), Duration::from_secs(10));
        assert_eq!(policy.pause_after(3), Duration::from_secs(20));
        assert_eq!(policy.pause_after(9), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn attempts_are_capped_per_window() {
        let h = harness();
        h.device.revoke_capability();
        for _ in 0..3 {
            let outcome = h.manager.check_and_recover().await.expect("run");
            assert_eq!(outcome, RecoveryOutcome::Exhausted);
            h.clock.advance(60_000);
        }
        let fourth = h.manager.check_and_recover().await.expect("run");
        assert_eq!(
            fourth,
            RecoveryOutcome::Throttled {
                retry_at_ms: 10_000 + 60 * 60 * 1000
            }
        );
        h.clock.set(10_000 + 60 * 60 * 1000);
        assert_eq!(h.manager.check_and_recover().await.expect("run"), RecoveryOutcome::Exhausted);
    }
}
