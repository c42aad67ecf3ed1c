use lockd_store::{CommandQueue, HeartbeatState, Slot};
use lockd_types::{
    DeviceLock, Digest, EpochMs, Incident, IncidentKind, LoanSnapshot, LoanStatus, LockOrigin,
    LockReason, LockState, Severity,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::{HeartbeatDirective, HeartbeatTransport, compose, parse};
use crate::audit::AuditLog;
use crate::authority::LockAuthority;
use crate::clock::Clock;
use crate::device::{DevicePolicy, DeviceSensor};
use crate::error::{KernelError, NetworkError, queue_rejection};
use crate::signing::DeviceSigner;
use crate::triggers::payment;

pub const BACKEND_LOCK_ID: &str = "backend.heartbeat";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleOutcome {
    pub blocked: bool,
    pub deactivated: bool,
    pub enqueued: usize,
    pub rejected: usize,
    pub state_before: Option<LockState>,
    pub state_after: Option<LockState>,
}

pub struct ProtocolParts {
    pub transport: Arc<dyn HeartbeatTransport>,
    pub signer: Arc<dyn DeviceSigner>,
    pub sensor: Arc<dyn DeviceSensor>,
    pub authority: Arc<LockAuthority>,
    pub queue: Arc<CommandQueue>,
    pub device: Arc<dyn DevicePolicy>,
    pub audit: AuditLog,
    pub clock: Arc<dyn Clock>,
    pub state: Arc<Slot<HeartbeatState>>,
    pub loan: Arc<Slot<LoanSnapshot>>,
}

pub struct HeartbeatProtocol {
    parts: ProtocolParts,
    device_id: String,
    send_timeout: Duration,
    reminder_window_ms: u64,
}

impl std::fmt::Debug for HeartbeatProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatProtocol")
            .field("device_id", &self.device_id)
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}

impl HeartbeatProtocol {
    pub fn new(
        parts: ProtocolParts,
        device_id: impl Into<String>,
        send_timeout: Duration,
        reminder_window_ms: u64,
    ) -> Self {
        Self {
            parts,
            device_id: device_id.into(),
            send_timeout,
            reminder_window_ms,
        }
    }

    pub fn state(&self) -> HeartbeatState {
        self.parts.state.get().unwrap_or_default()
    }

    /// One compose → send → parse → apply cycle. A send or decode failure is
    /// recorded and returned as `KernelError::Network`; lock state is left
    /// exactly as it was.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, KernelError> {
        let p = &self.parts;
        let now = p.clock.now_ms();
        let snapshot = p.sensor.snapshot()?;
        let state = p.authority.state();
        let request = compose(&self.device_id, &snapshot, state, now, p.signer.as_ref())?;

        let sent = tokio::time::timeout(self.send_timeout, p.transport.send(&request)).await;
        let response = match sent {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout(self.send_timeout.as_millis() as u64)),
        };
        let directive = match response.and_then(|body| parse(&body)) {
            Ok(directive) => directive,
            Err(err) => {
                self.record_failure(&err, now);
                return Err(err.into());
            }
        };
        self.record_success(now);
        self.apply(directive, now)
    }

    fn record_failure(&self, err: &NetworkError, now: EpochMs) {
        let p = &self.parts;
        let failures = p
            .state
            .update(|s| {
                s.last_attempt_ms = Some(now);
                s.consecutive_failures += 1;
                s.last_error = Some(err.to_string());
                s.consecutive_failures
            })
            .unwrap_or_else(|store_err| {
                log::error!("heartbeat state not persisted: {store_err}");
                0
            });
        p.audit.incident(
            Incident::new(
                IncidentKind::HeartbeatFailed,
                Severity::Medium,
                format!("heartbeat failed ({failures} in a row): {err}"),
                now,
            ),
        );
    }

    fn record_success(&self, now: EpochMs) {
        let result = self.parts.state.update(|s| {
            s.last_attempt_ms = Some(now);
            s.last_success_ms = Some(now);
            s.consecutive_failures = 0;
            s.last_error = None;
        });
        if let Err(err) = result {
            log::error!("heartbeat state not persisted: {err}");
        }
    }

    /// Apply a fully parsed directive.
    pub fn apply(
        &self,
        directive: HeartbeatDirective,
        now: EpochMs,
    ) -> Result<CycleOutcome, KernelError> {
        let p = &self.parts;
        let mut outcome = CycleOutcome {
            state_before: Some(p.authority.state()),
            ..Default::default()
        };

        if directive.should_block() {
            outcome.blocked = true;
            let reason_text = directive.lock_reason.clone();
            let reason = reason_text
                .as_deref()
                .map(LockReason::from_backend_text)
                .unwrap_or(if directive.has_high_severity_mismatch() {
                    LockReason::DeviceMismatch
                } else {
                    LockReason::AdminAction
                });
            let message = reason_text.unwrap_or_else(|| reason.describe().to_string());
            let lock = DeviceLock::hard(
                BACKEND_LOCK_ID,
                reason,
                LockOrigin::Network,
                message.as_str(),
                now,
            );
            if p.authority.apply_lock(lock)?.applied {
                p.audit.incident(
                    Incident::new(IncidentKind::HeartbeatBlocked, Severity::High, message, now)
                        .with_subject(BACKEND_LOCK_ID),
                );
            }
        } else {
            p.authority.remove_lock(BACKEND_LOCK_ID)?;
        }

        if let Some(status) = directive.loan_status {
            self.update_loan(|loan| loan.status = status)?;
        }
        if let Some(payment) = directive.next_payment.as_ref() {
            let due = payment.due_at_ms();
            if due.is_none() && !payment.date_time.trim().is_empty() {
                log::warn!("next_payment.date_time '{}' not understood", payment.date_time);
            }
            let pin = payment
                .unlock_password
                .as_deref()
                .map(str::trim)
                .filter(|pw| !pw.is_empty())
                .map(|pw| Digest::of_bytes(pw.as_bytes()).to_hex());
            self.update_loan(|loan| {
                if due.is_some() {
                    loan.next_due_at_ms = due;
                    loan.days_overdue = 0;
                }
                if pin.is_some() {
                    loan.unlock_pin_digest = pin;
                }
            })?;
        }

        if directive.deactivation_requested && !outcome.blocked {
            outcome.deactivated = true;
            let removed = p.authority.remove_origin(&[LockOrigin::Payment, LockOrigin::Network])?;
            self.update_loan(|loan| {
                if !loan.status.is_settled() {
                    loan.status = LoanStatus::FullyPaid;
                }
            })?;
            p.audit.incident(Incident::new(
                IncidentKind::Deactivation,
                Severity::Info,
                format!("backend requested deactivation; {} lock(s) released", removed.len()),
                now,
            ));
            if let Err(err) = p.device.release_management() {
                let err = KernelError::from(err);
                p.audit.incident(err.to_incident(now));
            }
        } else if let Some(loan) = p.loan.get() {
            payment::apply(&p.authority, &loan, now, self.reminder_window_ms)?;
        }

        for command in directive.commands {
            let wire = match command {
                Ok(wire) => wire,
                Err(err) => {
                    outcome.rejected += 1;
                    p.audit.incident(Incident::new(
                        IncidentKind::CommandRejected,
                        Severity::Medium,
                        format!("undecodable command: {err}"),
                        now,
                    ));
                    continue;
                }
            };
            let id = wire.id.clone();
            match p.queue.enqueue_wire(wire, now) {
                Ok(cmd) => {
                    log::info!("queued command {} ({})", cmd.id, cmd.kind);
                    outcome.enqueued += 1;
                }
                Err(err) => {
                    outcome.rejected += 1;
                    p.audit.incident(queue_rejection(&err, &id, now));
                }
            }
        }

        outcome.state_after = Some(p.authority.state());
        Ok(outcome)
    }

    /// Only updates an existing loan record; the sensor is the source of loan
    /// identity.
    fn update_loan(&self, f: impl FnOnce(&mut LoanSnapshot)) -> Result<(), KernelError> {
        let Some(mut loan) = self.parts.loan.get() else {
            return Ok(());
        };
        f(&mut loan);
        self.parts.loan.set(loan)?;
        Ok(())
    }
}
