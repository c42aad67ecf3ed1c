//! Lock state authority. The only writer of the active-lock map.
//!
//! Triggers, the executor, the heartbeat protocol and recovery all submit
//! locks here. Each mutation persists first, then recomputes the derived
//! `LockState`; the device primitive runs only when that state changes and
//! the presenter only when what it would show changes.

use lockd_store::LockStore;
use lockd_types::{
    Digest, DeviceLock, EpochMs, Incident, IncidentKind, LockOrigin, LockState, LockType, Severity,
    ValidationError,
};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::audit::{AuditLog, LockTransition, TransitionAction};
use crate::clock::Clock;
use crate::device::{DevicePolicy, LockPresenter, LockView};
use crate::error::KernelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockChange {
    pub before: LockState,
    pub after: LockState,
    /// False when the request was a no-op (identical lock already active, or
    /// nothing to remove).
    pub applied: bool,
}

impl LockChange {
    pub fn state_changed(&self) -> bool {
        self.before != self.after
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PinOutcome {
    Unlocked,
    Rejected { remaining: u32 },
    /// Too many wrong PINs; the lock now clears only from the backend.
    LockedOut,
    NotPermitted,
    NotFound,
}

pub struct LockAuthority {
    locks: LockStore,
    device: Arc<dyn DevicePolicy>,
    presenter: Arc<dyn LockPresenter>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    support_contact: Option<String>,
    guard: Mutex<Option<LockView>>,
}

impl std::fmt::Debug for LockAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockAuthority")
            .field("state", &self.locks.state())
            .field("locks", &self.locks)
            .finish()
    }
}

impl LockAuthority {
    pub fn new(
        locks: LockStore,
        device: Arc<dyn DevicePolicy>,
        presenter: Arc<dyn LockPresenter>,
        audit: AuditLog,
        clock: Arc<dyn Clock>,
        support_contact: Option<String>,
    ) -> Self {
        Self {
            locks,
            device,
            presenter,
            audit,
            clock,
            support_contact,
            guard: Mutex::new(None),
        }
    }

    fn enter(&self) -> MutexGuard<'_, Option<LockView>> {
        self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> LockState {
        self.locks.state()
    }

    pub fn locks(&self) -> Vec<DeviceLock> {
        self.locks.all()
    }

    pub fn get(&self, id: &str) -> Option<DeviceLock> {
        self.locks.get(id)
    }

    pub fn has_origin(&self, origin: LockOrigin) -> bool {
        self.locks.all().iter().any(|l| l.origin == origin && l.is_active())
    }

    /// What the lock screen should currently show.
    pub fn view(&self) -> LockView {
        self.compose_view(&self.locks.all())
    }

    /// Persist `lock` keyed by id, replacing any same-id lock.
    pub fn apply_lock(&self, mut lock: DeviceLock) -> Result<LockChange, KernelError> {
        lock.validate()?;
        let mut presented = self.enter();
        let before = self.locks.state();
        let existing = self.locks.get(&lock.id);
        if let Some(current) = existing.as_ref() {
            if current.is_active() && current.same_effect(&lock) {
                return Ok(LockChange {
                    before,
                    after: before,
                    applied: false,
                });
            }
            if current.pin_digest.is_some() && current.pin_digest == lock.pin_digest {
                lock.failed_attempts = current.failed_attempts;
            }
        }
        let id = lock.id.clone();
        self.locks.upsert(lock)?;
        let after = self.locks.state();
        self.audit.transition(&LockTransition {
            lock_id: id,
            action: if existing.is_some() {
                TransitionAction::Replaced
            } else {
                TransitionAction::Applied
            },
            before,
            after,
            at_ms: self.clock.now_ms(),
        });
        self.sync(&mut presented, before, after);
        Ok(LockChange {
            before,
            after,
            applied: true,
        })
    }

    /// Removing an unknown id is a successful no-op.
    pub fn remove_lock(&self, id: &str) -> Result<LockChange, KernelError> {
        self.remove_matching(|l| l.id == id, TransitionAction::Removed)
            .map(|(change, _)| change)
    }

    pub fn remove_origin(&self, origins: &[LockOrigin]) -> Result<Vec<DeviceLock>, KernelError> {
        self.remove_matching(|l| origins.contains(&l.origin), TransitionAction::Removed)
            .map(|(_, removed)| removed)
    }

    pub fn remove_all(&self) -> Result<Vec<DeviceLock>, KernelError> {
        self.remove_matching(|_| true, TransitionAction::Removed)
            .map(|(_, removed)| removed)
    }

    /// Drop locks whose expiry has passed.
    pub fn expire(&self, now_ms: EpochMs) -> Result<Vec<DeviceLock>, KernelError> {
        self.remove_matching(|l| l.is_expired(now_ms), TransitionAction::Expired)
            .map(|(_, removed)| removed)
    }

    /// Returns `Ok(false)` when no lock has this id.
    pub fn dismiss(&self, id: &str) -> Result<bool, KernelError> {
        let Some(lock) = self.locks.get(id) else {
            return Ok(false);
        };
        if !lock.dismissible || lock.lock_type == LockType::Hard {
            let err = ValidationError::InvalidLock(format!("lock '{id}' is not dismissible"));
            return Err(err.into());
        }
        self.remove_matching(|l| l.id == id, TransitionAction::Dismissed)?;
        Ok(true)
    }

    pub fn pin_unlock(&self, id: &str, pin: &str) -> Result<PinOutcome, KernelError> {
        let mut presented = self.enter();
        let Some(mut lock) = self.locks.get(id) else {
            return Ok(PinOutcome::NotFound);
        };
        let Some(expected) = lock.pin_digest.clone() else {
            return Ok(PinOutcome::NotPermitted);
        };
        if !lock.pin_required || lock.backend_unlock_only {
            return Ok(PinOutcome::NotPermitted);
        }
        let now = self.clock.now_ms();
        let before = self.locks.state();
        if Digest::of_bytes(pin.trim().as_bytes()).to_hex() == expected {
            self.locks.remove(id)?;
            let after = self.locks.state();
            self.audit.transition(&LockTransition {
                lock_id: id.to_string(),
                action: TransitionAction::PinUnlocked,
                before,
                after,
                at_ms: now,
            });
            self.sync(&mut presented, before, after);
            return Ok(PinOutcome::Unlocked);
        }

        lock.failed_attempts += 1;
        let outcome = if lock.max_attempts > 0 && lock.failed_attempts >= lock.max_attempts {
            lock.pin_required = false;
            lock.pin_digest = None;
            lock.dismissible = false;
            lock.backend_unlock_only = true;
            PinOutcome::LockedOut
        } else {
            PinOutcome::Rejected {
                remaining: lock.max_attempts.saturating_sub(lock.failed_attempts),
            }
        };
        let attempts = lock.failed_attempts;
        self.locks.upsert(lock)?;
        let after = self.locks.state();
        match outcome {
            PinOutcome::LockedOut => {
                self.audit.incident(
                    Incident::new(
                        IncidentKind::PinRejected,
                        Severity::High,
                        format!("PIN rejected {attempts} times; lock escalated to backend-only"),
                        now,
                    )
                    .with_subject(id),
                );
                self.audit.transition(&LockTransition {
                    lock_id: id.to_string(),
                    action: TransitionAction::Escalated,
                    before,
                    after,
                    at_ms: now,
                });
            }
            _ => self.audit.incident(
                Incident::new(IncidentKind::PinRejected, Severity::Medium, "incorrect PIN", now)
                    .with_subject(id),
            ),
        }
        self.sync(&mut presented, before, after);
        Ok(outcome)
    }

    /// Re-drive the primitive and presenter from persisted state. Called at
    /// startup, before any network activity.
    pub fn reassert(&self) {
        let mut presented = self.enter();
        let state = self.locks.state();
        log::info!("reasserting lock state {state} ({} active locks)", self.locks.all().len());
        self.enforce(state);
        let view = self.compose_view(&self.locks.all());
        self.presenter.present(&view);
        *presented = Some(view);
    }

    fn remove_matching(
        &self,
        matches: impl Fn(&DeviceLock) -> bool,
        action: TransitionAction,
    ) -> Result<(LockChange, Vec<DeviceLock>), KernelError> {
        let mut presented = self.enter();
        let before = self.locks.state();
        let targets: Vec<String> = self
            .locks
            .all()
            .into_iter()
            .filter(|l| matches(l))
            .map(|l| l.id)
            .collect();
        let now = self.clock.now_ms();
        let mut removed = Vec::with_capacity(targets.len());
        for id in targets {
            let step_before = self.locks.state();
            if let Some(lock) = self.locks.remove(&id)? {
                self.audit.transition(&LockTransition {
                    lock_id: id,
                    action,
                    before: step_before,
                    after: self.locks.state(),
                    at_ms: now,
                });
                removed.push(lock);
            }
        }
        let after = self.locks.state();
        if !removed.is_empty() {
            self.sync(&mut presented, before, after);
        }
        Ok((
            LockChange {
                before,
                after,
                applied: !removed.is_empty(),
            },
            removed,
        ))
    }

    fn sync(&self, presented: &mut Option<LockView>, before: LockState, after: LockState) {
        if before != after {
            self.enforce(after);
            let (kind, severity) = if after > before {
                (IncidentKind::LockApplied, Severity::Info)
            } else {
                (IncidentKind::LockRemoved, Severity::Info)
            };
            self.audit.incident(Incident::new(
                kind,
                severity,
                format!("lock state {before} -> {after}"),
                self.clock.now_ms(),
            ));
        }
        let view = self.compose_view(&self.locks.all());
        if presented.as_ref() != Some(&view) {
            self.presenter.present(&view);
            *presented = Some(view);
        }
    }

    fn enforce(&self, state: LockState) {
        if let Err(err) = self.device.enforce(state) {
            let err = KernelError::from(err);
            log::error!("device lock primitive failed for {state}: {err}");
            self.audit.incident(err.to_incident(self.clock.now_ms()));
        }
    }

    fn compose_view(&self, locks: &[DeviceLock]) -> LockView {
        let state = LockState::derive(locks);
        let primary = locks
            .iter()
            .filter(|l| l.is_active())
            .max_by_key(|l| {
                (l.lock_type == LockType::Hard, l.backend_unlock_only, l.created_at_ms)
            });
        match primary {
            None => LockView {
                state,
                lock_id: None,
                reason: None,
                message: String::new(),
                support_contact: None,
                pin_allowed: false,
                dismissible: false,
                expires_at_ms: None,
            },
            Some(lock) => {
                let strict = lock.lock_type == LockType::Hard || lock.backend_unlock_only;
                LockView {
                    state,
                    lock_id: Some(lock.id.clone()),
                    reason: Some(lock.reason),
                    message: if lock.message.is_empty() {
                        lock.reason.describe().to_string()
                    } else {
                        lock.message.clone()
                    },
                    support_contact: if strict { self.support_contact.clone() } else { None },
                    pin_allowed: lock.pin_required && !lock.backend_unlock_only,
                    dismissible: lock.dismissible,
                    expires_at_ms: lock.expires_at_ms,
                }
            }
        }
    }
}
