//! Local trigger passes: payment, tamper and identity mismatch.

#[path = "helpers.rs"]
mod helpers;

use helpers::{DAY, Harness, NOW, loan};
use lockd_kernel::PinOutcome;
use lockd_kernel::testkit::DeviceCall;
use lockd_kernel::triggers::mismatch::{CRITICAL_LOCK_ID, IDENTITY_LOCK_ID};
use lockd_kernel::triggers::payment::{OVERDUE_LOCK_ID, PaymentDecision, REMINDER_LOCK_ID};
use lockd_kernel::{Restrictions, TriggerReport};
use lockd_types::{
    IncidentKind, LoanStatus, LockOrigin, LockReason, LockState, LockType, Severity, TamperKind,
    WipeScope,
};

#[test]
fn overdue_loan_hard_locks_without_pin() -> anyhow::Result<()> {
    let h = Harness::new();
    h.sensor
        .update(|snap| snap.loan = Some(loan(LoanStatus::Overdue, Some(NOW - 20 * DAY), 20)));
    let report = h.kernel.evaluate_local_triggers()?;
    assert!(matches!(report.payment, Some(PaymentDecision::Overdue(_))));

    let lock = h.kernel.authority().get(OVERDUE_LOCK_ID).expect("overdue lock");
    assert_eq!(lock.lock_type, LockType::Hard);
    assert_eq!(lock.reason, LockReason::PaymentOverdue);
    assert!(!lock.pin_required);
    assert!(lock.backend_unlock_only);
    assert!(!lock.dismissible);
    assert_eq!(lock.expires_at_ms, None);
    assert_eq!(h.kernel.pin_unlock(OVERDUE_LOCK_ID, "1234")?, PinOutcome::NotPermitted);

    let view = h.presenter.last().expect("presented");
    assert_eq!(view.state, LockState::HardLock);
    assert_eq!(view.support_contact.as_deref(), Some("+1 555 0100"));
    assert!(!view.pin_allowed);
    Ok(())
}

#[test]
fn upcoming_payment_soft_locks_until_due() -> anyhow::Result<()> {
    let h = Harness::new();
    let due = NOW + DAY;
    h.sensor
        .update(|snap| snap.loan = Some(loan(LoanStatus::Active, Some(due), 0)));
    h.kernel.evaluate_local_triggers()?;

    let lock = h.kernel.authority().get(REMINDER_LOCK_ID).expect("reminder");
    assert_eq!(lock.lock_type, LockType::Soft);
    assert!(lock.dismissible);
    assert_eq!(lock.expires_at_ms, Some(due));
    assert_eq!(h.kernel.lock_state(), LockState::SoftLock);

    assert!(h.kernel.authority().dismiss(REMINDER_LOCK_ID)?);
    assert_eq!(h.kernel.lock_state(), LockState::Unlocked);
    Ok(())
}

#[test]
fn reminder_turns_into_overdue_without_unlocking() -> anyhow::Result<()> {
    let h = Harness::new();
    let due = NOW + DAY;
    h.sensor
        .update(|snap| snap.loan = Some(loan(LoanStatus::Active, Some(due), 0)));
    h.kernel.evaluate_local_triggers()?;

    h.clock.set(due + 1);
    let report = h.kernel.evaluate_local_triggers()?;
    assert!(matches!(report.payment, Some(PaymentDecision::Overdue(_))));
    assert!(h.kernel.authority().get(REMINDER_LOCK_ID).is_none());
    assert_eq!(
        h.device.enforce_calls(),
        vec![LockState::Unlocked, LockState::SoftLock, LockState::HardLock]
    );
    Ok(())
}

#[test]
fn distant_due_date_and_settled_loans_stay_unlocked() -> anyhow::Result<()> {
    let h = Harness::new();
    h.sensor
        .update(|snap| snap.loan = Some(loan(LoanStatus::Active, Some(NOW + 10 * DAY), 0)));
    let report = h.kernel.evaluate_local_triggers()?;
    assert_eq!(report.payment, Some(PaymentDecision::Clear));

    h.sensor
        .update(|snap| snap.loan = Some(loan(LoanStatus::Paid, Some(NOW - DAY), 4)));
    h.kernel.evaluate_local_triggers()?;
    assert_eq!(h.kernel.lock_state(), LockState::Unlocked);
    Ok(())
}

#[test]
fn tamper_locks_once_and_reports_once() -> anyhow::Result<()> {
    let h = Harness::new();
    h.sensor.update(|snap| snap.security.developer_mode = true);
    let report = h.kernel.evaluate_local_triggers()?;
    assert_eq!(report.tampered, vec![TamperKind::DeveloperOptions]);

    let lock = h.kernel.authority().get("tamper.developer_options").expect("tamper lock");
    assert_eq!(lock.reason, LockReason::DeveloperOptionsAttempt);
    assert_eq!(lock.tamper, Some(TamperKind::DeveloperOptions));
    assert_eq!(lock.origin, LockOrigin::Tamper);
    assert!(lock.backend_unlock_only);

    let again = h.kernel.evaluate_local_triggers()?;
    assert!(again.tampered.is_empty());
    assert_eq!(h.kernel.outbox().len(), 1);
    assert_eq!(
        h.kernel
            .incidents(Severity::High)
            .iter()
            .filter(|i| i.kind == IncidentKind::TamperDetected)
            .count(),
        1
    );

    // Turning the setting back off does not lift the lock.
    h.sensor.update(|snap| snap.security.developer_mode = false);
    h.kernel.evaluate_local_triggers()?;
    assert_eq!(h.kernel.lock_state(), LockState::HardLock);
    Ok(())
}

#[test]
fn first_pass_enrolls_identity_baseline() -> anyhow::Result<()> {
    let h = Harness::new();
    let first = h.kernel.evaluate_local_triggers()?;
    assert!(first.enrolled);
    let second = h.kernel.evaluate_local_triggers()?;
    assert_eq!(second, TriggerReport::default());
    Ok(())
}

#[test]
fn swapped_serial_hard_locks_without_escalation() -> anyhow::Result<()> {
    let h = Harness::new();
    h.kernel.evaluate_local_triggers()?;
    h.sensor.update(|snap| snap.identity.serial_number = "SN-9999".into());
    let report = h.kernel.evaluate_local_triggers()?;
    assert!(report.identifier_mismatch);

    let lock = h.kernel.authority().get(IDENTITY_LOCK_ID).expect("mismatch lock");
    assert_eq!(lock.reason, LockReason::DeviceMismatch);
    assert!(lock.message.contains("serial_number"));
    assert!(h.kernel.authority().get(CRITICAL_LOCK_ID).is_none());
    assert!(!h.device.calls().iter().any(|c| matches!(c, DeviceCall::Wipe(_))));
    Ok(())
}

#[test]
fn multiple_identifier_mismatches_escalate_once() -> anyhow::Result<()> {
    let h = Harness::new();
    h.kernel.evaluate_local_triggers()?;
    h.sensor.update(|snap| {
        snap.identity.serial_number = "SN-9999".into();
        snap.identity.device_fingerprint = "other/phone/v2:13/user".into();
    });
    h.kernel.evaluate_local_triggers()?;
    h.kernel.evaluate_local_triggers()?;

    assert!(h.kernel.authority().get(CRITICAL_LOCK_ID).is_some());
    assert_eq!(h.device.count(&DeviceCall::Restrictions(Restrictions::lockdown())), 1);
    assert_eq!(h.device.count(&DeviceCall::Wipe(WipeScope::SensitiveData)), 1);
    let alerts = h.kernel.outbox().pending();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, "device_mismatch");
    assert_eq!(alerts[0].severity, Severity::Critical);
    Ok(())
}

#[test]
fn foreign_imeis_count_as_clone() -> anyhow::Result<()> {
    let h = Harness::new();
    h.kernel.evaluate_local_triggers()?;
    h.sensor
        .update(|snap| snap.identity.imeis = vec!["490154203237518".into()]);
    h.kernel.evaluate_local_triggers()?;
    assert!(h.kernel.authority().get(CRITICAL_LOCK_ID).is_some());
    Ok(())
}
