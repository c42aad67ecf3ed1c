//! Heartbeat exchange applied through the kernel.

#[path = "helpers.rs"]
mod helpers;

use helpers::{DAY, DEVICE_ID, Harness, NOW, loan};
use lockd_kernel::heartbeat::BACKEND_LOCK_ID;
use lockd_kernel::testkit::DeviceCall;
use lockd_kernel::triggers::payment::{OVERDUE_LOCK_ID, REMINDER_LOCK_ID};
use lockd_kernel::{KernelError, NetworkError, PinOutcome};
use lockd_types::{
    CommandStatus, DeviceLock, IncidentKind, LoanStatus, LockOrigin, LockReason, LockState,
    LockType, Severity,
};
use serde_json::json;

#[tokio::test]
async fn failed_send_changes_nothing() -> anyhow::Result<()> {
    let h = Harness::new();
    h.kernel.authority().apply_lock(DeviceLock::hard(
        "admin.a",
        LockReason::AdminAction,
        LockOrigin::Admin,
        "locked",
        NOW,
    ))?;
    let before = h.kernel.authority().locks();

    h.transport.push(Err(NetworkError::Status { status: 503 }));
    let err = h.kernel.heartbeat_cycle().await.expect_err("send fails");
    assert!(matches!(err, KernelError::Network(_)));
    // Empty script: unreachable.
    assert!(h.kernel.heartbeat_cycle().await.is_err());

    assert_eq!(h.kernel.lock_state(), LockState::HardLock);
    assert_eq!(h.kernel.authority().locks(), before);
    let state = h.kernel.heartbeat().state();
    assert_eq!(state.consecutive_failures, 2);
    assert!(state.last_success_ms.is_none());
    assert_eq!(
        h.kernel
            .incidents(Severity::Medium)
            .iter()
            .filter(|i| i.kind == IncidentKind::HeartbeatFailed)
            .count(),
        2
    );
    Ok(())
}

#[tokio::test]
async fn error_reply_keeps_backend_lock() -> anyhow::Result<()> {
    let h = Harness::new();
    h.transport.push(Ok(json!({"success": true, "is_locked": true})));
    h.kernel.heartbeat_cycle().await?;
    assert_eq!(h.kernel.lock_state(), LockState::HardLock);

    h.transport.push(Ok(json!({
        "success": false,
        "message": "An error occurred processing the heartbeat"
    })));
    let err = h.kernel.heartbeat_cycle().await.expect_err("error reply");
    assert!(matches!(err, KernelError::Network(NetworkError::Rejected(_))));

    assert_eq!(h.kernel.lock_state(), LockState::HardLock);
    assert!(h.kernel.authority().get(BACKEND_LOCK_ID).is_some());
    let state = h.kernel.heartbeat().state();
    assert_eq!(state.consecutive_failures, 1);
    assert_eq!(state.last_success_ms, Some(NOW));
    Ok(())
}

#[tokio::test]
async fn request_is_signed_snapshot_of_current_state() -> anyhow::Result<()> {
    let h = Harness::new();
    h.transport.push(Ok(json!({"success": true})));
    h.kernel.heartbeat_cycle().await?;
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].device_id, DEVICE_ID);
    assert_eq!(sent[0].serial_number, "SN-0042");
    assert_eq!(sent[0].lock_state, Some(LockState::Unlocked));
    assert_eq!(sent[0].timestamp, NOW);
    assert!(!sent[0].signature.is_empty());
    assert_eq!(h.kernel.heartbeat().state().last_success_ms, Some(NOW));
    Ok(())
}

#[tokio::test]
async fn high_severity_mismatch_blocks_then_clears() -> anyhow::Result<()> {
    let h = Harness::new();
    h.transport
        .push(Ok(json!({"success": true, "comparison_result": {"high_severity_count": 1}})));
    let report = h.kernel.heartbeat_cycle().await?;
    assert!(report.cycle.blocked);
    assert_eq!(report.cycle.state_after, Some(LockState::HardLock));
    let lock = h.kernel.authority().get(BACKEND_LOCK_ID).expect("network lock");
    assert_eq!(lock.reason, LockReason::DeviceMismatch);
    assert_eq!(lock.origin, LockOrigin::Network);
    assert!(lock.backend_unlock_only);

    h.transport.push(Ok(json!({"success": true, "is_locked": false})));
    let report = h.kernel.heartbeat_cycle().await?;
    assert!(!report.cycle.blocked);
    assert_eq!(h.kernel.lock_state(), LockState::Unlocked);
    Ok(())
}

#[tokio::test]
async fn backend_lock_reason_is_mapped() -> anyhow::Result<()> {
    let h = Harness::new();
    h.transport.push(Ok(json!({
        "management": {"is_locked": true, "reason": "Payment overdue - contact your lender"}
    })));
    h.kernel.heartbeat_cycle().await?;
    let lock = h.kernel.authority().get(BACKEND_LOCK_ID).expect("network lock");
    assert_eq!(lock.reason, LockReason::PaymentOverdue);
    assert_eq!(lock.message, "Payment overdue - contact your lender");
    assert!(
        h.kernel
            .incidents(Severity::High)
            .iter()
            .any(|i| i.kind == IncidentKind::HeartbeatBlocked)
    );
    Ok(())
}

#[tokio::test]
async fn payment_complete_releases_payment_locks_only() -> anyhow::Result<()> {
    let h = Harness::new();
    h.sensor.update(|snap| {
        snap.loan = Some(loan(LoanStatus::Overdue, Some(NOW - 3 * DAY), 3));
        snap.security.rooted = true;
    });
    h.kernel.evaluate_local_triggers()?;
    assert!(h.kernel.authority().get(OVERDUE_LOCK_ID).is_some());

    h.transport.push(Ok(json!({"payment_complete": true})));
    let report = h.kernel.heartbeat_cycle().await?;
    assert!(report.cycle.deactivated);
    assert!(h.kernel.authority().get(OVERDUE_LOCK_ID).is_none());
    assert!(h.kernel.authority().get("tamper.rooted").is_some());
    assert_eq!(h.device.count(&DeviceCall::Release), 1);
    assert_eq!(h.kernel.status().loan.expect("loan").status, LoanStatus::FullyPaid);
    assert!(
        h.kernel
            .incidents(Severity::Info)
            .iter()
            .any(|i| i.kind == IncidentKind::Deactivation)
    );

    // The sensor still reports the stale overdue status; settlement sticks.
    h.transport.push(Ok(json!({"success": true})));
    h.kernel.heartbeat_cycle().await?;
    assert!(h.kernel.authority().get(OVERDUE_LOCK_ID).is_none());
    Ok(())
}

#[tokio::test]
async fn block_wins_over_deactivation() -> anyhow::Result<()> {
    let h = Harness::new();
    h.transport.push(Ok(json!({"is_locked": true, "payment_complete": true})));
    let report = h.kernel.heartbeat_cycle().await?;
    assert!(report.cycle.blocked);
    assert!(!report.cycle.deactivated);
    assert_eq!(h.device.count(&DeviceCall::Release), 0);
    assert_eq!(h.kernel.lock_state(), LockState::HardLock);
    Ok(())
}

#[tokio::test]
async fn delivered_commands_are_drained_immediately() -> anyhow::Result<()> {
    let h = Harness::new();
    let lock = h.backend.command("c1", "LOCK_DEVICE", DEVICE_ID, &[("lock_id", "admin.remote")]);
    h.transport.push(Ok(json!({
        "success": true,
        "commands": [
            serde_json::to_value(&lock)?,
            {"id": 17},
            {"id": "c2", "type": "SELF_DESTRUCT"}
        ]
    })));
    let report = h.kernel.heartbeat_cycle().await?;
    assert_eq!(report.cycle.enqueued, 1);
    assert_eq!(report.cycle.rejected, 2);
    assert_eq!(report.processed.len(), 1);
    assert_eq!(report.processed[0].status, CommandStatus::Executed);
    assert!(h.kernel.authority().get("admin.remote").is_some());
    assert!(!h.kernel.queue().has_pending());
    Ok(())
}

#[tokio::test]
async fn next_payment_sets_reminder_with_backend_pin() -> anyhow::Result<()> {
    let h = Harness::new();
    h.sensor
        .update(|snap| snap.loan = Some(loan(LoanStatus::Active, None, 0)));
    // NOW is 2023-11-14T22:13:20Z; due one day later.
    h.transport.push(Ok(json!({
        "success": true,
        "next_payment": {"date_time": "2023-11-15T22:13:20Z", "unlock_password": "4821"}
    })));
    h.kernel.heartbeat_cycle().await?;

    let lock = h.kernel.authority().get(REMINDER_LOCK_ID).expect("reminder");
    assert_eq!(lock.lock_type, LockType::Soft);
    assert_eq!(lock.expires_at_ms, Some(NOW + DAY));
    assert!(lock.pin_required);

    assert_eq!(
        h.kernel.pin_unlock(REMINDER_LOCK_ID, "0000")?,
        PinOutcome::Rejected { remaining: 4 }
    );
    assert_eq!(h.kernel.pin_unlock(REMINDER_LOCK_ID, "4821")?, PinOutcome::Unlocked);
    assert_eq!(h.kernel.lock_state(), LockState::Unlocked);
    Ok(())
}

#[tokio::test]
async fn queued_alerts_flush_when_sink_is_reachable() -> anyhow::Result<()> {
    let h = Harness::new();
    h.sensor.update(|snap| snap.security.usb_debugging = true);
    h.kernel.evaluate_local_triggers()?;
    assert_eq!(h.kernel.outbox().len(), 1);

    h.sink.set_fail(true);
    assert_eq!(h.kernel.flush_alerts().await, 0);
    let pending = h.kernel.outbox().pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);

    h.sink.set_fail(false);
    assert_eq!(h.kernel.flush_alerts().await, 1);
    assert!(h.kernel.outbox().is_empty());
    let delivered = h.sink.delivered();
    assert_eq!(delivered[0].kind, "tamper");
    let body: serde_json::Value = serde_json::from_str(&delivered[0].body)?;
    assert_eq!(body["device_id"], DEVICE_ID);
    Ok(())
}
