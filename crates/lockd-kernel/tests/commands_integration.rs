//! Command path end to end: queue, verify, dispatch, record.

#[path = "helpers.rs"]
mod helpers;

use helpers::{DEVICE_ID, Harness, NOW};
use lockd_kernel::executor::PERMANENT_LOCK_ID;
use lockd_kernel::testkit::{DeviceCall, TestBackend, fake_apk};
use lockd_types::{
    CommandKind, CommandStatus, Digest, DeviceLock, IncidentKind, LockOrigin, LockReason, LockState,
    Severity, WipeScope,
};

fn params_for(kind: CommandKind) -> Vec<(&'static str, &'static str)> {
    match kind {
        CommandKind::Warn => vec![("message", "payment due friday")],
        CommandKind::UpdateApp => vec![("url", "https://updates.example/agent.apk")],
        CommandKind::Lock => vec![("lock_id", "admin.collections")],
        _ => Vec::new(),
    }
}

#[tokio::test]
async fn repeated_lock_leaves_one_lock_and_one_enforcement() -> anyhow::Result<()> {
    let h = Harness::new();
    let params = [("lock_id", "admin.collections")];
    let first = h.backend.command("c1", "LOCK_DEVICE", DEVICE_ID, &params);
    let second = h.backend.command("c2", "LOCK", DEVICE_ID, &params);

    let (_, processed) = h.kernel.receive_command(first).await?;
    assert_eq!(processed[0].status, CommandStatus::Executed);
    let (_, processed) = h.kernel.receive_command(second).await?;
    assert_eq!(processed[0].status, CommandStatus::Executed);
    assert!(processed[0].detail.contains("already active"));

    let locks = h.kernel.authority().locks();
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].id, "admin.collections");
    assert_eq!(h.kernel.lock_state(), LockState::HardLock);
    assert_eq!(h.device.count(&DeviceCall::Enforce(LockState::HardLock)), 1);
    Ok(())
}

#[tokio::test]
async fn replayed_command_id_is_refused() -> anyhow::Result<()> {
    let h = Harness::new();
    let wire = h.backend.command("c1", "LOCK_DEVICE", DEVICE_ID, &[]);
    h.kernel.receive_command(wire.clone()).await?;
    assert!(h.kernel.receive_command(wire).await.is_err());

    let rejected: Vec<_> = h
        .kernel
        .incidents(Severity::Medium)
        .into_iter()
        .filter(|i| i.kind == IncidentKind::CommandRejected)
        .collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].subject.as_deref(), Some("c1"));
    Ok(())
}

#[tokio::test]
async fn badly_signed_commands_never_run() -> anyhow::Result<()> {
    let h = Harness::new();
    let impostor = TestBackend::from_seed([9u8; 32]);
    let calls_before = h.device.calls();

    for (n, kind) in CommandKind::ALL.into_iter().enumerate() {
        let id = format!("forged-{n}");
        let wire = impostor.command(&id, kind.wire_name(), DEVICE_ID, &params_for(kind));
        let (_, processed) = h.kernel.receive_command(wire).await?;
        assert_eq!(processed.len(), 1, "{kind}");
        assert_eq!(processed[0].status, CommandStatus::Failed, "{kind}");
        assert_eq!(processed[0].detail, "signature invalid", "{kind}");
    }

    assert_eq!(h.device.calls(), calls_before);
    assert!(h.kernel.authority().locks().is_empty());
    assert!(h.presenter.warnings().is_empty());
    assert!(h.installer.installs().is_empty());
    let critical: Vec<_> = h
        .kernel
        .incidents(Severity::Critical)
        .into_iter()
        .filter(|i| i.kind == IncidentKind::SignatureInvalid)
        .collect();
    assert_eq!(critical.len(), CommandKind::ALL.len());
    Ok(())
}

#[tokio::test]
async fn altered_command_fails_verification() -> anyhow::Result<()> {
    let h = Harness::new();
    let mut wire = h.backend.command("c1", "UNLOCK_DEVICE", DEVICE_ID, &[]);
    wire.sequence_number += 1;
    let (_, processed) = h.kernel.receive_command(wire).await?;
    assert_eq!(processed[0].status, CommandStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn command_for_another_device_is_failed() -> anyhow::Result<()> {
    let h = Harness::new();
    let wire = h.backend.command("c1", "LOCK_DEVICE", "dev-2", &[]);
    let (_, processed) = h.kernel.receive_command(wire).await?;
    assert_eq!(processed[0].status, CommandStatus::Failed);
    assert_eq!(processed[0].detail, "target device mismatch");
    assert_eq!(h.kernel.lock_state(), LockState::Unlocked);
    assert!(
        h.kernel
            .incidents(Severity::High)
            .iter()
            .any(|i| i.kind == IncidentKind::CommandRejected && i.subject.as_deref() == Some("c1"))
    );
    Ok(())
}

#[tokio::test]
async fn expired_command_is_never_dispatched() -> anyhow::Result<()> {
    let h = Harness::new();
    let mut wire = h.backend.command("c1", "LOCK_DEVICE", DEVICE_ID, &[]);
    wire.expires_at = NOW + 1_000;
    h.backend.sign(&mut wire);
    h.kernel.queue().enqueue_wire(wire, NOW)?;

    h.clock.advance(5_000);
    assert!(h.kernel.executor().process_next().await?.is_none());
    assert_eq!(h.kernel.lock_state(), LockState::Unlocked);
    let recorded = h.kernel.queue().get("c1").expect("in history");
    assert_eq!(recorded.status, CommandStatus::Expired);
    Ok(())
}

#[tokio::test]
async fn unlock_by_id_and_unlock_all() -> anyhow::Result<()> {
    let h = Harness::new();
    h.kernel.authority().apply_lock(DeviceLock::hard(
        "tamper.rooted",
        LockReason::SystemTamper,
        LockOrigin::Tamper,
        "rooted",
        NOW,
    ))?;
    let lock = h.backend.command("c1", "LOCK_DEVICE", DEVICE_ID, &[("lock_id", "admin.a")]);
    h.kernel.receive_command(lock).await?;

    let unlock_one = h.backend.command("c2", "UNLOCK_DEVICE", DEVICE_ID, &[("lock_id", "admin.a")]);
    h.kernel.receive_command(unlock_one).await?;
    assert!(h.kernel.authority().get("admin.a").is_none());
    assert_eq!(h.kernel.lock_state(), LockState::HardLock);

    let unlock_all = h.backend.command("c3", "UNLOCK", DEVICE_ID, &[]);
    let (_, processed) = h.kernel.receive_command(unlock_all).await?;
    assert_eq!(processed[0].detail, "1 lock(s) removed");
    assert_eq!(h.kernel.lock_state(), LockState::Unlocked);
    assert_eq!(h.device.enforce_calls().last(), Some(&LockState::Unlocked));
    Ok(())
}

#[tokio::test]
async fn soft_admin_lock_accepts_its_pin() -> anyhow::Result<()> {
    let h = Harness::new();
    let wire = h.backend.command(
        "c1",
        "LOCK_DEVICE",
        DEVICE_ID,
        &[("lock_id", "admin.soft"), ("lock_type", "soft"), ("pin", "2468")],
    );
    h.kernel.receive_command(wire).await?;
    assert_eq!(h.kernel.lock_state(), LockState::SoftLock);
    assert_eq!(
        h.kernel.pin_unlock("admin.soft", "2468")?,
        lockd_kernel::PinOutcome::Unlocked
    );
    assert_eq!(h.kernel.lock_state(), LockState::Unlocked);
    Ok(())
}

#[tokio::test]
async fn warn_reaches_presenter_without_locking() -> anyhow::Result<()> {
    let h = Harness::new();
    let wire = h.backend.command(
        "c1",
        "WARN",
        DEVICE_ID,
        &[("message", "pay by friday"), ("expires_in_ms", "60000")],
    );
    h.kernel.receive_command(wire).await?;
    assert_eq!(h.presenter.warnings(), vec![("pay by friday".to_string(), Some(NOW + 60_000))]);
    assert_eq!(h.kernel.lock_state(), LockState::Unlocked);
    Ok(())
}

#[tokio::test]
async fn wipe_and_permanent_lock_are_always_critical() -> anyhow::Result<()> {
    let h = Harness::new();
    h.kernel
        .receive_command(h.backend.command("w1", "WIPE", DEVICE_ID, &[]))
        .await?;
    h.kernel
        .receive_command(h.backend.command("p1", "PERMANENT_LOCK", DEVICE_ID, &[]))
        .await?;

    assert_eq!(h.device.count(&DeviceCall::Wipe(WipeScope::SensitiveData)), 1);
    assert_eq!(h.device.count(&DeviceCall::LockNow), 1);
    let lock = h.kernel.authority().get(PERMANENT_LOCK_ID).expect("permanent lock");
    assert!(lock.backend_unlock_only);

    let critical: Vec<_> = h
        .kernel
        .incidents(Severity::Critical)
        .into_iter()
        .filter(|i| i.kind == IncidentKind::CriticalCommand)
        .filter_map(|i| i.subject)
        .collect();
    assert_eq!(critical, vec!["w1".to_string(), "p1".to_string()]);
    Ok(())
}

#[tokio::test]
async fn rejected_critical_commands_are_still_critical() -> anyhow::Result<()> {
    let h = Harness::new();
    h.kernel
        .receive_command(h.backend.command("w2", "WIPE_DATA", "other-device", &[]))
        .await?;
    let mut forged = h.backend.command("p2", "PERMANENT_LOCK", DEVICE_ID, &[]);
    forged.signature = h.backend.command("x", "REBOOT", DEVICE_ID, &[]).signature;
    h.kernel.receive_command(forged).await?;

    assert_eq!(h.kernel.queue().get("w2").expect("w2").status, CommandStatus::Failed);
    assert_eq!(h.kernel.queue().get("p2").expect("p2").status, CommandStatus::Failed);
    assert_eq!(h.device.count(&DeviceCall::Wipe(WipeScope::SensitiveData)), 0);
    assert!(h.kernel.authority().get(PERMANENT_LOCK_ID).is_none());

    let critical: Vec<_> = h
        .kernel
        .incidents(Severity::Critical)
        .into_iter()
        .filter(|i| i.kind == IncidentKind::CriticalCommand)
        .filter_map(|i| i.subject)
        .collect();
    assert_eq!(critical, vec!["w2".to_string(), "p2".to_string()]);
    Ok(())
}

#[tokio::test]
async fn factory_wipe_only_when_asked() -> anyhow::Result<()> {
    let h = Harness::new();
    h.kernel
        .receive_command(h.backend.command("w1", "WIPE_DATA", DEVICE_ID, &[("scope", "factory")]))
        .await?;
    assert_eq!(h.device.count(&DeviceCall::Wipe(WipeScope::FactoryReset)), 1);
    Ok(())
}

#[tokio::test]
async fn reboot_is_recorded_before_the_device_goes_down() -> anyhow::Result<()> {
    let h = Harness::new();
    h.kernel
        .receive_command(h.backend.command("r1", "REBOOT_DEVICE", DEVICE_ID, &[]))
        .await?;
    assert_eq!(h.kernel.queue().get("r1").expect("r1").status, CommandStatus::Executed);
    assert_eq!(h.device.count(&DeviceCall::Reboot), 1);
    Ok(())
}

fn staged_files(h: &Harness) -> usize {
    std::fs::read_dir(h.staging.path().join("updates"))
        .map(|dir| dir.count())
        .unwrap_or(0)
}

#[tokio::test]
async fn update_app_verifies_installs_and_cleans_up() -> anyhow::Result<()> {
    let h = Harness::new();
    let apk = fake_apk(4096);
    let checksum = Digest::of_bytes(&apk).to_hex();
    h.fetcher.insert("https://updates.example/agent.apk", apk.clone());
    let wire = h.backend.command(
        "u1",
        "UPDATE_APP",
        DEVICE_ID,
        &[
            ("url", "https://updates.example/agent.apk"),
            ("sha256", checksum.as_str()),
            ("package", "com.example.agent"),
        ],
    );
    let (_, processed) = h.kernel.receive_command(wire).await?;
    assert_eq!(processed[0].status, CommandStatus::Executed);

    let installs = h.installer.installs();
    assert_eq!(installs.len(), 1);
    assert_eq!(installs[0].bytes, apk);
    assert_eq!(installs[0].package.as_deref(), Some("com.example.agent"));
    assert_eq!(staged_files(&h), 0);
    Ok(())
}

#[tokio::test]
async fn update_app_rejects_bad_packages() -> anyhow::Result<()> {
    let h = Harness::new();
    h.fetcher.insert("https://updates.example/text.apk", b"<html>not found</html>".to_vec());
    h.fetcher.insert("https://updates.example/empty.apk", Vec::new());
    h.fetcher.insert("https://updates.example/agent.apk", fake_apk(512));
    let wrong_sum = Digest::of_bytes(b"something else").to_hex();

    let cases = [
        ("u1", vec![("url", "https://updates.example/text.apk")]),
        ("u2", vec![("url", "https://updates.example/empty.apk")]),
        ("u3", vec![("url", "https://updates.example/missing.apk")]),
        (
            "u4",
            vec![("url", "https://updates.example/agent.apk"), ("sha256", wrong_sum.as_str())],
        ),
    ];
    for (id, params) in cases {
        let (_, processed) = h
            .kernel
            .receive_command(h.backend.command(id, "UPDATE_APP", DEVICE_ID, &params))
            .await?;
        assert_eq!(processed[0].status, CommandStatus::Failed, "{id}");
    }
    assert!(h.installer.installs().is_empty());
    assert_eq!(staged_files(&h), 0);
    Ok(())
}

#[tokio::test]
async fn failed_install_is_not_retried() -> anyhow::Result<()> {
    let h = Harness::new();
    h.fetcher.insert("https://updates.example/agent.apk", fake_apk(256));
    h.installer.set_fail(true);
    let (_, processed) = h
        .kernel
        .receive_command(h.backend.command(
            "u1",
            "UPDATE_APP",
            DEVICE_ID,
            &[("url", "https://updates.example/agent.apk")],
        ))
        .await?;
    assert_eq!(processed[0].status, CommandStatus::Failed);
    assert!(!h.kernel.queue().has_pending());
    assert!(h.kernel.executor().process_next().await?.is_none());
    Ok(())
}
