//! Host storage across restarts, and the file-backed platform adapters.

use std::fs;

use lockd_host::adapters::{ENFORCEMENT_FILE, Enforcement, LOCKSCREEN_FILE, LockScreen};
use lockd_host::fixtures::{DEVICE_ID, TestHost};
use lockd_host::{DeviceHost, HostConfig};
use lockd_kernel::testkit::TestBackend;
use lockd_types::{IncidentKind, LockState, Severity};
use tempfile::TempDir;

#[tokio::test]
async fn locks_survive_restart_and_primary_loss() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let t = TestHost::open(dir.path())?;
        let wire = t
            .mocks
            .backend
            .command("keep-1", "LOCK_DEVICE", DEVICE_ID, &[("lock_id", "admin.keep")]);
        t.host.kernel().receive_command(wire).await?;
        assert_eq!(t.host.kernel().lock_state(), LockState::HardLock);
    }

    let t = TestHost::open(dir.path())?;
    t.host.kernel().start()?;
    assert_eq!(t.host.kernel().lock_state(), LockState::HardLock);
    let ids: Vec<_> = t.host.kernel().authority().locks().into_iter().map(|l| l.id).collect();
    assert_eq!(ids, vec!["admin.keep".to_string()]);
    let store_dir = t.host.config().store_dir();
    drop(t);

    // Losing the primary store falls back to the mirror.
    fs::remove_dir_all(&store_dir)?;
    let t = TestHost::open(dir.path())?;
    assert_eq!(t.host.kernel().lock_state(), LockState::HardLock);
    assert_eq!(t.host.kernel().queue().history().len(), 1);
    Ok(())
}

#[tokio::test]
async fn torn_journal_tail_does_not_block_boot() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let journal_file = {
        let t = TestHost::open(dir.path())?;
        let wire = t
            .mocks
            .backend
            .command("torn-1", "LOCK_DEVICE", DEVICE_ID, &[("lock_id", "admin.torn")]);
        t.host.kernel().receive_command(wire).await?;
        t.host.config().journal_root().join("journal").join("audit.log")
    };
    let len = fs::metadata(&journal_file)?.len();
    fs::OpenOptions::new().write(true).open(&journal_file)?.set_len(len - 3)?;

    let t = TestHost::open(dir.path())?;
    t.host.kernel().start()?;
    assert_eq!(t.host.kernel().lock_state(), LockState::HardLock);
    assert!(t.host.kernel().authority().get("admin.torn").is_some());
    assert!(
        t.host
            .kernel()
            .incidents(Severity::High)
            .iter()
            .any(|i| {
                i.kind == IncidentKind::StorageFailure && i.subject.as_deref() == Some("journal")
            })
    );
    Ok(())
}

#[tokio::test]
async fn platform_files_follow_the_lock_state() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let backend = TestBackend::default();
    let config = HostConfig {
        data_dir: dir.path().to_path_buf(),
        device_id: DEVICE_ID.into(),
        backend_public_key: Some(backend.public_key_hex()),
        support_contact: Some("+1 555 0100".into()),
        ..HostConfig::default()
    };
    let host = DeviceHost::open(config)?;
    host.kernel().start()?;

    let wire = backend.command("plat-1", "LOCK_DEVICE", DEVICE_ID, &[("lock_id", "admin.plat")]);
    let (_, processed) = host.kernel().receive_command(wire).await?;
    assert_eq!(processed.len(), 1);

    let platform = host.config().platform_dir();
    let enforcement: Enforcement =
        serde_json::from_slice(&fs::read(platform.join(ENFORCEMENT_FILE))?)?;
    assert_eq!(enforcement.state, LockState::HardLock);

    let screen: LockScreen = serde_json::from_slice(&fs::read(platform.join(LOCKSCREEN_FILE))?)?;
    assert_eq!(screen.state, LockState::HardLock);
    assert_eq!(screen.lock_id.as_deref(), Some("admin.plat"));
    assert_eq!(screen.support_contact.as_deref(), Some("+1 555 0100"));

    // Unsigned commands never reach the platform.
    let mut forged = backend.command("plat-2", "UNLOCK_DEVICE", DEVICE_ID, &[]);
    forged.signature = String::new();
    let _ = host.kernel().receive_command(forged).await;
    assert_eq!(host.kernel().lock_state(), LockState::HardLock);
    Ok(())
}
