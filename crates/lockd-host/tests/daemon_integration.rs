//! Daemon loop driven through its control channel and control socket.

use std::sync::Arc;
use std::time::Duration;

use lockd_host::fixtures::{DEVICE_ID, TestHost};
use lockd_host::{ControlClient, ControlMsg, ControlServer, LockDaemon};
use lockd_kernel::testkit::DeviceCall;
use lockd_kernel::{DeviceKernel, PinOutcome, RecoveryOutcome};
use lockd_types::{CommandStatus, LockState};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

struct Running {
    kernel: Arc<DeviceKernel>,
    control_tx: mpsc::Sender<ControlMsg>,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<Result<(), lockd_host::HostError>>,
}

fn spawn_daemon(t: &TestHost) -> Running {
    let kernel = t.host.kernel().clone();
    let config = t.host.config();
    let (control_tx, control_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut daemon = LockDaemon::new(
        kernel.clone(),
        config.intervals,
        config.backoff,
        control_rx,
        shutdown_rx,
        None,
    );
    let handle = tokio::spawn(async move { daemon.run().await });
    Running {
        kernel,
        control_tx,
        shutdown_tx,
        handle,
    }
}

async fn shutdown(running: Running) -> anyhow::Result<()> {
    let (tx, rx) = oneshot::channel();
    running
        .control_tx
        .send(ControlMsg::Shutdown {
            resp: tx,
            shutdown_tx: running.shutdown_tx.clone(),
        })
        .await?;
    rx.await??;
    tokio::time::timeout(Duration::from_secs(5), running.handle).await???;
    Ok(())
}

#[tokio::test]
async fn submitted_command_is_verified_and_executed() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let t = TestHost::open(dir.path())?;
    t.mocks.transport.push(Ok(json!({"success": true})));
    let running = spawn_daemon(&t);

    let wire = t
        .mocks
        .backend
        .command("c-1", "LOCK_DEVICE", DEVICE_ID, &[("lock_id", "admin.daemon")]);
    let (tx, rx) = oneshot::channel();
    running.control_tx.send(ControlMsg::Submit { command: wire, resp: tx }).await?;
    let processed = rx.await??;
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].status, CommandStatus::Executed);
    assert_eq!(running.kernel.lock_state(), LockState::HardLock);

    // A replay of the same id is refused at the queue.
    let replay = t
        .mocks
        .backend
        .command("c-1", "LOCK_DEVICE", DEVICE_ID, &[("lock_id", "admin.daemon")]);
    let (tx, rx) = oneshot::channel();
    running.control_tx.send(ControlMsg::Submit { command: replay, resp: tx }).await?;
    assert!(rx.await?.is_err());

    let (tx, rx) = oneshot::channel();
    running.control_tx.send(ControlMsg::Status { resp: tx }).await?;
    let status = rx.await?;
    assert_eq!(status.device_id, DEVICE_ID);
    assert_eq!(status.lock_state, LockState::HardLock);
    assert_eq!(status.pending_commands, 0);

    shutdown(running).await
}

#[tokio::test]
async fn failed_heartbeat_keeps_locks_and_counts_failures() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let t = TestHost::open(dir.path())?;
    let running = spawn_daemon(&t);

    let wire = t.mocks.backend.command("c-9", "LOCK_DEVICE", DEVICE_ID, &[]);
    let (tx, rx) = oneshot::channel();
    running.control_tx.send(ControlMsg::Submit { command: wire, resp: tx }).await?;
    rx.await??;
    let before = running.kernel.authority().locks();

    // Empty transport script: every send is unreachable.
    let (tx, rx) = oneshot::channel();
    running.control_tx.send(ControlMsg::Heartbeat { resp: tx }).await?;
    assert!(rx.await?.is_err());
    assert!(running.kernel.heartbeat().state().consecutive_failures >= 1);
    assert_eq!(running.kernel.authority().locks(), before);
    assert_eq!(running.kernel.lock_state(), LockState::HardLock);

    shutdown(running).await
}

#[tokio::test]
async fn heartbeat_on_demand_applies_backend_block() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let t = TestHost::open(dir.path())?;
    t.mocks.transport.push(Ok(json!({"success": true})));
    t.mocks.transport.push(Ok(json!({"is_locked": true, "reason": "Contact your lender"})));
    let running = spawn_daemon(&t);

    // The boot heartbeat may take either response; two on-demand cycles
    // guarantee the block is consumed.
    for _ in 0..2 {
        let (tx, rx) = oneshot::channel();
        running.control_tx.send(ControlMsg::Heartbeat { resp: tx }).await?;
        let _ = rx.await?;
    }
    assert_eq!(running.kernel.lock_state(), LockState::HardLock);
    assert!(t.mocks.device.count(&DeviceCall::Enforce(LockState::HardLock)) >= 1);

    shutdown(running).await
}

#[tokio::test]
async fn self_check_reports_healthy_capability() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let t = TestHost::open(dir.path())?;
    let running = spawn_daemon(&t);

    let (tx, rx) = oneshot::channel();
    running.control_tx.send(ControlMsg::SelfCheck { resp: tx }).await?;
    // The boot self-check may still hold the guard.
    let outcome = rx.await??;
    assert!(matches!(outcome, RecoveryOutcome::Healthy | RecoveryOutcome::InProgress));

    shutdown(running).await
}

#[tokio::test]
async fn control_socket_round_trip() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let t = TestHost::open(dir.path())?;
    t.mocks.transport.push(Ok(json!({"success": true})));
    let running = spawn_daemon(&t);

    let socket = t.host.config().control_socket();
    let server =
        ControlServer::new(&socket, running.control_tx.clone(), running.shutdown_tx.clone());
    let listener = server.bind()?;
    let server_handle = tokio::spawn(server.serve(listener));

    let mut client = ControlClient::connect(&socket).await?;
    let status = client.call("status", json!({})).await?;
    assert_eq!(status["device_id"], DEVICE_ID);
    assert_eq!(status["lock_state"], "UNLOCKED");

    let wire =
        t.mocks.backend.command("c-5", "LOCK_DEVICE", DEVICE_ID, &[("lock_id", "admin.sock")]);
    let processed = client.call("submit", serde_json::to_value(&wire)?).await?;
    assert_eq!(processed[0]["status"], "EXECUTED");

    let outcome = client
        .call("unlock", json!({"lock_id": "admin.sock", "pin": "1234"}))
        .await?;
    let expected = serde_json::to_value(PinOutcome::NotPermitted)?;
    assert_eq!(outcome, expected);

    let err = client.call("self-destruct", json!({})).await.expect_err("unknown");
    assert!(err.to_string().contains("unknown_method"));

    client.call("shutdown", json!({})).await?;
    tokio::time::timeout(Duration::from_secs(5), running.handle).await???;
    tokio::time::timeout(Duration::from_secs(5), server_handle).await??;
    assert!(!socket.exists());
    Ok(())
}
