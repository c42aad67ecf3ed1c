//! Offline mode end to end: import a signed command, inspect and unlock.

use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use lockd_kernel::testkit::TestBackend;
use predicates::prelude::*;
use tempfile::TempDir;

const DEVICE_ID: &str = "dev-cli-1";

fn lockd_in(mode: &str, data_dir: &Path, backend: &TestBackend) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("lockd"));
    for var in ["LOCKD_CONTROL", "LOCKD_MODE", "LOCKD_API_KEY", "LOCKD_INSTALL_COMMAND"] {
        cmd.env_remove(var);
    }
    cmd.args([
        "--data-dir",
        data_dir.to_str().expect("utf-8 path"),
        "--device-id",
        DEVICE_ID,
        "--backend-public-key",
        &backend.public_key_hex(),
        "--mode",
        mode,
        "--json",
    ]);
    cmd
}

fn lockd(data_dir: &Path, backend: &TestBackend) -> Command {
    lockd_in("offline", data_dir, backend)
}

fn json_stdout(cmd: &mut Command) -> serde_json::Value {
    let assert = cmd.assert().success();
    serde_json::from_slice(&assert.get_output().stdout).expect("json output")
}

#[test]
fn import_lock_then_inspect_and_try_pin() {
    let tmp = TempDir::new().expect("tmpdir");
    let backend = TestBackend::default();
    let file = tmp.path().join("cmd.json");
    let wire = backend.command("cli-1", "LOCK_DEVICE", DEVICE_ID, &[("lock_id", "admin.cli")]);
    std::fs::write(&file, serde_json::to_vec(&wire).unwrap()).unwrap();
    let data_dir = tmp.path().join("data");

    let imported = json_stdout(lockd(&data_dir, &backend).args(["queue", "import"]).arg(&file));
    assert_eq!(imported["data"][0]["id"], "cli-1");
    assert_eq!(imported["data"][0]["processed"][0]["status"], "EXECUTED");

    let status = json_stdout(lockd(&data_dir, &backend).arg("status"));
    assert_eq!(status["data"]["device_id"], DEVICE_ID);
    assert_eq!(status["data"]["lock_state"], "HARD_LOCK");

    let locks = json_stdout(lockd(&data_dir, &backend).args(["locks", "list"]));
    assert_eq!(locks["data"].as_array().map(Vec::len), Some(1));
    assert_eq!(locks["data"][0]["id"], "admin.cli");

    let history = json_stdout(lockd(&data_dir, &backend).args(["queue", "history"]));
    assert_eq!(history["data"][0]["id"], "cli-1");

    let unlock = json_stdout(lockd(&data_dir, &backend).args([
        "unlock",
        "--lock-id",
        "admin.cli",
        "--pin",
        "0000",
    ]));
    assert_eq!(unlock["data"]["outcome"], "not_permitted");

    // Replaying the same command id is reported, not fatal.
    let replay = json_stdout(lockd(&data_dir, &backend).args(["queue", "import"]).arg(&file));
    assert!(replay["data"][0]["error"].is_string());
    assert!(replay["warnings"].as_array().is_some_and(|w| !w.is_empty()));

    let incidents =
        json_stdout(lockd(&data_dir, &backend).args(["incidents", "--min-severity", "info"]));
    assert!(incidents["data"].as_array().is_some_and(|a| !a.is_empty()));
}

#[test]
fn missing_public_key_is_a_config_error() {
    let tmp = TempDir::new().expect("tmpdir");
    Command::new(assert_cmd::cargo::cargo_bin!("lockd"))
        .env_remove("LOCKD_BACKEND_PUBLIC_KEY")
        .args([
            "--data-dir",
            tmp.path().to_str().unwrap(),
            "--device-id",
            DEVICE_ID,
            "--mode",
            "offline",
            "status",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("backend public key is not configured"));
}

#[test]
fn daemon_mode_without_daemon_fails() {
    let tmp = TempDir::new().expect("tmpdir");
    let backend = TestBackend::default();
    lockd_in("daemon", tmp.path(), &backend)
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no daemon reachable"));
}
