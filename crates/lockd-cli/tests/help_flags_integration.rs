#[test]
fn help_lists_commands_and_global_flags() {
    let output = std::process::Command::new(assert_cmd::cargo::cargo_bin!("lockd"))
        .arg("--help")
        .output()
        .expect("run help");
    assert!(output.status.success(), "--help should succeed");
    let text = String::from_utf8_lossy(&output.stdout);
    for needle in ["--data-dir", "--mode", "--json", "queue", "unlock", "self-check", "incidents"] {
        assert!(text.contains(needle), "help output should contain '{needle}'");
    }
}

#[test]
fn queue_help_lists_subcommands() {
    let output = std::process::Command::new(assert_cmd::cargo::cargo_bin!("lockd"))
        .args(["queue", "--help"])
        .output()
        .expect("run help");
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    for needle in ["list", "history", "import", "drain"] {
        assert!(text.contains(needle), "queue help should contain '{needle}'");
    }
}
