//! Smoke tests for the `vaultlink` binary.
//!
//! The end-to-end cases launch the binary itself as the boundary process
//! (`--boundary <vaultlink> --boundary-arg stub-vault`), so no external
//! vault is required.

use std::process::{Command, Output};

fn vaultlink() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_vaultlink"));
    cmd.env_remove("VAULTLINK_BOUNDARY")
        .env_remove("VAULTLINK_USER_ID")
        .env_remove("VAULTLINK_ENCRYPTED_ID")
        .env_remove("VAULTLINK_ENCRYPTED_PASSWORD")
        .env_remove("VAULTLINK_PASSWORD");
    cmd
}

/// `vaultlink` wired to its own stub vault, isolated from any user config.
fn with_stub(home: &std::path::Path) -> Command {
    let mut cmd = vaultlink();
    cmd.args([
        "--boundary",
        env!("CARGO_BIN_EXE_vaultlink"),
        "--boundary-arg",
        "stub-vault",
    ])
    .current_dir(home)
    .env("HOME", home)
    .env("XDG_CONFIG_HOME", home.join(".config"))
    .env("VAULTLINK_ACCESS_TOKEN", "smoke-token");
    cmd
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn assert_ok(output: &Output, what: &str) {
    assert!(
        output.status.success(),
        "{what} failed\nstderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

// ── Help / basic CLI ──────────────────────────────────────────────────────────

#[test]
fn binary_responds_to_help() {
    let output = vaultlink()
        .arg("--help")
        .output()
        .expect("failed to execute vaultlink");
    assert!(output.status.success(), "vaultlink --help should exit 0");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("encrypt"));
    assert!(stdout.contains("create-user"));
    assert!(stdout.contains("token"));
    assert!(!stdout.contains("stub-vault"), "stub-vault is hidden");
}

#[test]
fn token_subcommand_help() {
    let output = vaultlink()
        .args(["token", "--help"])
        .output()
        .expect("failed to execute vaultlink token --help");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("set"));
    assert!(stdout.contains("status"));
    assert!(stdout.contains("clear"));
}

#[test]
fn unknown_subcommand_exits_nonzero() {
    let output = vaultlink()
        .arg("nonexistent-subcommand")
        .output()
        .expect("failed to execute vaultlink");
    assert!(!output.status.success(), "unknown subcommand should exit non-zero");
}

// ── Token store ──────────────────────────────────────────────────────────────

#[test]
fn token_lifecycle_in_isolated_home() {
    let home = tempfile::tempdir().unwrap();
    let run = |args: &[&str]| {
        vaultlink()
            .args(args)
            .env("HOME", home.path())
            .env("XDG_CONFIG_HOME", home.path().join(".config"))
            .output()
            .expect("failed to execute vaultlink token")
    };

    let output = run(&["token", "status"]);
    assert_ok(&output, "token status");
    assert!(String::from_utf8_lossy(&output.stderr).contains("No token stored"));

    assert_ok(&run(&["token", "set", "abcdefghijkl"]), "token set");
    let output = run(&["token", "status"]);
    assert_ok(&output, "token status");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("abcdefgh..."), "{stderr}");
    assert!(!stderr.contains("ijkl"), "token must not be printed in full");

    assert_ok(&run(&["token", "clear"]), "token clear");
    assert_ok(&run(&["token", "clear"]), "second token clear");
}

// ── End to end against the stub vault ────────────────────────────────────────

#[test]
fn missing_boundary_program_fails_cleanly() {
    let home = tempfile::tempdir().unwrap();
    let output = vaultlink()
        .args(["--boundary", "/nonexistent/vaultlink-vault", "status"])
        .current_dir(home.path())
        .env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path().join(".config"))
        .env("VAULTLINK_ACCESS_TOKEN", "smoke-token")
        .output()
        .expect("failed to execute vaultlink status");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("boundary failed to launch"));
}

#[test]
fn status_reports_ready_stub() {
    let home = tempfile::tempdir().unwrap();
    let output = with_stub(home.path())
        .arg("status")
        .output()
        .expect("failed to execute vaultlink status");
    assert_ok(&output, "status");
    let report: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(report["phase"], "ready");
    assert_eq!(report["state"]["isReady"], true);
}

#[test]
fn create_user_then_encrypt_and_decrypt_across_processes() {
    let home = tempfile::tempdir().unwrap();

    let output = with_stub(home.path())
        .args(["create-user", "--user-id", "user-1", "--password", "correct horse"])
        .output()
        .expect("failed to execute vaultlink create-user");
    assert_ok(&output, "create-user");
    let created: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    let encrypted_id = created["encryptedId"].as_str().unwrap().to_string();
    let encrypted_password = created["encryptedPassword"].as_str().unwrap().to_string();

    let session = [
        "--encrypted-id",
        encrypted_id.as_str(),
        "--user-id",
        "user-1",
        "--encrypted-password",
        encrypted_password.as_str(),
    ];

    let output = with_stub(home.path())
        .arg("encrypt")
        .arg("attack at dawn")
        .args(session)
        .output()
        .expect("failed to execute vaultlink encrypt");
    assert_ok(&output, "encrypt");
    let ciphertext = stdout(&output);
    assert_ne!(ciphertext, "attack at dawn");

    let output = with_stub(home.path())
        .arg("decrypt")
        .arg(&ciphertext)
        .args(session)
        .output()
        .expect("failed to execute vaultlink decrypt");
    assert_ok(&output, "decrypt");
    assert_eq!(stdout(&output), "attack at dawn");
}

#[test]
fn short_password_is_reported_verbatim() {
    let home = tempfile::tempdir().unwrap();
    let output = with_stub(home.path())
        .args(["create-user", "--user-id", "user-1", "--password", "short"])
        .output()
        .expect("failed to execute vaultlink create-user");
    assert!(!output.status.success());
    assert!(
        String::from_utf8_lossy(&output.stderr)
            .contains("password must be at least 8 characters")
    );
}
