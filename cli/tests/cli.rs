#![allow(deprecated)] // cargo_bin is fine for single-package test targets

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// The binary with the host's node-related environment cleared and every
/// network endpoint pointed at a closed local port.
fn push_validator() -> Command {
    let mut cmd = Command::cargo_bin("push-validator").expect("binary builds");
    for var in [
        "HOME_DIR",
        "PCHAIND",
        "PCHAIND_BIN",
        "SNAPSHOT_URL",
        "KEY_NAME",
        "COMMISSION_RATE",
        "STAKE_AMOUNT",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd.env("GENESIS_DOMAIN", "127.0.0.1:1")
        .env("RPC_LOCAL", "http://127.0.0.1:1")
        .env("PUSH_VALIDATOR_NO_COSMOVISOR", "1")
        .env("NO_COLOR", "1");
    cmd
}

#[test]
fn help_lists_the_command_surface() {
    push_validator()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("init"))
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("full-reset"))
        .stdout(predicate::str::contains("withdraw-rewards"))
        .stdout(predicate::str::contains("doctor"));
}

#[test]
fn out_of_range_commission_is_a_validation_error() {
    let home = TempDir::new().unwrap();
    push_validator()
        .args(["register", "--commission-rate", "5", "--bin", "/nonexistent/pchaind"])
        .arg("--home")
        .arg(home.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("commission"));
}

#[test]
fn reset_of_a_missing_home_is_a_precondition_failure() {
    let tmp = TempDir::new().unwrap();
    push_validator()
        .args(["reset", "--home"])
        .arg(tmp.path().join("missing"))
        .assert()
        .code(3);
}

#[test]
fn json_errors_are_machine_readable() {
    let tmp = TempDir::new().unwrap();
    push_validator()
        .args(["-o", "json", "reset", "--home"])
        .arg(tmp.path().join("missing"))
        .assert()
        .code(3)
        .stdout(predicate::str::contains("\"ok\": false"))
        .stdout(predicate::str::contains("\"code\": 3"));
}

#[test]
fn full_reset_needs_yes_when_non_interactive() {
    let home = TempDir::new().unwrap();
    push_validator()
        .args(["full-reset", "--non-interactive", "--home"])
        .arg(home.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--yes"));
}

#[test]
fn full_reset_with_yes_keeps_keys() {
    let home = TempDir::new().unwrap();
    std::fs::create_dir_all(home.path().join("config")).unwrap();
    std::fs::write(home.path().join("config/genesis.json"), "{}").unwrap();
    std::fs::create_dir_all(home.path().join("keyring-test")).unwrap();
    std::fs::write(home.path().join("keyring-test/validator.info"), "k").unwrap();

    push_validator()
        .args(["full-reset", "--yes", "--home"])
        .arg(home.path())
        .assert()
        .success();

    assert!(!home.path().join("config/genesis.json").exists());
    assert!(home.path().join("keyring-test/validator.info").exists());
}

#[test]
fn doctor_on_an_empty_home_fails_with_precondition() {
    let home = TempDir::new().unwrap();
    push_validator()
        .args(["doctor", "--bin", "/nonexistent/pchaind", "--home"])
        .arg(home.path())
        .assert()
        .code(3)
        .stdout(predicate::str::contains("push-validator init"));
}

#[test]
fn logs_without_a_log_file_is_a_precondition_failure() {
    let home = TempDir::new().unwrap();
    push_validator()
        .args(["logs", "--home"])
        .arg(home.path())
        .assert()
        .code(3);
}

#[test]
fn status_of_an_empty_home_reports_not_running() {
    let home = TempDir::new().unwrap();
    push_validator()
        .args(["-o", "json", "status", "--bin", "/nonexistent/pchaind", "--home"])
        .arg(home.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"running\": false"))
        .stdout(predicate::str::contains("\"initialized\": false"));
}

#[test]
fn quiet_and_debug_conflict() {
    push_validator()
        .args(["--quiet", "--debug", "status"])
        .assert()
        .code(2);
}
