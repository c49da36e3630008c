//! Integration tests for freequota-cli
//!
//! These tests verify the CLI commands work end-to-end against a temporary
//! store file. Tests run serially to avoid clobbering shared env vars.

use assert_cmd::Command;
use predicates::prelude::*;
use serial_test::serial;
use tempfile::TempDir;

/// Get a Command for the freequota binary with a clean environment
fn freequota() -> Command {
    let mut cmd = Command::cargo_bin("freequota").unwrap();
    cmd.env_remove("FREEQUOTA_SUBJECT")
        .env_remove("FREEQUOTA_TOKEN")
        .env_remove("FREEQUOTA_STORE_PATH")
        .env_remove("FREEQUOTA_LIMIT")
        .env("FREEQUOTA_API_URL", "http://127.0.0.1:9");
    cmd
}

/// Command bound to a store file inside `dir` and subject 42
fn with_store(dir: &TempDir) -> Command {
    let mut cmd = freequota();
    cmd.arg("--store")
        .arg(dir.path().join("quota.json"))
        .args(["--subject", "42"]);
    cmd
}

fn stored_value(dir: &TempDir) -> Option<String> {
    let text = std::fs::read_to_string(dir.path().join("quota.json")).ok()?;
    let json: serde_json::Value = serde_json::from_str(&text).ok()?;
    json.get("free_used:ai_chat:42")?.as_str().map(str::to_string)
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
#[serial]
fn test_cli_help() {
    freequota()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("freequota"))
        .stdout(predicate::str::contains("COMMAND").or(predicate::str::contains("Commands")));
}

#[test]
#[serial]
fn test_cli_version() {
    freequota()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("freequota"));
}

#[test]
#[serial]
fn test_subcommand_help() {
    for sub in ["status", "sync", "ask", "bump", "rollback", "set", "watch"] {
        freequota()
            .args([sub, "--help"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Usage"));
    }
}

#[test]
#[serial]
fn test_invalid_format_is_rejected() {
    freequota()
        .args(["status", "--format", "yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid format"));
}

// =============================================================================
// Local Counter Tests
// =============================================================================

#[test]
#[serial]
fn test_status_starts_at_zero() {
    let dir = TempDir::new().unwrap();
    with_store(&dir)
        .args(["status", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"used\": 0"))
        .stdout(predicate::str::contains("\"limit\": 5"));
}

#[test]
#[serial]
fn test_bump_persists_between_invocations() {
    let dir = TempDir::new().unwrap();
    with_store(&dir).arg("bump").assert().success();
    with_store(&dir).arg("bump").assert().success();

    assert_eq!(stored_value(&dir).as_deref(), Some("2"));
    with_store(&dir)
        .args(["status", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"used\": 2"));
}

#[test]
#[serial]
fn test_bump_clamps_at_limit() {
    let dir = TempDir::new().unwrap();
    for _ in 0..4 {
        with_store(&dir).args(["bump", "--limit", "3"]).assert().success();
    }
    assert_eq!(stored_value(&dir).as_deref(), Some("3"));
}

#[test]
#[serial]
fn test_bump_reports_remaining() {
    let dir = TempDir::new().unwrap();
    with_store(&dir).args(["set", "3"]).assert().success();
    with_store(&dir)
        .arg("bump")
        .assert()
        .success()
        .stderr(predicate::str::contains("4 of 5 used (1 left)"));
    with_store(&dir)
        .arg("bump")
        .assert()
        .success()
        .stderr(predicate::str::contains("free limit reached"));
}

#[test]
#[serial]
fn test_rollback_never_negative() {
    let dir = TempDir::new().unwrap();
    with_store(&dir).arg("rollback").assert().success();
    assert_eq!(stored_value(&dir).as_deref(), Some("0"));
}

#[test]
#[serial]
fn test_set_accepts_and_rejects() {
    let dir = TempDir::new().unwrap();
    with_store(&dir).args(["set", "4"]).assert().success();
    assert_eq!(stored_value(&dir).as_deref(), Some("4"));

    with_store(&dir)
        .args(["set", "abc"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid count"));
    assert_eq!(stored_value(&dir).as_deref(), Some("4"));
}

#[test]
#[serial]
fn test_exempt_subject_is_not_tracked() {
    let dir = TempDir::new().unwrap();
    with_store(&dir).args(["bump", "--exempt"]).assert().success();
    assert_eq!(stored_value(&dir), None);
}

#[test]
#[serial]
fn test_status_without_subject() {
    let dir = TempDir::new().unwrap();
    freequota()
        .arg("--store")
        .arg(dir.path().join("quota.json"))
        .arg("status")
        .assert()
        .success()
        .stderr(predicate::str::contains("No subject"));
}

// =============================================================================
// Server Tests (no server reachable)
// =============================================================================

#[test]
#[serial]
fn test_sync_without_token_falls_back() {
    let dir = TempDir::new().unwrap();
    with_store(&dir).args(["set", "2"]).assert().success();

    with_store(&dir)
        .args(["sync", "--format", "json"])
        .assert()
        .success()
        .stderr(predicate::str::contains("last stored value (2)"))
        .stdout(predicate::str::contains("\"used\": 2"));
}

#[test]
#[serial]
fn test_ask_failure_rolls_back() {
    let dir = TempDir::new().unwrap();
    with_store(&dir).args(["set", "1"]).assert().success();

    with_store(&dir)
        .args(["ask", "Where should we eat?", "--format", "json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Request failed"))
        .stdout(predicate::str::contains("\"status\": \"failed\""))
        .stdout(predicate::str::contains("\"used\": 1"));
    assert_eq!(stored_value(&dir).as_deref(), Some("1"));
}

#[test]
#[serial]
fn test_ask_blocked_when_exhausted() {
    let dir = TempDir::new().unwrap();
    with_store(&dir).args(["set", "5"]).assert().success();

    with_store(&dir)
        .args(["ask", "One more?", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"blocked\""));
}
