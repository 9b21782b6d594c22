//! Integration tests for the singlebell CLI.

use std::fs;
use std::process::Command;
use tempfile::tempdir;

/// Get the path to the singlebell binary.
fn singlebell_bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_singlebell"));
    // Keep a user's own settings out of the way.
    cmd.env_remove("SINGLEBELL_CONFIG")
        .env_remove("SINGLEBELL_STORE_DIR")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_flag() {
    let output = singlebell_bin()
        .arg("--help")
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("singlebell"));
    assert!(stdout.contains("--stop"));
    assert!(stdout.contains("--status"));
    assert!(stdout.contains("--interval"));
    assert!(stdout.contains("--store-dir"));
}

#[test]
fn test_version_flag() {
    let output = singlebell_bin()
        .arg("--version")
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("singlebell"));
    assert!(stdout.contains("0.") || stdout.contains("1."));
}

#[test]
fn test_env_vars_documented() {
    let output = singlebell_bin()
        .args(["--help"])
        .output()
        .expect("Failed to execute command");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("SINGLEBELL_CONFIG"));
    assert!(stdout.contains("SINGLEBELL_STORE_DIR"));
}

#[test]
fn test_sample_config() {
    let output = singlebell_bin()
        .arg("--sample-config")
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("[lease]"));
    assert!(stdout.contains("[cadence]"));
}

#[test]
fn test_invalid_interval() {
    let output = singlebell_bin()
        .args(["--status", "-i", "invalid"])
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
}

#[test]
fn test_missing_config_file() {
    let dir = tempdir().unwrap();
    let output = singlebell_bin()
        .args(["--status", "-c"])
        .arg(dir.path().join("nope.toml"))
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_status_json_on_empty_store() {
    let dir = tempdir().unwrap();
    let output = singlebell_bin()
        .args(["--status", "--json", "--no-bus", "--store-dir"])
        .arg(dir.path())
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("status output is JSON");
    assert!(value["playback"].is_null());
    assert!(value["active_tab"].is_null());
}

#[test]
fn test_status_shows_holder() {
    let dir = tempdir().unwrap();
    let now = chrono::Utc::now().timestamp_millis();
    fs::write(
        dir.path().join("singlebell.playback-lock.json"),
        format!(r#"{{"version":1,"ownerId":"other-tab","acquiredAt":{}}}"#, now),
    )
    .unwrap();

    let output = singlebell_bin()
        .args(["--status", "--json", "--no-bus", "--store-dir"])
        .arg(dir.path())
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["playback"]["owner_id"], "other-tab");
    assert_eq!(value["playback"]["fresh"], true);
}

#[test]
fn test_stop_clears_lease() {
    let dir = tempdir().unwrap();
    let lock = dir.path().join("singlebell.playback-lock.json");
    let now = chrono::Utc::now().timestamp_millis();
    fs::write(
        &lock,
        format!(r#"{{"version":1,"ownerId":"other-tab","acquiredAt":{}}}"#, now),
    )
    .unwrap();

    let output = singlebell_bin()
        .args(["--stop", "--no-bus", "--store-dir"])
        .arg(dir.path())
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    assert!(!lock.exists());
}

#[test]
fn test_stop_and_status_conflict() {
    let output = singlebell_bin()
        .args(["--stop", "--status"])
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
}
