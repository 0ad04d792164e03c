// rangescan/tests/cli_integration.rs

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::{NamedTempFile, TempDir};

/// Command isolated from any config files on the host.
fn rangescan(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("rangescan").unwrap();
    cmd.current_dir(home.path())
        .env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path().join("config"))
        .env_remove("RS_CONFIG")
        .env_remove("RS_PROXY_FILE")
        .env_remove("RS_WORKERS")
        .env_remove("RUST_LOG");
    cmd
}

/// Helper to create a test proxy list file
fn create_proxy_file(lines: &[&str]) -> NamedTempFile {
    let file = NamedTempFile::new().expect("Failed to create temp file");
    fs::write(file.path(), lines.join("\n")).expect("Failed to write to temp file");
    file
}

#[test]
fn test_help_lists_flags() {
    let home = TempDir::new().unwrap();
    rangescan(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--workers"))
        .stdout(predicate::str::contains("--proxy-file"))
        .stdout(predicate::str::contains("--exclude-banned"))
        .stdout(predicate::str::contains("--verify-proxies"));
}

#[test]
fn test_version_flag() {
    let home = TempDir::new().unwrap();
    rangescan(&home)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_missing_range_is_usage_error() {
    let home = TempDir::new().unwrap();
    rangescan(&home).arg("100").assert().failure();
}

#[test]
fn test_high_must_exceed_low() {
    let home = TempDir::new().unwrap();
    rangescan(&home)
        .args(["500", "500"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));

    rangescan(&home)
        .args(["500", "100"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_span_limit() {
    let home = TempDir::new().unwrap();
    rangescan(&home)
        .args(["0", "30001"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("30000"));
}

#[test]
fn test_negative_low_is_rejected() {
    let home = TempDir::new().unwrap();
    rangescan(&home)
        .args(["-10", "10"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_conflicting_output_formats() {
    let home = TempDir::new().unwrap();
    rangescan(&home)
        .args(["1", "10", "--json", "--csv"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("multiple output formats"));
}

#[test]
fn test_worker_bounds() {
    let home = TempDir::new().unwrap();
    rangescan(&home)
        .args(["1", "10", "--workers", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Workers must be between 1 and 256"));

    rangescan(&home)
        .args(["1", "10", "-w", "300"])
        .assert()
        .failure();
}

#[test]
fn test_missing_config_file() {
    let home = TempDir::new().unwrap();
    rangescan(&home)
        .args(["1", "10", "--config", "does-not-exist.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config file"));
}

#[test]
fn test_invalid_config_file() {
    let home = TempDir::new().unwrap();
    let config = home.path().join("bad.toml");
    fs::write(&config, "[scan]\nworkers = 0\n").unwrap();

    rangescan(&home)
        .args(["1", "10", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Workers must be between 1 and 256"));
}

#[test]
fn test_proxy_file_without_entries() {
    let home = TempDir::new().unwrap();
    let proxies = create_proxy_file(&["# nothing here", "not-a-proxy", ""]);

    rangescan(&home)
        .args(["1", "10", "--proxy-file"])
        .arg(proxies.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("no usable host:port entries"));
}

#[test]
fn test_unreachable_proxy_reports_failed_batch() {
    let home = TempDir::new().unwrap();
    // Port 1 refuses connections, so every attempt fails fast.
    let proxies = create_proxy_file(&["127.0.0.1:1"]);

    rangescan(&home)
        .args(["1", "11", "-w", "1", "--max-attempts", "2", "--proxy-file"])
        .arg(proxies.path())
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("could not be verified"));
}
