//! Binary execution tests for the local_guide CLI
//!
//! Every command that touches the network runs with `--offline` so the tests
//! never depend on a live backend.

use assert_cmd::Command;
use tempfile::TempDir;

fn local_guide(cache: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("local_guide").unwrap();
    cmd.arg("--cache-dir")
        .arg(cache.path())
        .arg("--api-url")
        .arg("http://127.0.0.1:1")
        .arg("--quiet")
        .arg("--no-color");
    cmd
}

fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

#[test]
fn test_help_lists_subcommands() {
    let output = Command::cargo_bin("local_guide")
        .unwrap()
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    for sub in ["preload", "stats", "health", "cleanup", "recommendations", "capabilities"] {
        assert!(help.contains(sub), "missing {sub} in help");
    }
}

#[test]
fn test_version() {
    Command::cargo_bin("local_guide")
        .unwrap()
        .arg("--version")
        .assert()
        .success();
}

#[test]
fn test_print_cache_dir_from_env() {
    let temp_dir = TempDir::new().unwrap();
    let output = Command::cargo_bin("local_guide")
        .unwrap()
        .env("LOCAL_GUIDE_CACHE_DIR", temp_dir.path())
        .arg("print-cache-dir")
        .output()
        .unwrap();
    assert!(output.status.success());
    let printed = String::from_utf8_lossy(&output.stdout);
    assert_eq!(printed.trim(), temp_dir.path().display().to_string());
}

#[test]
fn test_flag_overrides_env_cache_dir() {
    let env_dir = TempDir::new().unwrap();
    let flag_dir = TempDir::new().unwrap();
    let output = Command::cargo_bin("local_guide")
        .unwrap()
        .env("LOCAL_GUIDE_CACHE_DIR", env_dir.path())
        .arg("--cache-dir")
        .arg(flag_dir.path())
        .arg("print-cache-dir")
        .output()
        .unwrap();
    let printed = String::from_utf8_lossy(&output.stdout);
    assert_eq!(printed.trim(), flag_dir.path().display().to_string());
}

#[test]
fn test_stats_on_empty_cache() {
    let cache = TempDir::new().unwrap();
    let output = local_guide(&cache).arg("--offline").arg("stats").output().unwrap();
    assert!(output.status.success());
    let json = stdout_json(&output);
    assert_eq!(json["stats"]["total_items"], 0);
    assert_eq!(json["metrics"]["hits"], 0);
}

#[test]
fn test_capabilities_offline() {
    let cache = TempDir::new().unwrap();
    let output = local_guide(&cache)
        .arg("--offline")
        .arg("capabilities")
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = stdout_json(&output);
    assert_eq!(json["can_use_speech"], false);
    assert_eq!(json["can_browse_recommendations"], false);
}

#[test]
fn test_offline_preload_reports_failure() {
    let cache = TempDir::new().unwrap();
    let output = local_guide(&cache)
        .arg("--offline")
        .arg("preload")
        .arg("--force")
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = stdout_json(&output);
    assert_eq!(json["success"], false);
    assert!(!json["errors"].as_array().unwrap().is_empty());
}

#[test]
fn test_offline_recommendations_without_cache_fail() {
    let cache = TempDir::new().unwrap();
    local_guide(&cache)
        .arg("--offline")
        .arg("recommendations")
        .arg("--category")
        .arg("street_food")
        .assert()
        .failure();
}

#[test]
fn test_clear_and_cleanup_succeed() {
    let cache = TempDir::new().unwrap();
    let output = local_guide(&cache).arg("clear").output().unwrap();
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["success"], true);

    let output = local_guide(&cache)
        .arg("cleanup")
        .arg("--max-age-hours")
        .arg("1")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["expired_removed"], 0);
}
