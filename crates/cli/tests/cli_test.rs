use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn fleetroll() -> Command {
    let mut cmd = Command::cargo_bin("fleetroll").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &TempDir, content: &str) {
    fs::write(dir.path().join(".fleetroll.toml"), content).unwrap();
}

const LOCAL_CONFIG: &str = r#"
[api]
base_url = "http://127.0.0.1:9"
app = "test-app"
"#;

#[test]
fn test_help() {
    fleetroll()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Lease-gated rolling updates"))
        .stdout(predicate::str::contains("deploy"))
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("images"));
}

#[test]
fn test_deploy_help_lists_flags() {
    fleetroll()
        .args(["deploy", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--fleet"))
        .stdout(predicate::str::contains("--no-push-forward"))
        .stdout(predicate::str::contains("--headless"));
}

#[test]
fn test_missing_config_fails() {
    let temp_dir = TempDir::new().unwrap();

    fleetroll()
        .current_dir(temp_dir.path())
        .args(["plan", "--fleet", "fleet.json"])
        .assert()
        .failure()
        .stderr(predicate::str::starts_with("Error:"));
}

#[test]
fn test_invalid_config_fails() {
    let temp_dir = TempDir::new().unwrap();
    write_config(&temp_dir, "[api]\napp = \"\"\n");

    fleetroll()
        .current_dir(temp_dir.path())
        .args(["plan", "--fleet", "fleet.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_missing_fleet_file_fails_before_any_request() {
    let temp_dir = TempDir::new().unwrap();
    write_config(&temp_dir, LOCAL_CONFIG);

    fleetroll()
        .current_dir(temp_dir.path())
        .args(["plan", "--fleet", "does-not-exist.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read fleet file"));
}

#[test]
fn test_malformed_fleet_file_fails() {
    let temp_dir = TempDir::new().unwrap();
    write_config(&temp_dir, LOCAL_CONFIG);
    fs::write(temp_dir.path().join("fleet.json"), "{ not json").unwrap();

    fleetroll()
        .current_dir(temp_dir.path())
        .args(["deploy", "--headless", "--fleet", "fleet.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse fleet file"));
}

#[test]
fn test_explicit_config_path() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("custom.toml");
    fs::write(&config_path, LOCAL_CONFIG).unwrap();

    // Config wird gefunden, scheitert erst an der Fleet-Datei
    fleetroll()
        .current_dir(temp_dir.path())
        .arg("--config")
        .arg(&config_path)
        .args(["plan", "--fleet", "missing.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read fleet file"));
}
