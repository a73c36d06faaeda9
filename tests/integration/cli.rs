use std::{fs, path::Path};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn fixture(name: &str) -> String {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
        .to_string_lossy()
        .into_owned()
}

fn procman() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("procman"))
}

#[test]
fn show_prints_resolved_launch_plan() {
    let output = procman()
        .args(["show", "--config", &fixture("ecosystem.config.yaml")])
        .output()
        .expect("failed to run show");
    assert!(output.status.success());

    let plans: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("show emits JSON");
    let plan = &plans[0];
    assert_eq!(plan["name"], "myapp");
    assert_eq!(plan["program"], "node");
    assert_eq!(plan["env"]["PORT"], "3000");
    assert_eq!(plan["env"]["NODE_ENV"], "development");
}

#[test]
fn show_applies_deployment_mode() {
    procman()
        .args([
            "show",
            "--config",
            &fixture("ecosystem.config.json"),
            "--env",
            "production",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"NODE_ENV\": \"production\""));
}

#[test]
fn invalid_config_exits_with_error() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("ecosystem.config.yaml");
    fs::write(&config, "apps: []\n").unwrap();

    procman()
        .args(["show", "--config", config.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("NoApps"));
}

#[test]
fn show_finds_default_config_in_working_directory() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("ecosystem.config.yml"),
        "apps:\n  - name: api\n    script: server.py\n",
    )
    .unwrap();

    procman()
        .current_dir(dir.path())
        .arg("show")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"program\": \"python3\""));
}

#[test]
fn start_fails_when_nothing_can_launch() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("ecosystem.config.yaml");
    fs::write(
        &config,
        "apps:\n  - name: ghost\n    script: ./missing\n    interpreter: none\n",
    )
    .unwrap();

    procman()
        .args(["start", "--config", config.to_str().unwrap()])
        .timeout(std::time::Duration::from_secs(10))
        .assert()
        .failure()
        .stderr(predicate::str::contains("NothingStarted"));
}

#[test]
fn start_rejects_unknown_only_app() {
    procman()
        .args([
            "start",
            "--config",
            &fixture("ecosystem.config.yaml"),
            "--only",
            "nope",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("UnknownApp"));
}
