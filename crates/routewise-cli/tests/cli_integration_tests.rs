//! CLI integration tests for routewise
//!
//! Tests the routewise CLI commands end-to-end using assert_cmd.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;
use tempfile::TempDir;

const CONFIG: &str = r#"
[[domains]]
name = "routing"
seed = 42

[domains.policy]
type = "doubly_robust"
dim = 3

[[domains]]
name = "checkout"
seed = 7

[domains.policy]
type = "thompson_sampling"

[[experiments]]
id = "tree-shadow"
domain = "routing"
shadow_samples = 20
description = "Offset tree shadowing the regression policy"

[[experiments.variants]]
name = "tree"
traffic_fraction = 1.0

[experiments.variants.policy]
type = "offset_tree"
dim = 3
min_samples_split = 20
"#;

fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join("routewise.toml");
    std::fs::write(&path, contents).unwrap();
    path
}

#[allow(deprecated)]
fn routewise_cmd() -> Command {
    Command::cargo_bin("routewise").unwrap()
}

#[test]
fn test_help_lists_commands() {
    routewise_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("simulate"))
        .stdout(predicate::str::contains("experiment"));
}

#[test]
fn test_check_valid_config() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, CONFIG);

    routewise_cmd()
        .arg("check")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Config OK"))
        .stdout(predicate::str::contains("routing"))
        .stdout(predicate::str::contains("doubly_robust"))
        .stdout(predicate::str::contains("tree-shadow"));
}

#[test]
fn test_check_json_output() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, CONFIG);

    let output = routewise_cmd()
        .args(["--format", "json", "check"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["valid"], true);
    assert_eq!(json["domains"].as_array().unwrap().len(), 2);
    assert_eq!(json["experiments"][0], "tree-shadow");
}

#[test]
fn test_check_missing_file_fails() {
    let dir = TempDir::new().unwrap();

    routewise_cmd()
        .arg("check")
        .arg(dir.path().join("absent.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn test_check_rejects_unknown_domain_reference() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, &CONFIG.replace("domain = \"routing\"", "domain = \"nowhere\""));

    routewise_cmd()
        .arg("check")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown domain"));
}

#[test]
fn test_check_rejects_invalid_policy() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, &CONFIG.replace("dim = 3\n\n[[domains]]", "dim = 0\n\n[[domains]]"));

    routewise_cmd()
        .arg("check")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("dim"));
}

#[test]
fn test_simulate_text_output() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, CONFIG);

    routewise_cmd()
        .arg("simulate")
        .arg(&path)
        .args(["--domain", "checkout", "--rounds", "300", "--seed", "1"])
        .args(["--arm", "fast=0.9", "--arm", "slow=0.1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Domain: checkout (thompson_sampling"))
        .stdout(predicate::str::contains("Rounds: 300"))
        .stdout(predicate::str::contains("fast"))
        .stdout(predicate::str::contains("Posteriors:"));
}

#[test]
fn test_simulate_json_learns_better_arm() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, CONFIG);

    let output = routewise_cmd()
        .args(["--format", "json", "simulate"])
        .arg(&path)
        .args(["--domain", "checkout", "--rounds", "500", "--seed", "3"])
        .args(["--arm", "fast=0.9", "--arm", "slow=0.1"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["rounds"], 500);
    assert_eq!(json["stats"]["total_updates"], 500);
    assert_eq!(json["stats"]["seed"], 7);

    let arms = json["stats"]["arms"].as_array().unwrap();
    let pulls = |name: &str| {
        arms.iter()
            .find(|a| a["arm"] == name)
            .and_then(|a| a["pulls"].as_u64())
            .unwrap_or(0)
    };
    assert!(pulls("fast") > pulls("slow"));
}

#[test]
fn test_simulate_is_reproducible_with_seeds() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, CONFIG);

    let run = || {
        let output = routewise_cmd()
            .args(["--format", "json", "simulate"])
            .arg(&path)
            .args(["--domain", "routing", "--rounds", "200", "--seed", "9"])
            .args(["--arm", "a=0.6", "--arm", "b=0.4"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        (json["total_reward"].clone(), json["stats"]["arms"].clone())
    };

    assert_eq!(run(), run());
}

#[test]
fn test_simulate_unknown_domain_fails() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, CONFIG);

    routewise_cmd()
        .arg("simulate")
        .arg(&path)
        .args(["--domain", "missing", "--arm", "a=0.5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_simulate_rejects_bad_arm() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, CONFIG);

    routewise_cmd()
        .arg("simulate")
        .arg(&path)
        .args(["--domain", "checkout", "--arm", "a=1.5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("probability"));
}

#[test]
fn test_experiment_report() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, CONFIG);

    routewise_cmd()
        .arg("experiment")
        .arg(&path)
        .args(["--id", "tree-shadow", "--rounds", "400", "--seed", "4"])
        .args(["--arm", "a=0.7", "--arm", "b=0.3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Experiment: tree-shadow"))
        .stdout(predicate::str::contains("Baseline: routing (doubly_robust)"))
        .stdout(predicate::str::contains("tree"));
}

#[test]
fn test_experiment_json_report() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, CONFIG);

    let output = routewise_cmd()
        .args(["--format", "json", "experiment"])
        .arg(&path)
        .args(["--id", "tree-shadow", "--rounds", "5", "--seed", "4"])
        .args(["--arm", "a=0.7", "--arm", "b=0.3"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["baseline"]["pulls"], 5);
    let variant = &json["variants"][0];
    assert_eq!(variant["name"], "tree");
    // Five rounds cannot reach twenty matched samples
    assert_eq!(variant["status"], "insufficient_data");
    assert_eq!(variant["recommendation"], "insufficient_data");
}

#[test]
fn test_experiment_unknown_id_fails() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, CONFIG);

    routewise_cmd()
        .arg("experiment")
        .arg(&path)
        .args(["--id", "nope", "--arm", "a=0.5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not defined"));
}
