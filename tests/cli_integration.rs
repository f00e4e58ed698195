//! Integration tests for the mend CLI

use assert_cmd::cargo;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Get a Command for the mend binary
fn mend() -> Command {
    Command::new(cargo::cargo_bin!("mend"))
}

fn has_git() -> bool {
    which::which("git").is_ok()
}

#[test]
fn test_help() {
    mend()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Bounded self-correction"));
}

#[test]
fn test_version() {
    mend()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

// ============================================================================
// classify / normalize
// ============================================================================

#[test]
fn test_classify_file() {
    let temp = TempDir::new().unwrap();
    let output = temp.path().join("out.txt");
    fs::write(&output, "FAIL src/math.test.ts\n  Expected 1 to be 2\n").unwrap();

    mend()
        .arg("classify")
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"failureType\": \"TEST_ASSERTION\""))
        .stdout(predicate::str::contains("src/math.test.ts"));
}

#[test]
fn test_classify_stdin_tooling() {
    let assert = mend()
        .arg("classify")
        .write_stdin("Error: Cannot find module 'jest'\n")
        .assert()
        .success();

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(json["failureType"], "TOOLING_ENV");
    assert_eq!(json["isCodeFixable"], false);
    assert_eq!(json["failureSignature"].as_str().unwrap().len(), 16);
}

#[test]
fn test_normalize_stdin() {
    mend()
        .arg("normalize")
        .write_stdin("2024-01-02T10:11:12Z /home/dev/app took 12ms\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("[TIMESTAMP] [HOME]/app took [DURATION]"));
}

#[test]
fn test_classify_missing_file_fails() {
    mend()
        .arg("classify")
        .arg("/nonexistent/output.txt")
        .assert()
        .failure();
}

// ============================================================================
// options
// ============================================================================

#[test]
fn test_options_budget_exhausted() {
    mend()
        .args(["options", "budget_exhausted", "--remaining", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("retry_repair_one_more"))
        .stdout(predicate::str::contains("export"));
}

#[test]
fn test_options_scope_denied_lists_files() {
    mend()
        .args(["options", "scope_expansion_denied", "--file", "package.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("approve_scope"))
        .stdout(predicate::str::contains("package.json"));
}

#[test]
fn test_options_json() {
    let assert = mend()
        .args(["options", "repeated_failure", "--json"])
        .assert()
        .success();

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let options: Vec<serde_json::Value> = serde_json::from_str(&stdout).unwrap();
    let ids: Vec<&str> = options.iter().map(|o| o["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["change_command", "stop", "export"]);
}

#[test]
fn test_options_unknown_reason() {
    mend()
        .args(["options", "bored"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Valid reasons"));
}

// ============================================================================
// run
// ============================================================================

#[test]
fn test_run_passing_command() {
    let temp = TempDir::new().unwrap();

    mend()
        .arg("--project")
        .arg(temp.path())
        .args(["run", "--command", "true", "--generator", "true"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Verification passed"));
}

#[test]
fn test_run_without_command_is_config_error() {
    let temp = TempDir::new().unwrap();

    mend()
        .arg("--project")
        .arg(temp.path())
        .args(["run", "--generator", "true"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("No test command"));
}

#[test]
fn test_run_rejects_invalid_config() {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join(".mend")).unwrap();
    fs::write(
        temp.path().join(".mend/config.toml"),
        "testCommand = \"true\"\n[policy]\nmaxRepairIterations = 0\n",
    )
    .unwrap();

    mend()
        .arg("--project")
        .arg(temp.path())
        .args(["run", "--generator", "true"])
        .assert()
        .code(7);
}

#[test]
fn test_run_tooling_failure_stops() {
    if !has_git() {
        return;
    }
    let temp = TempDir::new().unwrap();

    mend()
        .arg("--project")
        .arg(temp.path())
        .args([
            "run",
            "--command",
            "echo \"Error: Cannot find module 'jest'\"; exit 1",
            "--generator",
            "cat > /dev/null",
            "--events",
            "events.jsonl",
        ])
        .assert()
        .code(3)
        .stdout(predicate::str::contains("tooling_env_failure"))
        .stdout(predicate::str::contains("change_command"));

    let log = fs::read_to_string(temp.path().join("events.jsonl")).unwrap();
    assert_eq!(log.lines().count(), 2);
    assert!(log.contains("repair_loop_stopped"));
}

#[test]
fn test_run_repairs_with_git_apply() {
    if !has_git() {
        return;
    }
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("value.txt"), "broken\n").unwrap();
    fs::write(
        temp.path().join("gen.sh"),
        r#"cat > /dev/null
if [ "$MEND_STAGE" = "diagnose" ]; then exit 0; fi
printf '%s' '{"diffId":"fix-1","unifiedDiff":"--- a/value.txt\n+++ b/value.txt\n@@ -1 +1 @@\n-broken\n+fixed\n","summary":"fix value"}'
"#,
    )
    .unwrap();

    mend()
        .arg("--project")
        .arg(temp.path())
        .args([
            "run",
            "--command",
            "grep -q fixed value.txt || { echo 'FAIL value.txt: expected broken to be fixed'; exit 1; }",
            "--generator",
            "sh gen.sh",
            "--allow",
            "value.txt",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Repaired after 1 diff(s)"));

    let value = fs::read_to_string(temp.path().join("value.txt")).unwrap();
    assert_eq!(value, "fixed\n");
}

#[test]
fn test_run_denied_scope_stops() {
    if !has_git() {
        return;
    }
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("value.txt"), "broken\n").unwrap();
    fs::write(
        temp.path().join("gen.sh"),
        r#"cat > /dev/null
printf '%s' '{"diffId":"fix-1","unifiedDiff":"--- a/value.txt\n+++ b/value.txt\n@@ -1 +1 @@\n-broken\n+fixed\n"}'
"#,
    )
    .unwrap();

    mend()
        .arg("--project")
        .arg(temp.path())
        .args([
            "run",
            "--command",
            "grep -q fixed value.txt || { echo 'FAIL expected broken to be fixed'; exit 1; }",
            "--generator",
            "sh gen.sh",
            "--deny-scope",
        ])
        .assert()
        .code(3)
        .stdout(predicate::str::contains("scope_expansion_denied"))
        .stdout(predicate::str::contains("approve_scope"));

    let value = fs::read_to_string(temp.path().join("value.txt")).unwrap();
    assert_eq!(value, "broken\n");
}
