use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;

const CATALOG: &str = "\
MathTest#add
MathTest#sub
MathTest#mul
StringTest#concat
StringTest#split
";

fn shardline(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("shardline").unwrap();
    cmd.current_dir(dir).env("RUST_LOG", "warn");
    cmd
}

fn write_config(dir: &Path, run_command: &str) {
    let config = format!(
        r#"
[run]
parallel_threads = 2
default_parallel = true

[runner]
run_command = "{}"

[report]
outdir = "reports"
xmlreport = true
"#,
        run_command
    );
    fs::write(dir.join("shardline.toml"), config).unwrap();
    fs::write(dir.join("tests.txt"), CATALOG).unwrap();
}

#[test]
fn test_validate_prints_settings() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), "true");

    shardline(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("suite-parallel"))
        .stdout(predicate::str::contains("Workers: 2"));
}

#[test]
fn test_validate_rejects_bad_config() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("bad.toml"), "[run]\nshard = \"4/2\"\n").unwrap();

    shardline(dir.path())
        .args(["--config", "bad.toml", "validate"])
        .assert()
        .code(2);
}

#[test]
fn test_collect_shard_text() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), "true");

    shardline(dir.path())
        .args(["collect", "--catalog", "tests.txt", "--shard", "1/2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("MathTest#sub"))
        .stdout(predicate::str::contains("StringTest#concat"))
        .stdout(predicate::str::contains("MathTest#add").not())
        .stdout(predicate::str::contains("StringTest#split").not());
}

#[test]
fn test_collect_json_with_selection() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), "true");

    let output = shardline(dir.path())
        .args(["collect", "--catalog", "tests.txt", "--format", "json", "StringTest"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let tests: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(tests.len(), 2);
}

#[test]
fn test_collect_unknown_unit() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), "true");

    shardline(dir.path())
        .args(["collect", "--catalog", "tests.txt", "NoSuchTest"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("NoSuchTest"));
}

#[test]
fn test_invalid_shard_argument() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), "true");

    shardline(dir.path())
        .args(["collect", "--catalog", "tests.txt", "--shard", "3/3"])
        .assert()
        .code(2);
}

#[test]
fn test_run_passing_writes_reports() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), "echo running {suite} {method}");

    shardline(dir.path())
        .args(["run", "--catalog", "tests.txt"])
        .assert()
        .success();

    let xml = fs::read_to_string(dir.path().join("reports/TEST-MathTest.xml")).unwrap();
    assert!(xml.contains(r#"<testsuite name="MathTest" tests="3" failures="0" errors="0" skipped="0""#));
    assert!(xml.contains("running MathTest add"));
    assert!(dir.path().join("reports/TEST-StringTest.xml").exists());
}

#[test]
fn test_run_failure_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), "test {method} != sub");

    shardline(dir.path())
        .args(["run", "--catalog", "tests.txt", "--num-retries", "1"])
        .assert()
        .code(1);

    let xml = fs::read_to_string(dir.path().join("reports/TEST-MathTest.xml")).unwrap();
    assert!(xml.contains(r#"failures="1""#));
}

#[test]
fn test_run_single_shard_only_writes_owned_suites() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), "true");

    shardline(dir.path())
        .args(["run", "--catalog", "tests.txt", "--shard", "0/2", "StringTest#split"])
        .assert()
        .success();

    // Position 0 of the selected catalog is StringTest#split.
    assert!(dir.path().join("reports/TEST-StringTest.xml").exists());
    assert!(!dir.path().join("reports/TEST-MathTest.xml").exists());
}
