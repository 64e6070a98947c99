//! End-to-end tests for Scholar CLI commands.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// A source file in a temporary directory.
struct TestSource {
    _temp_dir: TempDir,
    path: PathBuf,
}

impl TestSource {
    fn new(source: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("cell.py");
        fs::write(&path, source).expect("Failed to write source");
        Self {
            _temp_dir: temp_dir,
            path,
        }
    }
}

fn scholar() -> Command {
    Command::cargo_bin("scholar").unwrap()
}

#[test]
fn test_help_lists_commands() {
    scholar()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("run"));
}

#[test]
fn test_run_missing_file_fails() {
    scholar()
        .args(["run", "/nonexistent/cell.py"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Cannot read"));
}

#[test]
fn test_serve_without_identity_fails() {
    scholar()
        .arg("serve")
        .env_remove("JWT_SECRET_KEY")
        .env_remove("SCHOLAR_IDENTITY_HEADER")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No identity provider configured"));
}

#[test]
#[ignore = "Requires python3"]
fn test_run_prints_outputs() {
    let source = TestSource::new("print('hello')\n6 * 7\n");
    scholar()
        .arg("run")
        .arg(&source.path)
        .assert()
        .success()
        .stdout(predicate::str::contains("hello"))
        .stdout(predicate::str::contains("Out[1]"))
        .stdout(predicate::str::contains("42"));
}

#[test]
#[ignore = "Requires python3"]
fn test_run_exception_exits_non_zero() {
    let source = TestSource::new("raise ValueError('bad')\n");
    scholar()
        .arg("run")
        .arg(&source.path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("ValueError: bad"));
}

#[test]
#[ignore = "Requires python3"]
fn test_run_reads_stdin() {
    scholar()
        .args(["run", "-"])
        .write_stdin("print(1 + 1)\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("2"));
}
