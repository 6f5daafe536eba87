//! Integration tests for the aiml CLI
//!
//! These run the actual binary against temp files and verify output.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn aiml_cmd() -> Command {
    Command::cargo_bin("aiml").unwrap()
}

fn write_workflow(dir: &TempDir, name: &str, content: &str) -> String {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path.to_string_lossy().to_string()
}

#[test]
fn help_flag_shows_usage() {
    aiml_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("agent workflow compiler"));
}

#[test]
fn check_accepts_a_valid_document() {
    let dir = TempDir::new().unwrap();
    let file = write_workflow(
        &dir,
        "ok.aiml",
        r#"<workflow id="w"><state id="s"><llm model="m" prompt="hi"/></state></workflow>"#,
    );
    aiml_cmd()
        .args(["check", &file])
        .assert()
        .success()
        .stdout(predicate::str::contains("ok"));
}

#[test]
fn check_fails_on_structural_errors() {
    let dir = TempDir::new().unwrap();
    let file = write_workflow(
        &dir,
        "bad.aiml",
        r#"<workflow id="w"><state id="a"><transition target="ghost"/></state></workflow>"#,
    );
    aiml_cmd()
        .args(["check", &file])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn check_reports_healing_warnings() {
    let dir = TempDir::new().unwrap();
    let file = write_workflow(&dir, "heal.aiml", r#"<state id="s">say something</state>"#);
    aiml_cmd()
        .args(["check", &file])
        .assert()
        .success()
        .stdout(predicate::str::contains("AIML012"));
}

#[test]
fn graph_dumps_nodes() {
    let dir = TempDir::new().unwrap();
    let file = write_workflow(
        &dir,
        "g.aiml",
        r#"<workflow id="w"><state id="s"><llm model="m" prompt="p"/></state></workflow>"#,
    );
    aiml_cmd()
        .args(["graph", &file])
        .assert()
        .success()
        .stdout(predicate::str::contains("final"))
        .stdout(predicate::str::contains("error"));
}

#[test]
fn run_with_mock_provider_prints_output() {
    let dir = TempDir::new().unwrap();
    let file = write_workflow(
        &dir,
        "run.aiml",
        r#"<workflow id="w"><state id="s"><send content="deterministic output"/></state></workflow>"#,
    );
    aiml_cmd()
        .args(["run", &file, "--input", "hello"])
        .assert()
        .success()
        .stdout(predicate::str::contains("deterministic output"));
}

#[test]
fn missing_file_is_an_error() {
    aiml_cmd()
        .args(["check", "/nonexistent/nope.aiml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read"));
}
