//! CLI test cases.
//!
//! These run offline: the `echo` classifier needs no API key, and the pages
//! we upload are rejected by content sniffing before `tesseract` would ever
//! be started.

use std::{fs, path::Path, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("docproc").unwrap()
}

/// Upload `data` to `key` under `root` and return the matching event.
fn upload(root: &Path, key: &str, data: &[u8]) -> String {
    let path = root.join(key);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, data).unwrap();
    format!(r#"{{"source_location": "uploads", "object_key": "{key}"}}"#)
}

/// A `run` command that can't reach any external service.
fn offline_run(root: &Path, events_path: &Path) -> Command {
    let mut cmd = cmd();
    cmd.arg("run")
        .arg(events_path)
        .arg("--root")
        .arg(root)
        .args(["--ocr", "tesseract", "--classifier", "echo", "--window", "0.2"]);
    cmd
}

#[test]
fn test_help() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("status"));
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_schema() {
    cmd()
        .args(["schema", "DocumentRecord"])
        .assert()
        .success()
        .stdout(predicate::str::contains("pages_received"));
    cmd()
        .args(["schema", "Timeline"])
        .assert()
        .success()
        .stdout(predicate::str::contains("classification"));
    cmd().args(["schema", "Invoice"]).assert().failure();
}

#[test]
fn test_status_on_empty_root() {
    let root = tempfile::tempdir().unwrap();
    cmd()
        .arg("status")
        .arg("--root")
        .arg(root.path())
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
    cmd()
        .arg("status")
        .arg("inv-1")
        .arg("--root")
        .arg(root.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("no record for document"));
}

#[test]
fn test_run_reports_intake_errors() {
    let root = tempfile::tempdir().unwrap();
    let events = [
        upload(root.path(), "incoming/scan.jpg", b"no page number"),
        upload(root.path(), "incoming/inv-1_1.docx", b"wrong type"),
        upload(root.path(), "elsewhere/inv-2_1.jpg", b"ignored"),
    ];
    let events_path = root.path().join("events.jsonl");
    fs::write(&events_path, events.join("\n")).unwrap();

    offline_run(root.path(), &events_path)
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("2 of 3 events could not be accepted"))
        .stderr(predicate::str::contains("InvalidFilename"))
        .stderr(predicate::str::contains("InvalidFileType"));
}

#[test]
fn test_run_records_failure_and_status_shows_it() {
    let root = tempfile::tempdir().unwrap();
    let events = [
        upload(root.path(), "incoming/inv-1_1.jpg", b"this is not an image"),
        upload(root.path(), "incoming/inv-1_2.jpg", b"neither is this"),
    ];
    let events_path = root.path().join("events.jsonl");
    fs::write(&events_path, events.join("\n")).unwrap();

    offline_run(root.path(), &events_path)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""document_id":"inv-1""#))
        .stdout(predicate::str::contains(r#""status":"FAILED""#))
        .stdout(predicate::str::contains("InvalidFileType"));

    cmd()
        .arg("status")
        .arg("inv-1")
        .arg("--root")
        .arg(root.path())
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""timeline""#))
        .stdout(predicate::str::contains(r#""pages_received":2"#));
}
