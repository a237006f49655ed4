//! CLI Argument Parsing Tests
//!
//! These tests verify that command-line arguments are parsed and validated before anything is
//! transferred: help and version output, accepted value formats and the exit status of invalid
//! invocations. None of them reach an object store.

use assert_cmd::Command;
use predicates::prelude::*;

fn rxfer() -> Command {
    let mut cmd = Command::cargo_bin("rxfer").unwrap();
    cmd.env_remove("RXFER_SECRET_ID")
        .env_remove("RXFER_SECRET_KEY")
        .env_remove("RXFER_SESSION_TOKEN");
    cmd
}

/// Test that --help output is generated without errors
#[test]
fn test_help_runs() {
    rxfer().arg("--help").assert().success();
}

/// Test --version flag works
#[test]
fn test_version_runs() {
    rxfer()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("rxfer"));
}

#[test]
fn test_subcommand_help_lists_flag_groups() {
    rxfer()
        .args(["sync", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--snapshot-path"))
        .stdout(predicate::str::contains("Performance & throttling"));
}

/// `copy` is an alias of `cp`
#[test]
fn test_copy_alias() {
    rxfer().args(["copy", "--help"]).assert().success();
}

#[test]
fn test_progress_type_values() {
    for value in ["auto", "Auto", "ProgressBar", "progress-bar", "TextUpdates", "text-updates"] {
        rxfer()
            .args(["cp", "--progress-type", value, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_invalid_progress_type_rejected() {
    rxfer()
        .args(["cp", "--progress-type", "fancy", "a", "s3://bkt/a"])
        .assert()
        .code(1);
}

#[test]
fn test_missing_subcommand_fails() {
    rxfer().assert().code(1);
}

#[test]
fn test_missing_destination_fails() {
    rxfer().args(["cp", "/tmp/a"]).assert().code(1);
}

#[test]
fn test_acl_grant_flags() {
    rxfer()
        .args(["sync", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--grant-read"))
        .stdout(predicate::str::contains("--grant-read-acp"))
        .stdout(predicate::str::contains("--grant-write-acp"))
        .stdout(predicate::str::contains("--grant-full-control"));
    rxfer()
        .args([
            "cp",
            "--grant-read",
            r#"id="100000000001",id="100000000002""#,
            "--grant-full-control",
            r#"id="100000000003""#,
            "--help",
        ])
        .assert()
        .success();
    rxfer()
        .args(["cp", "--grant-write", "id=\"1\"", "a", "s3://bkt/a"])
        .assert()
        .code(1);
}

#[test]
fn test_part_size_accepts_units() {
    for value in ["32MiB", "8MB", "1048576"] {
        rxfer()
            .args(["cp", "--part-size", value, "--help"])
            .assert()
            .success();
    }
}

// ============================================================================
// Validation
// ============================================================================
//
// Every rejected invocation exits with status 1 and a message on stderr.

#[test]
fn test_local_to_local_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    rxfer()
        .current_dir(tmp.path())
        .args(["cp", "a", "b"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("two local paths"));
}

#[test]
fn test_filters_require_recursive() {
    let tmp = tempfile::tempdir().unwrap();
    rxfer()
        .current_dir(tmp.path())
        .args(["cp", "s3://bkt/logs/", "out", "--include", "*.log"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--recursive"));
}

#[test]
fn test_retry_out_of_range() {
    let tmp = tempfile::tempdir().unwrap();
    rxfer()
        .current_dir(tmp.path())
        .args(["cp", "s3://bkt/a", "a", "--err-retry-num", "101"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--err-retry-num"));
    rxfer()
        .current_dir(tmp.path())
        .args(["cp", "s3://bkt/a", "a", "--err-retry-interval", "11"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--err-retry-interval"));
}

#[test]
fn test_part_size_out_of_range() {
    let tmp = tempfile::tempdir().unwrap();
    rxfer()
        .current_dir(tmp.path())
        .args(["cp", "s3://bkt/a", "a", "--part-size", "512KiB"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--part-size"));
}

#[test]
fn test_rate_limit_out_of_range() {
    let tmp = tempfile::tempdir().unwrap();
    rxfer()
        .current_dir(tmp.path())
        .args(["cp", "s3://bkt/a", "a", "--rate-limiting", "2000"])
        .assert()
        .code(1);
}

#[test]
fn test_sync_only_flags_rejected_for_cp() {
    let tmp = tempfile::tempdir().unwrap();
    rxfer()
        .current_dir(tmp.path())
        .args(["cp", "-r", "s3://bkt/a/", "out", "--delete"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("only supported by sync"));
}

#[test]
fn test_delete_requires_recursive() {
    let tmp = tempfile::tempdir().unwrap();
    rxfer()
        .current_dir(tmp.path())
        .args(["sync", "s3://bkt/a", "out", "--delete", "--force"])
        .assert()
        .code(1);
}

#[test]
fn test_move_between_buckets_only() {
    let tmp = tempfile::tempdir().unwrap();
    rxfer()
        .current_dir(tmp.path())
        .args(["cp", "s3://bkt/a", "a", "--move"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--move"));
}

#[test]
fn test_output_path_inside_local_source_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir(tmp.path().join("src")).unwrap();
    rxfer()
        .current_dir(tmp.path())
        .args([
            "cp",
            "-r",
            "src",
            "s3://bkt/dst/",
            "--fail-output-path",
            "src/reports",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--fail-output-path"));
}

#[test]
fn test_delete_prompt_declined() {
    let tmp = tempfile::tempdir().unwrap();
    rxfer()
        .current_dir(tmp.path())
        .args(["sync", "-r", "s3://bkt/a/", "out", "--delete"])
        .write_stdin("n\n")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("continue?"));
    assert!(!tmp.path().join("out").exists());
}

/// Credentials are resolved after validation and their absence aborts the run
#[test]
fn test_missing_credentials_abort() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("a.txt"), "a").unwrap();
    rxfer()
        .current_dir(tmp.path())
        .env("HOME", tmp.path())
        .args(["cp", "a.txt", "s3://bkt/a.txt", "--process-log", "false"])
        .assert()
        .code(1);
}
