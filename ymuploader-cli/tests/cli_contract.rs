//! Contract tests for the ymuploader CLI argument surface.

use assert_cmd::Command;
use predicates::str::contains;

#[test]
fn help_exits_success_and_documents_flags() {
    Command::cargo_bin("ymuploader")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("--port"))
        .stdout(contains("--file"));
}

#[test]
fn missing_required_args_exits_nonzero() {
    Command::cargo_bin("ymuploader")
        .unwrap()
        .assert()
        .failure();
}

#[test]
fn missing_file_exits_nonzero_with_clear_message() {
    Command::cargo_bin("ymuploader")
        .unwrap()
        .args(["--port", "/dev/ttyUSB0", "--file", "/no/such/firmware.bin"])
        .assert()
        .failure()
        .stdout(contains("failed to open firmware file"));
}

#[test]
fn unknown_flag_is_rejected_by_the_parser() {
    Command::cargo_bin("ymuploader")
        .unwrap()
        .args(["--bogus-flag", "1"])
        .assert()
        .failure();
}

#[test]
fn existing_file_progresses_past_file_open_to_device_stage() {
    let tmp = tempfile::NamedTempFile::new().expect("create tempfile");
    std::fs::write(tmp.path(), b"firmware-bytes").expect("write tempfile");

    Command::cargo_bin("ymuploader")
        .unwrap()
        .args(["--port", "/dev/nonexistent-port-for-tests", "--file"])
        .arg(tmp.path())
        .assert()
        .failure()
        .stdout(contains("enter dfu mode fail"));
}
