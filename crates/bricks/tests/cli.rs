//! End-to-end tests for the `bricks` CLI.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests

use assert_cmd::Command;
use predicates::prelude::*;

fn bricks() -> Command {
    Command::cargo_bin("bricks").expect("Failed to find bricks binary")
}

const WORKER: &str = env!("CARGO_BIN_EXE_bricks-worker");

#[test]
fn test_help_lists_commands() {
    bricks()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("echo").and(predicate::str::contains("ping")));
}

#[test]
fn test_ping() {
    bricks()
        .arg("ping")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("pong in "));
}

#[test]
fn test_echo_over_stdio() {
    bricks()
        .args(["echo", "--transport", "stdio", "--worker", WORKER, "-n", "2"])
        .args(["--text", "hi there"])
        .assert()
        .success()
        .stdout("1: hi there\n2: hi there\n");
}

#[cfg(unix)]
#[test]
fn test_echo_over_pipe_finds_bundled_worker() {
    bricks()
        .args(["echo", "--count", "3"])
        .assert()
        .success()
        .stdout("1: hello\n2: hello\n3: hello\n");
}

#[test]
fn test_echo_with_missing_worker() {
    bricks()
        .args(["echo", "--transport", "stdio", "--worker", "/nonexistent/bricks-worker"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to start"));
}

#[test]
fn test_docker_requires_image() {
    bricks()
        .args(["echo", "--transport", "docker", "--mount", "/tmp"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--image"));
}
