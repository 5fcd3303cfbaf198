//! End-to-end smoke tests of the UCI shell.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn uci_handshake() {
    let mut cmd = Command::cargo_bin("engine-uci").unwrap();
    cmd.write_stdin("uci\nisready\nquit\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("id name rchess"))
        .stdout(predicate::str::contains("uciok"))
        .stdout(predicate::str::contains("readyok"));
}

#[test]
fn cluster_diagnostic_line() {
    let mut cmd = Command::cargo_bin("engine-uci").unwrap();
    cmd.write_stdin("cluster 12\nquit\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("info depth 12 cluster signals"));
}

#[test]
fn exits_cleanly_on_eof() {
    let mut cmd = Command::cargo_bin("engine-uci").unwrap();
    cmd.write_stdin("isready\n").assert().success();
}
