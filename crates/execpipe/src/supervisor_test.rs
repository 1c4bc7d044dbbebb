// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use rstest::rstest;

use super::{log_file_path, spawn_reaper, SupervisorCommand};
use crate::fixtures::*;
use crate::RunMode;

fn command(mode: RunMode, tty: bool, runtime_root: Option<&str>) -> SupervisorCommand {
    SupervisorCommand {
        supervisor_path: PathBuf::from("/bin/execpipe-supervise"),
        runtime_path: PathBuf::from("/bin/runc"),
        runtime_root: runtime_root.map(PathBuf::from),
        socket_dir: None,
        tty,
        mode,
        process_dir: PathBuf::from("/bundle/processes/proc-1"),
        target: "handle".to_string(),
    }
}

fn args(values: &[&str]) -> Vec<OsString> {
    values.iter().map(OsString::from).collect()
}

#[rstest]
#[case::exec(
    command(RunMode::Exec, false, None),
    args(&["exec", "/bin/runc", "/bundle/processes/proc-1", "handle"])
)]
#[case::run_with_tty(
    command(RunMode::Run, true, None),
    args(&["--tty", "run", "/bin/runc", "/bundle/processes/proc-1", "handle"])
)]
#[case::runtime_root(
    command(RunMode::Exec, false, Some("/run/runc")),
    args(&["--runtime-root", "/run/runc", "exec", "/bin/runc", "/bundle/processes/proc-1", "handle"])
)]
fn test_supervisor_args(#[case] cmd: SupervisorCommand, #[case] expected: Vec<OsString>) {
    assert_eq!(cmd.args(), expected);
}

#[rstest]
fn test_supervisor_socket_dir_arg() {
    let mut cmd = command(RunMode::Exec, true, None);
    cmd.socket_dir = Some(PathBuf::from("/tmp/sockets"));
    assert_eq!(
        cmd.args(),
        args(&[
            "--socket-dir",
            "/tmp/sockets",
            "--tty",
            "exec",
            "/bin/runc",
            "/bundle/processes/proc-1",
            "handle"
        ])
    );
}

#[rstest]
fn test_log_file_path() {
    assert_eq!(
        log_file_path(Path::new("/bundle"), "abc"),
        PathBuf::from("/bundle/supervisor.abc.log")
    );
}

#[rstest]
#[tokio::test]
async fn test_reaper_removes_log_file(tmpdir: tempfile::TempDir) {
    init_logging();
    let log_path = log_file_path(tmpdir.path(), "abc");
    let log_file = std::fs::File::create(&log_path).unwrap();
    let child = tokio::process::Command::new("bash")
        .arg("-c")
        .arg("echo 'supervisor output'; echo 'more output' >&2")
        .stdout(log_file.try_clone().unwrap())
        .stderr(log_file)
        .spawn()
        .unwrap();

    let tasks = tokio_util::task::TaskTracker::new();
    spawn_reaper(&tasks, child, log_path.clone()).await.unwrap();

    assert!(!log_path.exists(), "log file should be removed once relayed");
}
