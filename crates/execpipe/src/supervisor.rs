// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Launching and reaping of the per-process supervisor
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio_util::task::TaskTracker;

use crate::RunMode;

#[cfg(test)]
#[path = "./supervisor_test.rs"]
mod supervisor_test;

/// The location that a supervisor's own output is captured to
pub fn log_file_path(bundle_path: &Path, process_id: &str) -> PathBuf {
    bundle_path.join(format!("supervisor.{process_id}.log"))
}

/// The command line of a single supervisor invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupervisorCommand {
    pub supervisor_path: PathBuf,
    pub runtime_path: PathBuf,
    pub runtime_root: Option<PathBuf>,
    pub socket_dir: Option<PathBuf>,
    pub tty: bool,
    pub mode: RunMode,
    pub process_dir: PathBuf,
    /// The container handle for exec, or the process id for run
    pub target: String,
}

impl SupervisorCommand {
    pub fn args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(root) = &self.runtime_root {
            args.push("--runtime-root".into());
            args.push(root.into());
        }
        if let Some(dir) = &self.socket_dir {
            args.push("--socket-dir".into());
            args.push(dir.into());
        }
        if self.tty {
            args.push("--tty".into());
        }
        args.push(self.mode.to_string().into());
        args.push(self.runtime_path.clone().into());
        args.push(self.process_dir.clone().into());
        args.push(self.target.clone().into());
        args
    }

    /// Build the process to spawn, without any stdio configured
    pub fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.supervisor_path);
        cmd.args(self.args());
        cmd
    }
}

/// Write the process payload into the supervisor's stdin, closing it afterwards
pub fn feed_stdin(stdin: tokio::process::ChildStdin, payload: Vec<u8>) {
    tokio::task::spawn(async move {
        let mut stdin = stdin;
        if let Err(err) = stdin.write_all(&payload).await {
            tracing::debug!(?err, "failed to write process spec to supervisor");
        }
    });
}

/// Wait for the supervisor in the background so that it never
/// becomes a zombie, then relay and remove its captured output.
pub fn spawn_reaper(
    tasks: &TaskTracker,
    mut child: tokio::process::Child,
    log_path: PathBuf,
) -> tokio::task::JoinHandle<()> {
    tasks.spawn(async move {
        match child.wait().await {
            Ok(status) => tracing::debug!(%status, "supervisor exited"),
            Err(err) => tracing::debug!(?err, "failed waiting on supervisor"),
        }
        relay_log_file(&log_path).await;
    })
}

async fn relay_log_file(log_path: &Path) {
    match tokio::fs::read(log_path).await {
        Ok(content) => {
            for line in String::from_utf8_lossy(&content).lines() {
                if !line.trim().is_empty() {
                    tracing::debug!(target: "execpipe::supervisor", message = %line);
                }
            }
        }
        Err(err) => {
            tracing::error!(?err, path = ?log_path, "failed to read supervisor log file");
        }
    }
    if let Err(err) = tokio::fs::remove_file(log_path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::error!(?err, path = ?log_path, "failed to remove supervisor log file");
        }
    }
}
