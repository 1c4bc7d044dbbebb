// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::io;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Diagnostic, Debug, Error)]
#[diagnostic(
    url(
        "https://spkenv.dev/error_codes#{}",
        self.code().unwrap_or_else(|| Box::new("execpipe::generic"))
    )
)]
pub enum Error {
    #[error("process ID '{0}' already in use")]
    #[diagnostic(
        code("execpipe::already_in_use"),
        help("Process ids must be unique within a container, try another id")
    )]
    AlreadyInUse(String),
    #[error("process {0} not found")]
    #[diagnostic(code("execpipe::process_not_found"))]
    ProcessNotFound(String),
    #[error(
        "runtime {mode}: {reason}{}",
        .last_log.as_deref().map(|msg| format!(": {msg}")).unwrap_or_default()
    )]
    #[diagnostic(
        code("execpipe::invocation_failed"),
        help("The supervisor log and the runtime log may contain more details")
    )]
    InvocationFailed {
        mode: crate::RunMode,
        reason: String,
        last_log: Option<String>,
    },
    #[error("executable not found: {0}")]
    #[diagnostic(code("execpipe::executable_not_found"))]
    ExecutableNotFound(String),
    #[error("could not find the exitcode file for the process: {}", .0.display())]
    #[diagnostic(code("execpipe::exit_record_missing"))]
    ExitRecordMissing(PathBuf),
    #[error("the exitcode file is empty: {}", .0.display())]
    #[diagnostic(code("execpipe::exit_record_empty"))]
    ExitRecordEmpty(PathBuf),
    #[error("failed to parse exit code {content:?}: {source}")]
    #[diagnostic(code("execpipe::exit_record_unparsable"))]
    ExitRecordUnparsable {
        content: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to resolve pid from {}: {reason}", .path.display())]
    #[diagnostic(code("execpipe::pid_resolution_failed"))]
    PidResolutionFailed { path: PathBuf, reason: String },
    #[error("process already finished (pid {0})")]
    #[diagnostic(code("execpipe::process_already_finished"))]
    ProcessAlreadyFinished(i32),
    #[error("failed to signal process {pid}")]
    SignalFailed {
        pid: i32,
        #[source]
        source: nix::errno::Errno,
    },
    #[error("Process directory error: {}", .0.display())]
    ProcessDirError(PathBuf, #[source] io::Error),
    #[error("Named pipe error: {}", .0.display())]
    FifoError(PathBuf, #[source] io::Error),

    #[error(transparent)]
    IO(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::errno::Errno),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("{0}")]
    String(String),
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error::String(err)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::String(err.to_string())
    }
}
