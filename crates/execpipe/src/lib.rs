// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Process execution inside running containers.
//!
//! Each process is launched by a short-lived supervisor, and its
//! input and output travel through named pipes in a per-process
//! directory, so that callers can come and go while it runs.

#![deny(unsafe_op_in_unsafe_fn)]

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod fixtures;

pub mod channel;
pub mod config;
mod depot;
mod error;
pub mod fan_out;
pub mod fifo;
pub mod pid;
mod process;
mod registry;
mod runner;
pub mod runtime_log;
pub mod signal;
pub mod supervisor;

pub use depot::ProcessDirs;
pub use error::{Error, Result};
pub use fan_out::FanOutWriter;
pub use pid::{read_pid_file, PidFileError, PidFileReader, PidGetter};
pub use process::{
    read_exit_code,
    CleanupFn,
    Process,
    ProcessEntry,
    ProcessIo,
    TtySpec,
    WindowSize,
};
pub use registry::ProcessRegistry;
pub use runner::{ExecRunner, RunMode, RunRequest, BUNDLE_CONFIG};
pub use signal::{Signal, Signaller, SignallerFactory};

pub use self::config::{load_config, Config};
