// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Resolution of the host pid for a running process
use std::path::Path;
use std::time::Duration;

use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;

use crate::{Error, Result};

#[cfg(test)]
#[path = "./pid_test.rs"]
mod pid_test;

/// Reasons that a pidfile could not be turned into a pid
#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    #[error("pidfile does not exist")]
    Missing,
    #[error("pidfile is empty")]
    Empty,
    #[error("parsing pid file contents {0:?}")]
    Invalid(String),
    #[error(transparent)]
    IO(#[from] std::io::Error),
}

impl PidFileError {
    /// True if the pidfile may still be written by the runtime
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Missing | Self::Empty)
    }
}

/// Read and parse a pidfile once, without waiting for it.
pub fn read_pid_file(path: &Path) -> std::result::Result<i32, PidFileError> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_pid(&content),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(PidFileError::Missing),
        Err(err) => Err(err.into()),
    }
}

fn parse_pid(content: &str) -> std::result::Result<i32, PidFileError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(PidFileError::Empty);
    }
    match content.parse() {
        // zero and negative values address process groups
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(PidFileError::Invalid(content.to_string())),
    }
}

/// Finds the host pid of a process from its pidfile
#[async_trait::async_trait]
pub trait PidGetter: Send + Sync {
    async fn pid(&self, pid_file: &Path) -> Result<i32>;
}

/// Reads a pidfile, waiting for the runtime to write it.
///
/// Missing or empty pidfiles are retried at a fixed interval
/// until the timeout has elapsed, any other problem fails immediately.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PidFileReader {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for PidFileReader {
    fn default() -> Self {
        crate::config::PidFile::default().reader()
    }
}

impl PidFileReader {
    fn attempts(&self) -> usize {
        let interval = self.interval.as_millis().max(1);
        (self.timeout.as_millis() / interval).max(1) as usize
    }
}

#[async_trait::async_trait]
impl PidGetter for PidFileReader {
    async fn pid(&self, pid_file: &Path) -> Result<i32> {
        let strategy = FixedInterval::new(self.interval).take(self.attempts());
        let res = RetryIf::spawn(
            strategy,
            || async {
                match tokio::fs::read_to_string(pid_file).await {
                    Ok(content) => parse_pid(&content),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        Err(PidFileError::Missing)
                    }
                    Err(err) => Err(err.into()),
                }
            },
            |err: &PidFileError| err.is_pending(),
        )
        .await;

        res.map_err(|err| {
            let reason = if err.is_pending() {
                format!("timeout after {:?}: {err}", self.timeout)
            } else {
                err.to_string()
            };
            Error::PidResolutionFailed {
                path: pid_file.to_owned(),
                reason,
            }
        })
    }
}
