// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;
use nix::unistd::Pid;

use crate::pid::PidGetter;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./signal_test.rs"]
mod signal_test;

/// A signal that can be delivered to a running process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Signal {
    Terminate,
    Kill,
}

impl Signal {
    /// The posix signal that this maps to
    pub fn as_nix(&self) -> nix::sys::signal::Signal {
        match self {
            Self::Terminate => nix::sys::signal::SIGTERM,
            Self::Kill => nix::sys::signal::SIGKILL,
        }
    }
}

/// Delivers signals to the process named by a pidfile
#[derive(Clone)]
pub struct Signaller {
    pid_file: PathBuf,
    pid_getter: Arc<dyn PidGetter>,
}

impl std::fmt::Debug for Signaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signaller")
            .field("pid_file", &self.pid_file)
            .finish_non_exhaustive()
    }
}

impl Signaller {
    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    /// Send a signal to the process, resolving its pid first
    pub async fn signal(&self, signal: Signal) -> Result<()> {
        let pid = self.pid_getter.pid(&self.pid_file).await?;
        tracing::debug!(pid, %signal, "signalling process");
        match nix::sys::signal::kill(Pid::from_raw(pid), signal.as_nix()) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(Error::ProcessAlreadyFinished(pid)),
            Err(source) => Err(Error::SignalFailed { pid, source }),
        }
    }
}

/// Creates signallers that share a single pid resolution strategy
#[derive(Clone)]
pub struct SignallerFactory {
    pid_getter: Arc<dyn PidGetter>,
}

impl SignallerFactory {
    pub fn new<G>(pid_getter: G) -> Self
    where
        G: PidGetter + 'static,
    {
        Self {
            pid_getter: Arc::new(pid_getter),
        }
    }

    pub fn signaller<P: Into<PathBuf>>(&self, pid_file: P) -> Signaller {
        Signaller {
            pid_file: pid_file.into(),
            pid_getter: Arc::clone(&self.pid_getter),
        }
    }
}

impl Default for SignallerFactory {
    fn default() -> Self {
        Self::new(crate::pid::PidFileReader::default())
    }
}
