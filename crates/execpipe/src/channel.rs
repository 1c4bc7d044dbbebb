// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! The anonymous pipes shared with a supervisor process.
//!
//! Every supervisor is started with three extra descriptors:
//! the runtime exit status on fd 3, the runtime diagnostic log
//! on fd 4 and a single startup byte on fd 5.
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{close, dup2, pipe2};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::unix::pipe;

use crate::runtime_log;
use crate::Result;

#[cfg(test)]
#[path = "./channel_test.rs"]
mod channel_test;

pub const EXIT_STATUS_FD: RawFd = 3;
pub const LOG_FD: RawFd = 4;
pub const SYNC_FD: RawFd = 5;

/// Descriptors at or above this value are free for shuffling in a forked child
const FIRST_SPARE_FD: RawFd = 10;

struct Pipe {
    reader: OwnedFd,
    writer: OwnedFd,
}

impl Pipe {
    fn new() -> Result<Self> {
        let (reader, writer) = pipe2(OFlag::O_CLOEXEC)?;
        Ok(Self { reader, writer })
    }
}

/// The three pipes created for a single supervisor
pub struct SupervisorChannels {
    exit_status: Pipe,
    log: Pipe,
    sync: Pipe,
}

impl SupervisorChannels {
    pub fn new() -> Result<Self> {
        Ok(Self {
            exit_status: Pipe::new()?,
            log: Pipe::new()?,
            sync: Pipe::new()?,
        })
    }

    /// Arrange for the write end of each pipe to appear
    /// at its well-known descriptor in the spawned child.
    pub fn install(&self, cmd: &mut tokio::process::Command) {
        let mapping = [
            (self.exit_status.writer.as_raw_fd(), EXIT_STATUS_FD),
            (self.log.writer.as_raw_fd(), LOG_FD),
            (self.sync.writer.as_raw_fd(), SYNC_FD),
        ];
        // Safety: the closure only calls async-signal-safe functions
        // and does not allocate
        unsafe {
            cmd.pre_exec(move || install_descriptors(&mapping));
        }
    }

    /// Close the write ends held by this process, returning the read
    /// ends. This must be called once the child has been spawned so
    /// that each channel reports EOF when the supervisor exits.
    pub fn into_parent_ends(self) -> Result<(HandshakeChannel, ExitStatusChannel, LogChannel)> {
        let Self {
            exit_status,
            log,
            sync,
        } = self;
        drop((exit_status.writer, log.writer, sync.writer));
        Ok((
            HandshakeChannel {
                reader: pipe::Receiver::from_owned_fd(sync.reader)?,
            },
            ExitStatusChannel {
                reader: pipe::Receiver::from_owned_fd(exit_status.reader)?,
            },
            LogChannel {
                reader: pipe::Receiver::from_owned_fd(log.reader)?,
            },
        ))
    }
}

fn install_descriptors(mapping: &[(RawFd, RawFd); 3]) -> std::io::Result<()> {
    // move every source out of the way first, in case one of them
    // already occupies one of the target descriptors
    let mut spare = [0; 3];
    for (index, (source, _)) in mapping.iter().enumerate() {
        spare[index] = fcntl(*source, FcntlArg::F_DUPFD(FIRST_SPARE_FD))?;
    }
    for (index, (_, target)) in mapping.iter().enumerate() {
        dup2(spare[index], *target)?;
    }
    for fd in spare {
        close(fd)?;
    }
    Ok(())
}

/// Receives the single byte that a supervisor writes once
/// it has opened all of the named pipes.
pub struct HandshakeChannel {
    reader: pipe::Receiver,
}

impl HandshakeChannel {
    /// Wait for the startup byte, failing if the supervisor
    /// exits without sending it.
    pub async fn wait(mut self) -> std::io::Result<()> {
        let mut buf = [0; 1];
        self.reader.read_exact(&mut buf).await?;
        Ok(())
    }
}

/// Receives the exit status of the container runtime invocation
pub struct ExitStatusChannel {
    reader: pipe::Receiver,
}

impl ExitStatusChannel {
    /// Read the status byte, or None if the supervisor
    /// exited without reporting one.
    pub async fn read_status(mut self) -> std::io::Result<Option<u8>> {
        let mut buf = [0; 1];
        match self.reader.read(&mut buf).await? {
            0 => Ok(None),
            _ => Ok(Some(buf[0])),
        }
    }
}

/// Receives the diagnostic log of the container runtime
pub struct LogChannel {
    reader: pipe::Receiver,
}

impl LogChannel {
    /// Forward every log line until the channel is closed, resolving
    /// to the message of the last error entry that was seen.
    pub fn relay(self) -> tokio::task::JoinHandle<Option<String>> {
        tokio::task::spawn(async move {
            let mut lines = BufReader::new(self.reader).split(b'\n');
            let mut last_error = None;
            loop {
                let line = match lines.next_segment().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::debug!(?err, "failed to read runtime log");
                        break;
                    }
                };
                let line = String::from_utf8_lossy(&line);
                if let Some(parsed) = runtime_log::forward_line(&line) {
                    if parsed.is_error() {
                        last_error = Some(parsed.msg);
                    }
                }
            }
            last_error
        })
    }
}
