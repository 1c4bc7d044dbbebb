// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Terminal handling for processes started with a tty.
//!
//! The container runtime allocates the terminal and sends its master
//! side over a unix socket. Output from the master is copied to the
//! stdout pipe, stdin is copied into it and window size events are
//! applied to it as they arrive.

use std::fs::File;
use std::io::{BufRead, BufReader, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use anyhow::{bail, Context, Result};
use execpipe::{PidFileReader, WindowSize};
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use nix::sys::termios::{tcgetattr, tcsetattr, OutputFlags, SetArg};

#[cfg(test)]
#[path = "./tty_test.rs"]
mod tty_test;

/// The longest base directory accepted for console sockets, leaving
/// room for the generated names within the unix socket path limit
pub const MAX_SOCKET_DIR_LEN: usize = 80;

const SOCKET_NAME: &str = "tty.sock";

/// A listening socket that the runtime connects to with the terminal
pub struct ConsoleSocket {
    dir: tempfile::TempDir,
    listener: UnixListener,
}

impl ConsoleSocket {
    /// Listen in a new private directory under the given base
    pub fn bind(base: &Path) -> Result<Self> {
        if base.as_os_str().len() > MAX_SOCKET_DIR_LEN {
            bail!(
                "value for --socket-dir cannot exceed {MAX_SOCKET_DIR_LEN} characters in length"
            );
        }
        let dir = tempfile::Builder::new()
            .prefix("console-")
            .tempdir_in(base)
            .with_context(|| format!("Failed to create socket dir in {}", base.display()))?;
        let listener = UnixListener::bind(dir.path().join(SOCKET_NAME))
            .context("Failed to listen on console socket")?;
        Ok(Self { dir, listener })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().join(SOCKET_NAME)
    }

    /// Wait for the runtime to connect and send the terminal master.
    ///
    /// The socket and its directory are removed once it arrives.
    pub fn receive_master(self) -> Result<OwnedFd> {
        let (stream, _) = self
            .listener
            .accept()
            .context("Failed to accept console connection")?;
        drop(self.listener);
        let master = receive_fd(&stream)?;
        if let Err(err) = self.dir.close() {
            tracing::warn!(?err, "failed to remove console socket dir");
        }
        Ok(master)
    }
}

/// Receive a single file descriptor passed over the stream
pub fn receive_fd(stream: &UnixStream) -> Result<OwnedFd> {
    // the runtime sends the terminal name alongside the descriptor
    let mut buf = [0u8; 4096];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg),
        MsgFlags::empty(),
    )
    .context("Failed to receive terminal descriptor")?;
    for message in msg.cmsgs().context("Invalid control message")? {
        if let ControlMessageOwned::ScmRights(fds) = message {
            if let Some(&fd) = fds.first() {
                // SAFETY: the descriptor was just created in this process
                // by the kernel and is not owned by anything else
                return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    bail!("No terminal descriptor was sent on the console socket")
}

/// Translate newlines into carriage return and newline on output
pub fn set_onlcr(terminal: &OwnedFd) -> Result<()> {
    let mut termios = tcgetattr(terminal).context("ioctl(tty, tcgets)")?;
    termios.output_flags |= OutputFlags::ONLCR;
    tcsetattr(terminal, SetArg::TCSANOW, &termios).context("ioctl(tty, tcsets)")?;
    Ok(())
}

pub fn set_window_size<F: AsRawFd>(terminal: &F, size: WindowSize) -> std::io::Result<()> {
    let winsize = libc::winsize {
        ws_row: size.rows,
        ws_col: size.columns,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCSWINSZ only reads the winsize struct, which
    // outlives the call
    let rc = unsafe { libc::ioctl(terminal.as_raw_fd(), libc::TIOCSWINSZ, &winsize) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// The process pipes that a terminal is connected to
pub struct ConsoleIo {
    pub stdin: File,
    pub stdout: File,
    pub winsz: File,
}

/// Apply each newline-delimited json window size read from `events`
pub fn apply_window_sizes<R: std::io::Read, F: AsRawFd>(events: R, terminal: &F) {
    for line in BufReader::new(events).lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                tracing::debug!(?err, "window size events stopped");
                return;
            }
        };
        match serde_json::from_str::<WindowSize>(&line) {
            Ok(size) => {
                if let Err(err) = set_window_size(terminal, size) {
                    tracing::warn!(?err, ?size, "failed to resize terminal");
                }
            }
            Err(err) => tracing::warn!(%err, "invalid winsz event"),
        }
    }
}

/// Connect the terminal to the process pipes, returning once all
/// output has been copied.
pub fn stream(master: OwnedFd, io: ConsoleIo) -> Result<()> {
    let ConsoleIo {
        mut stdin,
        mut stdout,
        winsz,
    } = io;
    let mut output = File::from(master);
    let mut input = output.try_clone()?;
    let resize = output.try_clone()?;

    std::thread::spawn(move || {
        if let Err(err) = std::io::copy(&mut stdin, &mut input) {
            tracing::debug!(?err, "terminal input stopped");
        }
    });
    std::thread::spawn(move || apply_window_sizes(winsz, &resize));

    // reading the master fails with EIO once the process side closes
    if let Err(err) = std::io::copy(&mut output, &mut stdout) {
        tracing::debug!(?err, "terminal output stopped");
    }
    Ok(())
}

/// Serve the console socket in the background.
///
/// The returned handle completes when all terminal output has been
/// copied. If the terminal cannot be set up after the runtime has
/// connected, the process is killed.
pub fn spawn_console(
    socket: ConsoleSocket,
    io: ConsoleIo,
    pid_file: PathBuf,
    pid_reader: PidFileReader,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let result = socket.receive_master().and_then(|master| {
            set_onlcr(&master)?;
            stream(master, io)
        });
        if let Err(err) = result {
            tracing::error!("{err:?}");
            kill_process(&pid_file, &pid_reader);
        }
    })
}

fn kill_process(pid_file: &Path, reader: &PidFileReader) {
    let attempts = (reader.timeout.as_millis() / reader.interval.as_millis().max(1)).max(1);
    for _ in 0..attempts {
        match execpipe::read_pid_file(pid_file) {
            Ok(pid) => {
                let pid = nix::unistd::Pid::from_raw(pid);
                if let Err(err) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL) {
                    tracing::warn!(?err, %pid, "failed to kill process");
                }
                return;
            }
            Err(err) if err.is_pending() => std::thread::sleep(reader.interval),
            Err(err) => {
                tracing::warn!(?err, "cannot kill process");
                return;
            }
        }
    }
}
