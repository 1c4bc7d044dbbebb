// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! The named pipes and sentinel files of a single process directory
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{chown, mkfifo, Gid, Uid};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./fifo_test.rs"]
mod fifo_test;

pub const STDIN: &str = "stdin";
pub const STDOUT: &str = "stdout";
pub const STDERR: &str = "stderr";
pub const WINSZ: &str = "winsz";
pub const EXIT: &str = "exit";
pub const EXIT_CODE: &str = "exitcode";
pub const PID_FILE: &str = "pidfile";

/// The filesystem locations shared between a caller,
/// the supervisor and the running command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedPipes {
    pub stdin: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub winsz: PathBuf,
    pub exit: PathBuf,
    /// Written by the supervisor once the command has exited
    pub exitcode: PathBuf,
    /// Written by the container runtime once the command has started
    pub pidfile: PathBuf,
}

impl NamedPipes {
    pub fn new<P: AsRef<Path>>(process_dir: P) -> Self {
        let dir = process_dir.as_ref();
        Self {
            stdin: dir.join(STDIN),
            stdout: dir.join(STDOUT),
            stderr: dir.join(STDERR),
            winsz: dir.join(WINSZ),
            exit: dir.join(EXIT),
            exitcode: dir.join(EXIT_CODE),
            pidfile: dir.join(PID_FILE),
        }
    }

    /// The five fifos, in creation order
    pub fn fifos(&self) -> [&Path; 5] {
        [
            &self.stdin,
            &self.stdout,
            &self.stderr,
            &self.winsz,
            &self.exit,
        ]
    }

    /// Create every fifo, readable and writable only by the given owner.
    pub fn create(&self, uid: u32, gid: u32) -> Result<()> {
        for fifo in self.fifos() {
            mkfifo(fifo, Mode::S_IRUSR | Mode::S_IWUSR)
                .map_err(|errno| Error::FifoError(fifo.to_owned(), errno.into()))?;
            chown(fifo, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
                .map_err(|errno| Error::FifoError(fifo.to_owned(), errno.into()))?;
        }
        Ok(())
    }
}

/// Open a fifo for blocking reads without waiting for a writer.
///
/// The open itself is non-blocking so that a missing peer does not
/// hang the caller, after which the descriptor is switched back so that
/// reads wait for data and only return zero bytes once every writer
/// has closed.
pub fn open_reader(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|err| Error::FifoError(path.to_owned(), err))?;
    set_blocking(&file).map_err(|err| Error::FifoError(path.to_owned(), err))?;
    Ok(file)
}

/// Open a fifo for writing while also holding a read end.
///
/// Holding both ends means the open never blocks and the fifo stays
/// usable until this handle is dropped.
pub fn open_read_write(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|err| Error::FifoError(path.to_owned(), err))
}

fn set_blocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags & !OFlag::O_NONBLOCK))?;
    Ok(())
}
