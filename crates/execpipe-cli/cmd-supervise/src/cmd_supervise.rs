// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

#![deny(unsafe_op_in_unsafe_fn)]

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use clap::Parser;
use execpipe::channel::{EXIT_STATUS_FD, LOG_FD, SYNC_FD};
use execpipe::fifo::{open_read_write, NamedPipes};
use execpipe::RunMode;
use execpipe_cli_common as cli;
use execpipe_cli_common::CommandName;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

mod tty;

#[cfg(test)]
#[path = "./cmd_supervise_test.rs"]
mod cmd_supervise_test;

/// Reported when the supervisor could not get as far as starting the runtime
const SETUP_FAILED: i32 = 2;
/// Reported when the runtime started but did not launch the process
const RUNTIME_FAILED: i32 = 3;

cli::main!(CmdSupervise);

/// Launch one process through a container runtime and watch it until it exits.
///
/// The process directory must already contain the named pipes, and the
/// caller must provide the runtime exit status, runtime log and startup
/// pipes as file descriptors 3, 4 and 5.
#[derive(Debug, Parser)]
#[clap(name = "execpipe-supervise")]
pub struct CmdSupervise {
    #[clap(flatten)]
    pub logging: cli::Logging,

    /// State directory for the container runtime
    #[clap(long)]
    runtime_root: Option<PathBuf>,

    /// Base directory in which the console socket is created
    #[clap(long)]
    socket_dir: Option<PathBuf>,

    /// Allocate a terminal for the process
    #[clap(long)]
    tty: bool,

    /// Either 'run' a new container or 'exec' into an existing one
    mode: RunMode,

    /// The container runtime binary
    runtime: PathBuf,

    /// The directory holding the named pipes of this process
    process_dir: PathBuf,

    /// The container handle for exec, or the container id for run
    target: String,
}

impl CommandName for CmdSupervise {
    fn command_name(&self) -> &str {
        "supervise"
    }
}

/// The descriptors handed down by the parent
struct ParentChannels {
    exit_status: File,
    log: File,
    sync: File,
}

impl ParentChannels {
    fn take() -> Result<Self> {
        for fd in [EXIT_STATUS_FD, LOG_FD, SYNC_FD] {
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
                .with_context(|| format!("Missing inherited file descriptor {fd}"))?;
        }
        Ok(Self {
            exit_status: take_fd(EXIT_STATUS_FD),
            log: take_fd(LOG_FD),
            sync: take_fd(SYNC_FD),
        })
    }
}

fn take_fd(fd: RawFd) -> File {
    // SAFETY: the descriptor was checked to be open and nothing
    // else in this process refers to it
    unsafe { File::from_raw_fd(fd) }
}

/// The named pipes held open for the lifetime of the supervisor
struct OpenPipes {
    stdin: File,
    stdout: File,
    stderr: File,
    _exit: File,
    _keep_stdout: Option<File>,
    _keep_stderr: Option<File>,
}

impl OpenPipes {
    fn open(pipes: &NamedPipes) -> Result<Self> {
        let open = |path: &Path, options: &mut OpenOptions| {
            options
                .mode(0o600)
                .open(path)
                .with_context(|| format!("Failed to open {}", path.display()))
        };
        let stdin = open(&pipes.stdin, OpenOptions::new().read(true))?;
        let stdout = open(&pipes.stdout, OpenOptions::new().write(true))?;
        let stderr = open(&pipes.stderr, OpenOptions::new().write(true))?;
        // only ever read as a signal that this process has gone away
        let exit = open_read_write(&pipes.exit)?;
        Ok(Self {
            stdin,
            stdout,
            stderr,
            _exit: exit,
            _keep_stdout: None,
            _keep_stderr: None,
        })
    }

    /// Hold read ends of the output pipes, so that the process is not
    /// killed by SIGPIPE if every caller goes away.
    fn keep_outputs_alive(&mut self, pipes: &NamedPipes) -> Result<()> {
        let open = |path: &Path| {
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))
        };
        self._keep_stdout = Some(open(&pipes.stdout)?);
        self._keep_stderr = Some(open(&pipes.stderr)?);
        Ok(())
    }
}

impl CmdSupervise {
    pub fn run(&mut self, config: &execpipe::Config) -> Result<i32> {
        let mut channels = ParentChannels::take()?;
        let pipes = NamedPipes::new(&self.process_dir);

        let mut open = match OpenPipes::open(&pipes) {
            Ok(open) => open,
            Err(err) => {
                tracing::error!("{err:?}");
                return Ok(SETUP_FAILED);
            }
        };
        channels
            .sync
            .write_all(&[0])
            .context("Failed to signal that the pipes are open")?;
        drop(channels.sync);
        if let Err(err) = open.keep_outputs_alive(&pipes) {
            tracing::error!("{err:?}");
            return Ok(SETUP_FAILED);
        }

        let mut console = None;
        let mut command = Command::new(&self.runtime);
        if self.tty {
            let winsz = open_read_write(&pipes.winsz)?;
            let socket_dir = self
                .socket_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir);
            let socket = match tty::ConsoleSocket::bind(&socket_dir) {
                Ok(socket) => socket,
                Err(err) => {
                    tracing::error!("{err:?}");
                    return Ok(SETUP_FAILED);
                }
            };
            command.args(self.runtime_args(std::process::id(), Some(&socket.path())));
            command
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            console = Some(tty::spawn_console(
                socket,
                tty::ConsoleIo {
                    stdin: open.stdin.try_clone()?,
                    stdout: open.stdout.try_clone()?,
                    winsz,
                },
                pipes.pidfile.clone(),
                config.pidfile.reader(),
            ));
        } else {
            command.args(self.runtime_args(std::process::id(), None));
            command
                .stdin(open.stdin.try_clone()?)
                .stdout(open.stdout.try_clone()?)
                .stderr(open.stderr.try_clone()?);
        }

        // the process is detached from the runtime, and must be
        // reparented here so that its exit status can be collected
        nix::sys::prctl::set_child_subreaper(true)
            .context("Failed to become a child subreaper")?;

        tracing::debug!(runtime = ?self.runtime, mode = %self.mode, "starting runtime");
        let mut runtime = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(?err, "failed to start the container runtime");
                let _ = channels.exit_status.write_all(&[SETUP_FAILED as u8]);
                return Ok(SETUP_FAILED);
            }
        };
        let status = runtime
            .wait()
            .context("Failed to wait for the container runtime")?;
        // no more runtime logs are expected
        drop(channels.log);

        let status = status
            .code()
            .or_else(|| status.signal().map(|sig| 128 + sig))
            .unwrap_or(255);
        tracing::debug!(status, "runtime exited");
        channels
            .exit_status
            .write_all(&[status as u8])
            .context("Failed to report the runtime exit status")?;
        drop(channels.exit_status);
        if status != 0 {
            return Ok(RUNTIME_FAILED);
        }

        let pid = match execpipe::read_pid_file(&pipes.pidfile) {
            Ok(pid) => pid,
            Err(err) => {
                tracing::error!(?err, "failed to read the pidfile");
                return Ok(SETUP_FAILED);
            }
        };
        let code = wait_for_exit(Pid::from_raw(pid))?;
        tracing::debug!(pid, code, "process exited");

        if let Some(console) = console {
            // all terminal output must be collected before reporting the exit
            if console.join().is_err() {
                tracing::error!("terminal streaming thread panicked");
            }
        }
        write_exit_code(&pipes.exitcode, code)?;
        drop(open);
        Ok(code)
    }

    /// The arguments given to the container runtime
    pub fn runtime_args(&self, supervisor_pid: u32, console_socket: Option<&Path>) -> Vec<OsString> {
        let pid_file = NamedPipes::new(&self.process_dir).pidfile;
        let mut args: Vec<OsString> = vec![
            "--debug".into(),
            "--log".into(),
            format!("/proc/{supervisor_pid}/fd/{LOG_FD}").into(),
        ];
        if let Some(root) = &self.runtime_root {
            args.push("--root".into());
            args.push(root.into());
        }
        match self.mode {
            RunMode::Exec => {
                args.push("exec".into());
                args.push("--detach".into());
                args.push("--process".into());
                args.push(format!("/proc/{supervisor_pid}/fd/0").into());
            }
            RunMode::Run => {
                args.push("run".into());
                args.push("--detach".into());
                args.push("--bundle".into());
                args.push(self.process_dir.clone().into());
            }
        }
        args.push("--pid-file".into());
        args.push(pid_file.into());
        if let Some(socket) = console_socket {
            if self.mode == RunMode::Exec {
                args.push("--tty".into());
            }
            args.push("--console-socket".into());
            args.push(socket.into());
        }
        args.push(self.target.clone().into());
        args
    }
}

/// Reap children until the given one exits, returning its exit code
fn wait_for_exit(pid: Pid) -> Result<i32> {
    loop {
        match waitpid(None::<Pid>, None) {
            Ok(WaitStatus::Exited(child, code)) if child == pid => return Ok(code),
            Ok(WaitStatus::Signaled(child, signal, _)) if child == pid => {
                return Ok(128 + signal as i32);
            }
            Ok(status) => tracing::trace!(?status, "reaped"),
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err).context("Failed to wait for the process"),
        }
    }
}

fn write_exit_code(path: &Path, code: i32) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(code.to_string().as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))
}
