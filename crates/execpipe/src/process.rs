// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;

use crate::fan_out::{Destination, FanOutWriter};
use crate::fifo::{self, NamedPipes};
use crate::registry::ProcessRegistry;
use crate::signal::{Signal, Signaller};
use crate::{Error, Result};

#[cfg(test)]
#[path = "./process_test.rs"]
mod process_test;

/// Additional work to perform once a process has been waited on
pub type CleanupFn = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// A source of input for a process
pub type Input = Box<dyn AsyncRead + Send + Unpin>;

/// The streams that a caller connects to a process
#[derive(Default)]
pub struct ProcessIo {
    pub stdin: Option<Input>,
    pub stdout: Option<Destination>,
    pub stderr: Option<Destination>,
}

impl std::fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

impl ProcessIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stdin<R>(mut self, stdin: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.stdin = Some(Box::new(stdin));
        self
    }

    pub fn with_stdout<W>(mut self, stdout: W) -> Self
    where
        W: tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        self.stdout = Some(Box::new(stdout));
        self
    }

    pub fn with_stderr<W>(mut self, stderr: W) -> Self
    where
        W: tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        self.stderr = Some(Box::new(stderr));
        self
    }
}

/// The size of a terminal, in characters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub columns: u16,
    pub rows: u16,
}

/// Terminal settings for a process that was started with a tty
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtySpec {
    pub window_size: Option<WindowSize>,
}

/// What to do once the exit code of a process has been collected
pub(crate) struct Cleanup {
    pub registry: Option<Arc<ProcessRegistry>>,
    pub remove_dir: bool,
    pub extra: Option<CleanupFn>,
}

impl Cleanup {
    fn run(self, entry: &ProcessEntry) -> Result<()> {
        if let Some(registry) = &self.registry {
            registry.deregister(entry);
        }
        let res = match &self.extra {
            Some(extra) => extra(),
            None => Ok(()),
        };
        if self.remove_dir {
            if let Err(err) = std::fs::remove_dir_all(&entry.dir) {
                tracing::error!(?err, path = ?entry.dir, "failed to clean up process dir");
            }
        }
        res
    }
}

/// One output stream of a process, shared by all of its attachers
struct OutputStream {
    path: PathBuf,
    writer: Arc<FanOutWriter>,
    /// A reader that was opened before the supervisor started,
    /// used by the first attacher in place of opening a new one
    source: Mutex<Option<std::fs::File>>,
}

impl OutputStream {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            writer: Arc::new(FanOutWriter::new()),
            source: Mutex::new(None),
        }
    }

    async fn attach(&self, destination: Destination, tasks: &TaskTracker) -> Result<()> {
        if self.writer.attach(destination).await != 1 {
            return Ok(());
        }
        let source = match self.source.lock().await.take() {
            Some(source) => source,
            None => fifo::open_reader(&self.path)?,
        };
        let writer = Arc::clone(&self.writer);
        let path = self.path.clone();
        tasks.spawn(async move {
            let source = tokio::fs::File::from_std(source);
            if let Err(err) = writer.pump(source).await {
                tracing::debug!(?err, ?path, "failed copying process output");
            }
        });
        Ok(())
    }
}

/// The shared state of a single process
pub struct ProcessEntry {
    id: String,
    dir: PathBuf,
    pipes: NamedPipes,
    stdout: OutputStream,
    stderr: OutputStream,
    stream_lock: Mutex<()>,
    tasks: TaskTracker,
    cleanup: Mutex<Option<Cleanup>>,
    signaller: Signaller,
}

impl std::fmt::Debug for ProcessEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessEntry")
            .field("id", &self.id)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl ProcessEntry {
    pub(crate) fn new(id: String, dir: PathBuf, signaller: Signaller, cleanup: Cleanup) -> Self {
        let pipes = NamedPipes::new(&dir);
        Self {
            stdout: OutputStream::new(pipes.stdout.clone()),
            stderr: OutputStream::new(pipes.stderr.clone()),
            id,
            dir,
            pipes,
            stream_lock: Mutex::new(()),
            tasks: TaskTracker::new(),
            cleanup: Mutex::new(Some(cleanup)),
            signaller,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn pipes(&self) -> &NamedPipes {
        &self.pipes
    }

    /// Background work that must finish before the exit code is read
    pub(crate) fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Open the output fifos ahead of time, so that a supervisor
    /// opening their write ends is not left waiting for a reader.
    pub(crate) async fn open_outputs(&self) -> Result<()> {
        let stdout = fifo::open_reader(&self.pipes.stdout)?;
        let stderr = fifo::open_reader(&self.pipes.stderr)?;
        *self.stdout.source.lock().await = Some(stdout);
        *self.stderr.source.lock().await = Some(stderr);
        Ok(())
    }

    /// Connect the given streams to this process.
    ///
    /// Input is only accepted alongside the write end of the stdin
    /// fifo, which is held exclusively by the caller that started it.
    pub(crate) async fn stream(&self, io: ProcessIo, stdin: Option<std::fs::File>) -> Result<()> {
        let _guard = self.stream_lock.lock().await;

        match (io.stdin, stdin) {
            (Some(input), Some(fifo)) => {
                let path = self.pipes.stdin.clone();
                tokio::task::spawn(copy_stdin(input, fifo, path));
            }
            (Some(_), None) => {
                tracing::debug!(id = %self.id, "ignoring stdin for an attached process");
            }
            // no input, the fifo is closed so that the process sees EOF
            (None, _) => {}
        }

        if let Some(stdout) = io.stdout {
            self.stdout.attach(stdout, &self.tasks).await?;
        }
        if let Some(stderr) = io.stderr {
            self.stderr.attach(stderr, &self.tasks).await?;
        }
        Ok(())
    }

    async fn wait(&self) -> Result<i32> {
        let res = self.collect_exit_code().await;
        if let Err(err) = self.cleanup().await {
            tracing::error!(?err, id = %self.id, "process cleanup failed");
        }
        res
    }

    async fn collect_exit_code(&self) -> Result<i32> {
        let exit = fifo::open_reader(&self.pipes.exit)?;
        let mut exit = tokio::fs::File::from_std(exit);
        let mut buf = Vec::new();
        // the supervisor never writes, this returns once it has exited
        if let Err(err) = exit.read_to_end(&mut buf).await {
            tracing::debug!(?err, "failed reading from exit fifo");
        }
        drop(exit);

        self.tasks.close();
        self.tasks.wait().await;

        read_exit_code(&self.pipes.exitcode).await
    }

    async fn cleanup(&self) -> Result<()> {
        let Some(cleanup) = self.cleanup.lock().await.take() else {
            return Ok(());
        };
        cleanup.run(self)
    }

    async fn set_tty(&self, spec: TtySpec) -> Result<()> {
        let Some(window_size) = spec.window_size else {
            return Ok(());
        };
        let mut event = serde_json::to_vec(&window_size)?;
        event.push(b'\n');
        let mut winsz = tokio::net::unix::pipe::OpenOptions::new()
            .open_sender(&self.pipes.winsz)
            .map_err(|err| Error::FifoError(self.pipes.winsz.clone(), err))?;
        winsz
            .write_all(&event)
            .await
            .map_err(|err| Error::FifoError(self.pipes.winsz.clone(), err))
    }
}

async fn copy_stdin(mut input: Input, fifo: std::fs::File, path: PathBuf) {
    let mut fifo = tokio::fs::File::from_std(fifo);
    if let Err(err) = tokio::io::copy(&mut input, &mut fifo).await {
        tracing::debug!(?err, ?path, "failed copying to stdin");
    }
    if let Err(err) = fifo.flush().await {
        tracing::debug!(?err, ?path, "failed closing stdin");
    }
}

/// Read the exit code that a supervisor recorded for its process
pub async fn read_exit_code(path: &Path) -> Result<i32> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::ExitRecordMissing(path.to_owned()));
        }
        Err(err) => return Err(Error::ProcessDirError(path.to_owned(), err)),
    };
    let content = content.trim();
    if content.is_empty() {
        return Err(Error::ExitRecordEmpty(path.to_owned()));
    }
    content
        .parse()
        .map_err(|source| Error::ExitRecordUnparsable {
            content: content.to_string(),
            source,
        })
}

/// A handle to a running or finished process
#[derive(Clone, Debug)]
pub struct Process {
    entry: Arc<ProcessEntry>,
}

impl Process {
    pub(crate) fn new(entry: Arc<ProcessEntry>) -> Self {
        Self { entry }
    }

    pub fn id(&self) -> &str {
        self.entry.id()
    }

    /// The directory that holds this process's fifos
    pub fn dir(&self) -> &Path {
        self.entry.dir()
    }

    /// Wait for the process to exit and return its exit code.
    ///
    /// All output is delivered to every attached destination
    /// before this returns.
    pub async fn wait(&self) -> Result<i32> {
        self.entry.wait().await
    }

    pub async fn signal(&self, signal: Signal) -> Result<()> {
        self.entry.signaller.signal(signal).await
    }

    /// Apply new terminal settings to the process
    pub async fn set_tty(&self, spec: TtySpec) -> Result<()> {
        self.entry.set_tty(spec).await
    }
}
