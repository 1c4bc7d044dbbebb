// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tracing::Instrument;

use crate::channel::SupervisorChannels;
use crate::config::{Config, Runner};
use crate::depot::ProcessDirs;
use crate::fifo;
use crate::process::{Cleanup, CleanupFn, Process, ProcessEntry, ProcessIo};
use crate::registry::ProcessRegistry;
use crate::runtime_log::is_no_such_executable;
use crate::signal::SignallerFactory;
use crate::supervisor::{self, SupervisorCommand};
use crate::{Error, Result};

#[cfg(test)]
#[path = "./runner_test.rs"]
mod runner_test;

/// The file that a bundle's process configuration is written to in run mode
pub const BUNDLE_CONFIG: &str = "config.json";

/// How the container runtime is asked to start a process
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum RunMode {
    /// Start the first process of a new container from a bundle
    Run,
    /// Start an additional process in an existing container
    #[default]
    Exec,
}

/// Everything needed to start a new process
pub struct RunRequest {
    /// The process id, a new one is generated when empty
    pub id: String,
    pub mode: RunMode,
    /// The container to start the process in
    pub container_handle: String,
    pub bundle_path: PathBuf,
    /// Where process directories live, defaults to `<bundle>/processes`
    pub processes_path: PathBuf,
    pub tty: bool,
    /// The process specification, as json
    pub spec: Vec<u8>,
    /// The host user that owns the named pipes
    pub host_uid: u32,
    pub host_gid: u32,
    pub extra_cleanup: Option<CleanupFn>,
}

impl std::fmt::Debug for RunRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRequest")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("container_handle", &self.container_handle)
            .field("bundle_path", &self.bundle_path)
            .field("processes_path", &self.processes_path)
            .field("tty", &self.tty)
            .finish_non_exhaustive()
    }
}

impl RunRequest {
    pub fn new<H, B>(container_handle: H, bundle_path: B) -> Self
    where
        H: Into<String>,
        B: Into<PathBuf>,
    {
        let bundle_path = bundle_path.into();
        Self {
            id: String::new(),
            mode: RunMode::default(),
            container_handle: container_handle.into(),
            processes_path: bundle_path.join("processes"),
            bundle_path,
            tty: false,
            spec: Vec::new(),
            host_uid: nix::unistd::geteuid().as_raw(),
            host_gid: nix::unistd::getegid().as_raw(),
            extra_cleanup: None,
        }
    }

    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_processes_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.processes_path = path.into();
        self
    }

    pub fn with_tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    pub fn with_spec<S: Into<Vec<u8>>>(mut self, spec: S) -> Self {
        self.spec = spec.into();
        self
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.host_uid = uid;
        self.host_gid = gid;
        self
    }

    pub fn with_extra_cleanup<F>(mut self, cleanup: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.extra_cleanup = Some(Arc::new(cleanup));
        self
    }
}

/// Starts processes through a supervisor and tracks them until they exit
#[derive(Clone)]
pub struct ExecRunner {
    config: Runner,
    signallers: SignallerFactory,
    registry: Arc<ProcessRegistry>,
}

impl std::fmt::Debug for ExecRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecRunner")
            .field("config", &self.config)
            .field("processes", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl ExecRunner {
    pub fn new(config: Runner) -> Self {
        Self {
            config,
            signallers: SignallerFactory::default(),
            registry: Arc::new(ProcessRegistry::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.runner.clone())
            .with_signaller_factory(SignallerFactory::new(config.pidfile.reader()))
    }

    /// Share a registry with other runners
    pub fn with_registry(mut self, registry: Arc<ProcessRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_signaller_factory(mut self, signallers: SignallerFactory) -> Self {
        self.signallers = signallers;
        self
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Start a new process, streaming its io once the supervisor is ready.
    ///
    /// Fails with [`Error::AlreadyInUse`] if a process with
    /// the same id already exists for this container.
    pub async fn run(&self, request: RunRequest, io: ProcessIo) -> Result<Process> {
        let id = match request.id.is_empty() {
            true => uuid::Uuid::new_v4().to_string(),
            false => request.id.clone(),
        };
        let span = tracing::info_span!("execrunner", %id, mode = %request.mode);
        async move {
            tracing::debug!("start");
            let dirs = ProcessDirs::new(&request.processes_path);
            let dir = dirs.create(&id).await?;

            let cleanup = Cleanup {
                registry: Some(Arc::clone(&self.registry)),
                remove_dir: self.config.cleanup_process_dirs_on_wait,
                extra: request.extra_cleanup.clone(),
            };
            let signaller = self.signallers.signaller(fifo::NamedPipes::new(&dir).pidfile);
            let entry = Arc::new(ProcessEntry::new(id.clone(), dir.clone(), signaller, cleanup));
            if let Err(err) = self.registry.register(Arc::clone(&entry)) {
                remove_process_dir(&dir).await;
                return Err(err);
            }

            match self.start(&id, &request, &entry, io).await {
                Ok(()) => {
                    tracing::debug!("done");
                    Ok(Process::new(entry))
                }
                Err(err) => {
                    self.registry.deregister(&entry);
                    remove_process_dir(&dir).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn start(
        &self,
        id: &str,
        request: &RunRequest,
        entry: &ProcessEntry,
        io: ProcessIo,
    ) -> Result<()> {
        let pipes = entry.pipes();
        pipes.create(request.host_uid, request.host_gid)?;

        let target = match request.mode {
            RunMode::Run => {
                let config = entry.dir().join(BUNDLE_CONFIG);
                tokio::fs::write(&config, &request.spec)
                    .await
                    .map_err(|err| Error::ProcessDirError(config, err))?;
                id.to_string()
            }
            RunMode::Exec => request.container_handle.clone(),
        };
        let command = SupervisorCommand {
            supervisor_path: self.config.supervisor_path.clone(),
            runtime_path: self.config.runtime_path.clone(),
            runtime_root: self.config.runtime_root.clone(),
            socket_dir: self.config.socket_dir.clone(),
            tty: request.tty,
            mode: request.mode,
            process_dir: entry.dir().to_owned(),
            target,
        };

        let log_path = supervisor::log_file_path(&request.bundle_path, id);
        let log_file = std::fs::File::create(&log_path)?;
        let channels = SupervisorChannels::new()?;
        let mut cmd = command.command();
        cmd.stdout(log_file.try_clone()?).stderr(log_file);
        cmd.stdin(match request.mode {
            RunMode::Exec => Stdio::piped(),
            RunMode::Run => Stdio::null(),
        });
        channels.install(&mut cmd);

        tracing::debug!(path = ?command.supervisor_path, "starting supervisor");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                let _ = std::fs::remove_file(&log_path);
                return Err(Error::InvocationFailed {
                    mode: request.mode,
                    reason: format!("failed to start supervisor: {err}"),
                    last_log: None,
                });
            }
        };
        let (handshake, exit_status, log) = channels.into_parent_ends()?;
        if let Some(stdin) = child.stdin.take() {
            supervisor::feed_stdin(stdin, request.spec.clone());
        }
        supervisor::spawn_reaper(entry.tasks(), child, log_path);
        let log_relay = log.relay();

        let stdin = fifo::open_read_write(&pipes.stdin)?;
        entry.open_outputs().await?;

        tracing::debug!("waiting for supervisor");
        if let Err(err) = handshake.wait().await {
            let last_log = log_relay.await.ok().flatten();
            return Err(Error::InvocationFailed {
                mode: request.mode,
                reason: format!("supervisor exited before it was ready: {err}"),
                last_log,
            });
        }

        entry.stream(io, Some(stdin)).await?;

        let status = exit_status.read_status().await;
        let last_log = log_relay.await.ok().flatten();
        let reason = match status {
            Ok(Some(0)) => {
                tracing::debug!(status = 0, "runtime started process");
                return Ok(());
            }
            Ok(Some(status)) => {
                tracing::debug!(status, "runtime failed");
                format!("exit status {status}")
            }
            Ok(None) => "failed to read runtime exit status".to_string(),
            Err(err) => format!("failed to read runtime exit status: {err}"),
        };
        match last_log {
            Some(msg) if is_no_such_executable(&msg) => Err(Error::ExecutableNotFound(msg)),
            last_log => Err(Error::InvocationFailed {
                mode: request.mode,
                reason,
                last_log,
            }),
        }
    }

    /// Connect to an existing process.
    ///
    /// Processes that are still tracked by this runner share their
    /// output with any previous callers, others are read directly
    /// from their named pipes.
    pub async fn attach(
        &self,
        process_id: &str,
        io: ProcessIo,
        processes_path: &Path,
    ) -> Result<Process> {
        let span = tracing::info_span!("execrunner", id = %process_id);
        async move {
            let dir = ProcessDirs::new(processes_path).lookup(process_id).await?;
            let entry = match self.registry.lookup(&dir) {
                Some(entry) => entry,
                None => {
                    tracing::debug!("attaching to untracked process");
                    let signaller =
                        self.signallers.signaller(fifo::NamedPipes::new(&dir).pidfile);
                    let cleanup = Cleanup {
                        registry: None,
                        remove_dir: self.config.cleanup_process_dirs_on_wait,
                        extra: None,
                    };
                    Arc::new(ProcessEntry::new(
                        process_id.to_string(),
                        dir,
                        signaller,
                        cleanup,
                    ))
                }
            };
            entry.stream(io, None).await?;
            Ok(Process::new(entry))
        }
        .instrument(span)
        .await
    }
}

async fn remove_process_dir(dir: &Path) {
    if let Err(err) = tokio::fs::remove_dir_all(dir).await {
        tracing::info!(?err, path = ?dir, "failed to remove process dir");
    }
}
