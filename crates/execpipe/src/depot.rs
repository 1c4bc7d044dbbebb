// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./depot_test.rs"]
mod depot_test;

/// The directory that holds one subdirectory per process
/// that was started in a container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessDirs {
    root: PathBuf,
}

impl ProcessDirs {
    pub fn new<P: Into<PathBuf>>(processes_path: P) -> Self {
        Self {
            root: processes_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// The directory for the given process, whether or not it exists.
    ///
    /// Fails for ids that would name a path outside of this directory.
    pub fn dir_for(&self, process_id: &str) -> Result<PathBuf> {
        let dir = self.root.join(process_id);
        if matches!(process_id, "" | "." | "..") || process_id.contains('/') {
            return Err(Error::ProcessDirError(
                dir,
                std::io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("invalid process id {process_id:?}"),
                ),
            ));
        }
        Ok(dir)
    }

    /// Create the directory for a new process.
    ///
    /// Creation is atomic, so when many callers race
    /// for the same id exactly one of them succeeds.
    pub async fn create(&self, process_id: &str) -> Result<PathBuf> {
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.root)
            .await
            .map_err(|err| Error::ProcessDirError(self.root.clone(), err))?;

        let dir = self.dir_for(process_id)?;
        match tokio::fs::DirBuilder::new().mode(0o700).create(&dir).await {
            Ok(()) => Ok(dir),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(Error::AlreadyInUse(process_id.to_string()))
            }
            Err(err) => Err(Error::ProcessDirError(dir, err)),
        }
    }

    /// Find the directory of an existing process
    pub async fn lookup(&self, process_id: &str) -> Result<PathBuf> {
        let dir = self.dir_for(process_id)?;
        match tokio::fs::metadata(&dir).await {
            Ok(_) => Ok(dir),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(Error::ProcessNotFound(process_id.to_string()))
            }
            Err(err) => Err(Error::ProcessDirError(dir, err)),
        }
    }

    /// All existing process directories, in name order
    pub async fn list(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Error::ProcessDirError(self.root.clone(), err)),
        };

        let mut dirs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| Error::ProcessDirError(self.root.clone(), err))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| Error::ProcessDirError(entry.path(), err))?;
            if file_type.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}
