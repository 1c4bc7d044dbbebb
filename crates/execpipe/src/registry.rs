// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::process::ProcessEntry;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./registry_test.rs"]
mod registry_test;

/// The set of live processes, keyed by process directory.
///
/// A process is registered when it is started and removed
/// once its exit code has been collected.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    entries: DashMap<PathBuf, Arc<ProcessEntry>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new entry, failing if its directory is already tracked
    pub(crate) fn register(&self, entry: Arc<ProcessEntry>) -> Result<()> {
        match self.entries.entry(entry.dir().to_owned()) {
            Entry::Occupied(_) => Err(Error::AlreadyInUse(entry.id().to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(())
            }
        }
    }

    pub(crate) fn lookup(&self, dir: &Path) -> Option<Arc<ProcessEntry>> {
        self.entries.get(dir).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove the given entry, leaving any other entry
    /// that has since been registered for the same directory.
    pub(crate) fn deregister(&self, entry: &ProcessEntry) -> bool {
        self.entries
            .remove_if(entry.dir(), |_, existing| {
                std::ptr::eq(Arc::as_ptr(existing), entry)
            })
            .is_some()
    }

    /// True if a live process is tracked for the given directory
    pub fn contains(&self, dir: &Path) -> bool {
        self.entries.contains_key(dir)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
