// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::Path;
use std::sync::Arc;

use rstest::rstest;

use super::ProcessRegistry;
use crate::process::{Cleanup, ProcessEntry};
use crate::signal::SignallerFactory;
use crate::Error;

fn entry(id: &str, dir: &str) -> Arc<ProcessEntry> {
    let signaller = SignallerFactory::default().signaller(Path::new(dir).join("pidfile"));
    Arc::new(ProcessEntry::new(
        id.to_string(),
        dir.into(),
        signaller,
        Cleanup {
            registry: None,
            remove_dir: false,
            extra: None,
        },
    ))
}

#[rstest]
fn test_register_and_lookup() {
    let registry = ProcessRegistry::new();
    assert!(registry.is_empty());

    let first = entry("one", "/procs/one");
    registry.register(Arc::clone(&first)).unwrap();
    registry.register(entry("two", "/procs/two")).unwrap();

    assert_eq!(registry.len(), 2);
    assert!(registry.contains(Path::new("/procs/one")));
    let found = registry
        .lookup(Path::new("/procs/one"))
        .expect("entry should be registered");
    assert!(Arc::ptr_eq(&found, &first));
    assert!(registry.lookup(Path::new("/procs/three")).is_none());
}

#[rstest]
fn test_register_same_dir_twice() {
    let registry = ProcessRegistry::new();
    registry.register(entry("one", "/procs/one")).unwrap();
    let err = registry
        .register(entry("one", "/procs/one"))
        .expect_err("a second entry for the same dir should be rejected");
    assert!(matches!(err, Error::AlreadyInUse(ref id) if id == "one"), "{err}");
    assert_eq!(registry.len(), 1);
}

#[rstest]
fn test_deregister_only_removes_same_entry() {
    let registry = ProcessRegistry::new();
    let current = entry("one", "/procs/one");
    let stale = entry("one", "/procs/one");
    registry.register(Arc::clone(&current)).unwrap();

    assert!(!registry.deregister(&stale), "a different entry must not be removed");
    assert!(registry.contains(Path::new("/procs/one")));

    assert!(registry.deregister(&current));
    assert!(registry.is_empty());
    assert!(!registry.deregister(&current), "already removed");
}
