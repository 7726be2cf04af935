//! Instance registry integration tests
//!
//! Joins go through `RegistryConfig` the way plugin instances do, each in
//! its own thread.

use panlink::{InstanceRegistry, RegistryConfig};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Barrier};

fn config(dir: &Path, group: &str) -> RegistryConfig {
    RegistryConfig {
        group: Some(group.to_string()),
        directory: Some(dir.to_path_buf()),
    }
}

/// Concurrent joins get indices 1..=N with no gaps or repeats.
#[test]
fn test_concurrent_instances_get_distinct_indices() {
    const INSTANCES: usize = 12;
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "concurrent");
    let barrier = Arc::new(Barrier::new(INSTANCES));

    let handles: Vec<_> = (0..INSTANCES)
        .map(|_| {
            let config = config.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                InstanceRegistry::new(&config).unwrap()
            })
        })
        .collect();
    let registries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let indices: BTreeSet<u32> = registries.iter().map(|r| r.instantiation_index()).collect();
    assert_eq!(indices, (1..=INSTANCES as u32).collect());
    assert!(registries
        .iter()
        .all(|r| r.live_instances() == INSTANCES as u32));

    let mut registries = registries.into_iter();
    let survivor = registries.next().unwrap();
    let leavers: Vec<_> = registries
        .map(|r| std::thread::spawn(move || r.leave().unwrap()))
        .collect();
    for handle in leavers {
        handle.join().unwrap();
    }
    assert_eq!(survivor.live_instances(), 1);
}

/// The first session id wins and every member of the group sees it.
#[test]
fn test_session_id_is_shared_by_the_group() {
    let dir = tempfile::tempdir().unwrap();
    let first = InstanceRegistry::new(&config(dir.path(), "shared")).unwrap();
    let second = InstanceRegistry::new(&config(dir.path(), "shared")).unwrap();
    let other_group = InstanceRegistry::new(&config(dir.path(), "elsewhere")).unwrap();

    assert!(!second.is_identifier_received());
    assert_eq!(second.session_id(), "");

    assert!(second.set_instance_identifier("session-42").unwrap());
    assert!(!first.set_instance_identifier("session-43").unwrap());

    assert_eq!(first.session_id(), "session-42");
    assert_eq!(second.session_id(), "session-42");
    assert!(first.is_identifier_received());

    // A joiner after the id was set sees it immediately.
    let late = InstanceRegistry::new(&config(dir.path(), "shared")).unwrap();
    assert_eq!(late.instantiation_index(), 3);
    assert_eq!(late.session_id(), "session-42");

    assert_eq!(other_group.session_id(), "");
    assert_eq!(other_group.instantiation_index(), 1);
}

/// When the last instance leaves, the group starts over.
#[test]
fn test_group_restarts_after_last_instance_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let first = InstanceRegistry::new(&config(dir.path(), "restart")).unwrap();
    let second = InstanceRegistry::new(&config(dir.path(), "restart")).unwrap();
    first.set_instance_identifier("old-session").unwrap();
    let path = first.path();

    first.leave().unwrap();
    assert_eq!(second.live_instances(), 1);
    assert!(path.exists());

    second.leave().unwrap();
    assert!(!path.exists());

    let fresh = InstanceRegistry::new(&config(dir.path(), "restart")).unwrap();
    assert_eq!(fresh.instantiation_index(), 1);
    assert_eq!(fresh.session_id(), "");
}

#[test]
fn test_invalid_group_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    assert!(InstanceRegistry::new(&config(dir.path(), "../escape")).is_err());
}
