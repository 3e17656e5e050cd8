//! Copy-on-write layer cloning.
//!
//! All children of a parent share one internal snapshot of it. The first
//! clone takes the snapshot and records its UUID in the parent's
//! `uuid-for-children` value; later clones reuse it. A child gets a copy of
//! the parent's descriptor, hardlinks to the parent's delta files, and is
//! then switched to the shared snapshot so its writes land in a new top delta.

use std::io::ErrorKind;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use ploop_common::paths::{IMAGE_PREFIX, PARENT_LINK, SNAPSHOT_MARKER};
use ploop_common::{DriverPaths, PloopError, PloopResult};

use crate::fsutil;
use crate::image::ImageBackend;

/// Creates child layers from parent snapshots.
pub struct CloneEngine {
    backend: Arc<dyn ImageBackend>,
    paths: DriverPaths,
    /// Serializes snapshot creation per parent within this process.
    snapshot_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CloneEngine {
    /// Create a clone engine.
    pub fn new(backend: Arc<dyn ImageBackend>, paths: DriverPaths) -> Self {
        Self {
            backend,
            paths,
            snapshot_locks: DashMap::new(),
        }
    }

    /// Populate the (already created) directory of `child` as a clone of `parent`.
    ///
    /// Nothing is rolled back on failure; the caller removes the child directory.
    pub fn clone_layer(&self, child: &str, parent: &str) -> PloopResult<()> {
        let snapshot = self.shared_snapshot(parent)?;

        let child_dir = self.paths.layer(child);
        let parent_dir = self.paths.layer(parent);

        std::os::unix::fs::symlink(
            DriverPaths::parent_link_target(parent),
            child_dir.join(PARENT_LINK),
        )
        .inspect_err(|e| {
            tracing::error!(layer_id = child, parent_id = parent, error = %e, "Failed to link parent");
        })?;

        fsutil::copy_file(&self.paths.descriptor(parent), &self.paths.descriptor(child))?;
        let linked = fsutil::hardlink_prefixed(&parent_dir, &child_dir, IMAGE_PREFIX)?;

        tracing::debug!(
            layer_id = child,
            parent_id = parent,
            %snapshot,
            linked,
            "Switching clone to shared snapshot"
        );

        let mut image = self.backend.open(&self.paths.descriptor(child))?;
        let switched = image.switch_snapshot(&snapshot);
        let closed = image.close();
        switched?;
        closed?;

        Ok(())
    }

    /// The snapshot children of `parent` are built from, taking it if needed.
    pub fn shared_snapshot(&self, parent: &str) -> PloopResult<String> {
        let parent_dir = self.paths.layer(parent);

        let lock = self
            .snapshot_locks
            .entry(parent.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock();

        if let Some(snapshot) = fsutil::read_value(&parent_dir, SNAPSHOT_MARKER)? {
            tracing::debug!(parent_id = parent, %snapshot, "Reusing shared snapshot");
            return Ok(snapshot);
        }

        tracing::debug!(parent_id = parent, "Creating shared snapshot");

        let mut image = self.backend.open(&self.paths.descriptor(parent))?;
        let snapshot = match image.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let _ = image.close();
                return Err(e);
            }
        };
        // Closing persists the descriptor that now lists the snapshot.
        image.close()?;

        match fsutil::write_value(&parent_dir, SNAPSHOT_MARKER, &snapshot) {
            Ok(()) => Ok(snapshot),
            Err(PloopError::Io(e)) if e.kind() == ErrorKind::AlreadyExists => {
                let existing = fsutil::read_value(&parent_dir, SNAPSHOT_MARKER)?.ok_or_else(|| {
                    PloopError::Internal {
                        message: format!("snapshot marker of {parent} vanished"),
                    }
                })?;
                tracing::warn!(
                    parent_id = parent,
                    orphaned = %snapshot,
                    shared = %existing,
                    "Snapshot marker written concurrently, adopting existing snapshot"
                );
                Ok(existing)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop the snapshot lock of a removed layer.
    pub fn forget(&self, id: &str) {
        self.snapshot_locks.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt;

    use super::*;
    use crate::image::CreateParams;
    use crate::image::fake::FakeBackend;

    fn setup() -> (tempfile::TempDir, FakeBackend, CloneEngine) {
        let temp = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new();
        let paths = DriverPaths::with_home(temp.path());

        std::fs::create_dir(paths.layer("base")).unwrap();
        backend
            .create(&CreateParams {
                image: paths.image("base"),
                size: ploop_common::ByteSize::gibibytes(1),
                mode: crate::image::ImageMode::Expanded,
                cluster_log: 9,
            })
            .unwrap();

        let engine = CloneEngine::new(Arc::new(backend.clone()), paths);
        (temp, backend, engine)
    }

    #[test]
    fn first_clone_takes_snapshot() {
        let (temp, backend, engine) = setup();
        std::fs::create_dir(temp.path().join("child")).unwrap();

        engine.clone_layer("child", "base").unwrap();

        assert_eq!(backend.snapshot_count(), 1);
        let marker = std::fs::read_to_string(temp.path().join("base/uuid-for-children")).unwrap();
        let state = backend.state.lock();
        assert_eq!(state.snapshots[0].1, marker);
        assert_eq!(
            state.switches,
            vec![(temp.path().join("child/DiskDescriptor.xml"), marker)]
        );
    }

    #[test]
    fn clone_links_data_and_copies_descriptor() {
        let (temp, _backend, engine) = setup();
        std::fs::create_dir(temp.path().join("child")).unwrap();

        engine.clone_layer("child", "base").unwrap();

        let base = std::fs::metadata(temp.path().join("base/root.hdd")).unwrap();
        let child = std::fs::metadata(temp.path().join("child/root.hdd")).unwrap();
        assert_eq!(base.ino(), child.ino());

        let base_dd = std::fs::metadata(temp.path().join("base/DiskDescriptor.xml")).unwrap();
        let child_dd = std::fs::metadata(temp.path().join("child/DiskDescriptor.xml")).unwrap();
        assert_ne!(base_dd.ino(), child_dd.ino());

        assert_eq!(
            std::fs::read_link(temp.path().join("child/parent")).unwrap(),
            std::path::PathBuf::from("../base")
        );
        assert!(!temp.path().join("child/uuid-for-children").exists());
    }

    #[test]
    fn siblings_share_one_snapshot() {
        let (temp, backend, engine) = setup();
        for child in ["c1", "c2", "c3"] {
            std::fs::create_dir(temp.path().join(child)).unwrap();
            engine.clone_layer(child, "base").unwrap();
        }

        assert_eq!(backend.snapshot_count(), 1);
        let state = backend.state.lock();
        assert_eq!(state.switches.len(), 3);
        assert!(state.switches.iter().all(|(_, uuid)| *uuid == state.snapshots[0].1));
    }

    #[test]
    fn concurrent_clones_share_one_snapshot() {
        let (temp, backend, engine) = setup();
        let engine = Arc::new(engine);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let engine = Arc::clone(&engine);
                let child = format!("c{i}");
                std::fs::create_dir(temp.path().join(&child)).unwrap();
                std::thread::spawn(move || engine.clone_layer(&child, "base"))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(backend.snapshot_count(), 1);
    }

    #[test]
    fn existing_marker_is_adopted() {
        let (temp, backend, engine) = setup();
        let uuid = engine.shared_snapshot("base").unwrap();

        // A second engine has no lock history and still reuses the marker.
        let other = CloneEngine::new(Arc::new(backend.clone()), DriverPaths::with_home(temp.path()));
        assert_eq!(other.shared_snapshot("base").unwrap(), uuid);
        assert_eq!(backend.snapshot_count(), 1);
    }

    #[test]
    fn missing_parent_fails() {
        let (temp, _backend, engine) = setup();
        std::fs::create_dir(temp.path().join("child")).unwrap();

        let err = engine.clone_layer("child", "ghost").unwrap_err();
        assert!(err.is_not_found());
    }
}
