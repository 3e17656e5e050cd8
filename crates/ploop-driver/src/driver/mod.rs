//! The layering driver.
//!
//! [`Driver`] is the lifecycle surface a layer store calls into. It composes
//! the master template, the clone engine and the mount manager, and keeps the
//! home directory layout consistent:
//!
//! ```text
//! <home>/master/              template image, recreated on every start
//! <home>/<id>/                descriptor + delta files of a layer
//! <home>/<id>/parent          -> ../<parent id>, clones only
//! <home>/<id>/uuid-for-children
//! <home>/mnt/<id>/            mount point, empty unless mounted
//! ```

mod clone;
mod mounts;
mod template;


use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ploop_common::paths::{PARENT_LINK, SNAPSHOT_MARKER};
use ploop_common::size::format_bytes;
use ploop_common::{DriverPaths, LayerId, PloopError, PloopResult};
use rustix::fs::Mode;
use walkdir::WalkDir;

use crate::config::DriverOptions;
use crate::fsutil;
use crate::image::{ImageBackend, PloopCli, VERBOSITY_TIMESTAMPS};

pub use clone::CloneEngine;
pub use mounts::{MountManager, MountRecord};
pub use template::MasterTemplate;

/// Name the driver reports itself as.
pub const DRIVER_NAME: &str = "ploop";

/// Forced release rounds Remove makes before giving up on a mounted layer.
const REMOVE_ATTEMPTS: usize = 3;

const LAYER_DIR_MODE: u32 = 0o700;
const MOUNT_DIR_MODE: u32 = 0o755;

/// Copy-on-write layer driver backed by ploop images.
pub struct Driver {
    paths: DriverPaths,
    options: DriverOptions,
    template: MasterTemplate,
    clones: CloneEngine,
    mounts: MountManager,
}

impl Driver {
    /// Start the driver on `home` using the `ploop` utility.
    ///
    /// # Errors
    ///
    /// Fails on bad options or if the master template cannot be created.
    pub fn init<I, S>(home: impl Into<PathBuf>, options: I) -> PloopResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::with_backend(home, options, Arc::new(PloopCli::default()))
    }

    /// Start the driver on `home` with an explicit image backend.
    ///
    /// # Errors
    ///
    /// Fails on bad options or if the master template cannot be created.
    pub fn with_backend<I, S>(
        home: impl Into<PathBuf>,
        options: I,
        backend: Arc<dyn ImageBackend>,
    ) -> PloopResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let options = DriverOptions::parse(options)?;
        let paths = DriverPaths::with_home(home);

        match options.lib_debug {
            Some(level) => backend.set_verbosity(level),
            None if tracing::enabled!(tracing::Level::DEBUG) => {
                backend.set_verbosity(VERBOSITY_TIMESTAMPS);
            }
            None => {}
        }

        paths.create_dirs()?;

        let template = MasterTemplate::new(Arc::clone(&backend), paths.clone(), &options);
        template.recreate()?;

        tracing::info!(
            home = %paths.home.display(),
            size = %options.size,
            mode = %options.mode,
            clog = options.cluster_log,
            "Ploop driver initialized"
        );

        Ok(Self {
            clones: CloneEngine::new(Arc::clone(&backend), paths.clone()),
            mounts: MountManager::new(backend, paths.clone()),
            template,
            paths,
            options,
        })
    }

    /// Create layer `id`, empty or as a copy-on-write clone of `parent`.
    ///
    /// An empty parent is the same as none.
    ///
    /// # Errors
    ///
    /// Fails if `id` already exists or `parent` does not. A layer directory
    /// created before the failure is removed again.
    pub fn create(&self, id: &str, parent: Option<&str>) -> PloopResult<()> {
        let id = LayerId::new(id)?;
        let parent = parent
            .filter(|parent| !parent.is_empty())
            .map(LayerId::new)
            .transpose()?;

        tracing::debug!(layer_id = %id, parent_id = ?parent.as_ref().map(LayerId::as_str), "Creating layer");

        self.create_layer(id.as_str(), parent.as_ref().map(LayerId::as_str))
            .map_err(|e| e.for_layer(id.as_str(), "create"))
    }

    fn create_layer(&self, id: &str, parent: Option<&str>) -> PloopResult<()> {
        if let Some(parent) = parent
            && !self.exists(parent)
        {
            return Err(PloopError::LayerNotFound {
                id: parent.to_string(),
            });
        }

        let layer_dir = self.paths.layer(id);
        match make_dir(&layer_dir, LAYER_DIR_MODE) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(PloopError::LayerExists { id: id.to_string() });
            }
            Err(e) => return Err(e.into()),
        }

        let populated = match parent {
            None => self.template.materialize(&layer_dir),
            Some(parent) => self.clones.clone_layer(id, parent),
        };

        if let Err(e) = populated {
            if let Err(cleanup) = std::fs::remove_dir_all(&layer_dir) {
                tracing::warn!(layer_id = id, error = %cleanup, "Failed to remove partially created layer");
            }
            return Err(e);
        }

        // The layer itself stays if only its mount point is missing.
        match make_dir(&self.paths.mount_point(id), MOUNT_DIR_MODE) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::debug!(layer_id = id, "Reusing existing mount point");
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(layer_id = id, parent_id = ?parent, "Layer created");
        Ok(())
    }

    /// Remove layer `id` with its mount point.
    ///
    /// A layer that is still mounted is released first. Its directories are
    /// left alone while it stays mounted.
    ///
    /// # Errors
    ///
    /// Fails if the layer stays mounted or its directories cannot be removed.
    pub fn remove(&self, id: &str) -> PloopResult<()> {
        let id = LayerId::new(id)?;
        self.remove_layer(id.as_str())
            .map_err(|e| e.for_layer(id.as_str(), "remove"))
    }

    fn remove_layer(&self, id: &str) -> PloopResult<()> {
        let mut attempts = 0;
        while self.mounts.is_tracked(id) {
            if attempts == REMOVE_ATTEMPTS {
                return Err(PloopError::StillMounted {
                    id: id.to_string(),
                    attempts,
                });
            }
            attempts += 1;

            tracing::warn!(
                layer_id = id,
                count = self.mounts.ref_count(id),
                attempt = attempts,
                "Removing a mounted layer, releasing it first"
            );
            if let Err(e) = self.mounts.force_release(id) {
                tracing::warn!(layer_id = id, attempt = attempts, error = %e, "Forced release failed");
            }
        }

        remove_dir_all(&self.paths.mount_point(id))?;
        remove_dir_all(&self.paths.layer(id))?;
        self.clones.forget(id);

        tracing::info!(layer_id = id, "Layer removed");
        Ok(())
    }

    /// Mount layer `id` and return its mount point.
    ///
    /// Nested calls share one mount; each needs a matching [`Driver::put`].
    /// `mount_label` is an optional security label for the mounted filesystem.
    ///
    /// # Errors
    ///
    /// Fails if the layer does not exist or cannot be mounted.
    pub fn get(&self, id: &str, mount_label: &str) -> PloopResult<PathBuf> {
        let id = LayerId::new(id)?;
        let id = id.as_str();

        self.mounts.get(id, mount_label).map_err(|e| {
            if e.is_not_found() && !self.exists(id) {
                PloopError::LayerNotFound { id: id.to_string() }
            } else {
                e.for_layer(id, "get")
            }
        })
    }

    /// Release one hold on layer `id`.
    ///
    /// # Errors
    ///
    /// Fails if the last release cannot unmount the layer. The mount is no
    /// longer tracked in that case.
    pub fn put(&self, id: &str) -> PloopResult<()> {
        let id = LayerId::new(id)?;
        self.mounts
            .put(id.as_str())
            .map_err(|e| e.for_layer(id.as_str(), "put"))
    }

    /// Whether layer `id` exists, judged by its image descriptor.
    pub fn exists(&self, id: &str) -> bool {
        if LayerId::new(id).is_err() {
            return false;
        }

        match std::fs::metadata(self.paths.descriptor(id)) {
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                tracing::error!(layer_id = id, error = %e, "Failed to stat layer descriptor");
                false
            }
        }
    }

    /// Driver status as ordered key/value pairs.
    pub fn status(&self) -> Vec<(String, String)> {
        let mut status = vec![
            ("Home directory".to_string(), self.paths.home.display().to_string()),
            ("Ploop mode".to_string(), self.options.mode.to_string()),
            ("Ploop image size".to_string(), self.options.size.to_string()),
            (
                "Ploop cluster block log".to_string(),
                self.options.cluster_log.to_string(),
            ),
        ];

        match rustix::fs::statvfs(&self.paths.home) {
            Ok(stat) => {
                let total = stat.f_blocks * stat.f_frsize;
                let used = stat.f_blocks.saturating_sub(stat.f_bfree) * stat.f_frsize;
                let available = stat.f_bavail * stat.f_frsize;
                status.push(("Disk space used".to_string(), format_bytes(used)));
                status.push(("Disk space total".to_string(), format_bytes(total)));
                status.push(("Disk space available".to_string(), format_bytes(available)));
            }
            Err(e) => {
                tracing::warn!(home = %self.paths.home.display(), error = %e, "Failed to stat home filesystem");
                for key in ["Disk space used", "Disk space total", "Disk space available"] {
                    status.push((key.to_string(), "unknown".to_string()));
                }
            }
        }

        let devices: Vec<_> = self
            .mounts
            .tracked()
            .into_iter()
            .map(|(_, record)| record.device)
            .collect();
        let mounted = if devices.is_empty() {
            "0".to_string()
        } else {
            format!("{} ({})", devices.len(), devices.join(", "))
        };
        status.push(("Mounted devices".to_string(), mounted));

        status
    }

    /// Details about layer `id`.
    ///
    /// # Errors
    ///
    /// Fails if the layer does not exist.
    pub fn metadata(&self, id: &str) -> PloopResult<BTreeMap<String, String>> {
        let id = LayerId::new(id)?;
        let id = id.as_str();
        if !self.exists(id) {
            return Err(PloopError::LayerNotFound { id: id.to_string() });
        }

        let layer_dir = self.paths.layer(id);
        let mut metadata = BTreeMap::new();
        metadata.insert("Format".to_string(), DRIVER_NAME.to_string());
        metadata.insert(
            "DescriptorPath".to_string(),
            self.paths.descriptor(id).display().to_string(),
        );
        metadata.insert(
            "MountPoint".to_string(),
            self.paths.mount_point(id).display().to_string(),
        );

        match self.mounts.record(id) {
            Some(record) => {
                metadata.insert("Mounted".to_string(), "true".to_string());
                metadata.insert("MountCount".to_string(), record.count.to_string());
                metadata.insert("Device".to_string(), record.device);
                metadata.insert("ReadOnly".to_string(), record.read_only.to_string());
            }
            None => {
                metadata.insert("Mounted".to_string(), "false".to_string());
                metadata.insert("MountCount".to_string(), "0".to_string());
            }
        }

        if let Some(snapshot) = fsutil::read_value(&layer_dir, SNAPSHOT_MARKER)
            .map_err(|e| e.for_layer(id, "metadata"))?
        {
            metadata.insert("SharedSnapshot".to_string(), snapshot);
        }

        if let Some(parent) = parent_of(&layer_dir) {
            metadata.insert("Parent".to_string(), parent);
        }

        metadata.insert("DiskUsage".to_string(), format_bytes(disk_usage(&layer_dir)));

        Ok(metadata)
    }

    /// Shut the driver down.
    ///
    /// Drops the master template and force-unmounts every layer still
    /// mounted. Failures are logged, never returned.
    pub fn cleanup(&self) {
        if let Err(e) = self.template.discard() {
            tracing::warn!(error = %e, "Failed to discard master template");
        }

        let released = self.mounts.force_release_all();
        if released > 0 {
            tracing::warn!(released, "Released layers still mounted at shutdown");
        }

        tracing::info!("Ploop driver cleaned up");
    }

    /// Number of holders of layer `id`.
    pub fn mount_count(&self, id: &str) -> usize {
        self.mounts.ref_count(id)
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(DRIVER_NAME)
    }
}

fn make_dir(path: &Path, mode: u32) -> std::io::Result<()> {
    rustix::fs::mkdir(path, Mode::from_raw_mode(mode)).map_err(std::io::Error::from)
}

fn remove_dir_all(path: &Path) -> PloopResult<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn parent_of(layer_dir: &Path) -> Option<String> {
    let target = std::fs::read_link(layer_dir.join(PARENT_LINK)).ok()?;
    target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

/// Bytes allocated to the files of a layer directory.
fn disk_usage(layer_dir: &Path) -> u64 {
    WalkDir::new(layer_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.blocks() * 512)
        .sum()
}
