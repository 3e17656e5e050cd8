//! On-disk layout of the driver home.
//!
//! ```text
//! <home>/
//!   master/<descriptor + data files>    template, recreated each start
//!   <id>/<descriptor + data files>      one per layer
//!   <id>/parent -> ../<parent>          debug symlink, clones only
//!   <id>/uuid-for-children              shared snapshot marker
//!   mnt/<id>/                           mount point
//! ```

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Default home directory for the driver.
pub static PLOOP_HOME: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("PLOOP_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/ploop"))
});

/// Name of the master template directory under the home.
pub const MASTER_DIR: &str = "master";

/// Name of the mount-point root under the home.
pub const MOUNTS_DIR: &str = "mnt";

/// Image descriptor file inside an image directory.
pub const DESCRIPTOR_FILE: &str = "DiskDescriptor.xml";

/// Prefix shared by all image data (delta) files.
pub const IMAGE_PREFIX: &str = "root.hdd";

/// Value key holding the snapshot children are cloned from.
pub const SNAPSHOT_MARKER: &str = "uuid-for-children";

/// Debug symlink from a clone to its parent.
pub const PARENT_LINK: &str = "parent";

/// Paths of the driver layout rooted at a home directory.
#[derive(Debug, Clone)]
pub struct DriverPaths {
    /// Driver home directory.
    pub home: PathBuf,
}

impl DriverPaths {
    /// Create paths with a custom home directory.
    #[must_use]
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Metadata directory of a layer.
    #[must_use]
    pub fn layer(&self, id: &str) -> PathBuf {
        self.home.join(id)
    }

    /// Image descriptor of a layer.
    #[must_use]
    pub fn descriptor(&self, id: &str) -> PathBuf {
        self.layer(id).join(DESCRIPTOR_FILE)
    }

    /// Base image data file of a layer.
    #[must_use]
    pub fn image(&self, id: &str) -> PathBuf {
        self.layer(id).join(IMAGE_PREFIX)
    }

    /// Root of all mount points.
    #[must_use]
    pub fn mounts(&self) -> PathBuf {
        self.home.join(MOUNTS_DIR)
    }

    /// Mount point of a layer.
    #[must_use]
    pub fn mount_point(&self, id: &str) -> PathBuf {
        self.mounts().join(id)
    }

    /// Master template directory.
    #[must_use]
    pub fn master(&self) -> PathBuf {
        self.home.join(MASTER_DIR)
    }

    /// Master template descriptor.
    #[must_use]
    pub fn master_descriptor(&self) -> PathBuf {
        self.master().join(DESCRIPTOR_FILE)
    }

    /// Master template base image.
    #[must_use]
    pub fn master_image(&self) -> PathBuf {
        self.master().join(IMAGE_PREFIX)
    }

    /// Relative target of the parent debug link.
    #[must_use]
    pub fn parent_link_target(parent: &str) -> PathBuf {
        Path::new("..").join(parent)
    }

    /// Create the home and mount-point root.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.home)?;
        std::fs::create_dir_all(self.mounts())?;
        Ok(())
    }
}
