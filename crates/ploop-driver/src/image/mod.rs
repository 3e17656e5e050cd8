//! Boundary to the ploop virtual disk image subsystem.
//!
//! The driver never touches delta files directly. Everything it needs from
//! the image engine goes through [`ImageBackend`] and [`DiskImage`]:
//! creating images, mounting and unmounting them, taking internal snapshots
//! and switching the active delta to a snapshot.

mod command;
#[cfg(test)]
pub(crate) mod fake;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ploop_common::{ByteSize, PloopError, PloopResult};

pub use command::PloopCli;

/// Native verbosity that adds timestamps to ploop's own log lines.
pub const VERBOSITY_TIMESTAMPS: i32 = 4;

/// Image allocation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageMode {
    /// Sparse image growing on demand.
    #[default]
    Expanded,
    /// Fully allocated ploop image.
    Preallocated,
    /// Raw, fully allocated image without ploop headers.
    Raw,
}

impl ImageMode {
    /// Name understood by `ploop init -f`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Expanded => "expanded",
            Self::Preallocated => "preallocated",
            Self::Raw => "raw",
        }
    }
}

impl fmt::Display for ImageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageMode {
    type Err = PloopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "expanded" => Ok(Self::Expanded),
            "preallocated" => Ok(Self::Preallocated),
            "raw" => Ok(Self::Raw),
            _ => Err(PloopError::InvalidOption {
                key: "ploop.mode".to_string(),
                value: s.to_string(),
                reason: "expected expanded, preallocated or raw".to_string(),
            }),
        }
    }
}

/// Parameters for creating a fresh image.
#[derive(Debug, Clone)]
pub struct CreateParams {
    /// Base image file; the descriptor is created next to it.
    pub image: PathBuf,
    /// Image capacity.
    pub size: ByteSize,
    /// Allocation strategy.
    pub mode: ImageMode,
    /// Cluster block size as a power of two of 512-byte sectors.
    pub cluster_log: u8,
}

impl CreateParams {
    /// Cluster block size in sectors.
    #[must_use]
    pub const fn cluster_sectors(&self) -> u32 {
        1 << self.cluster_log
    }
}

/// Parameters for mounting an image.
#[derive(Debug, Clone, Default)]
pub struct MountParams {
    /// Mount point.
    pub target: PathBuf,
    /// Mount the filesystem read-only.
    pub read_only: bool,
    /// Security label for the mounted filesystem (SELinux context).
    pub label: Option<String>,
}

impl MountParams {
    /// Mount data carrying the security label, if any.
    #[must_use]
    pub fn mount_data(&self) -> Option<String> {
        self.label
            .as_deref()
            .filter(|label| !label.is_empty())
            .map(|label| format!("context=\"{label}\""))
    }
}

/// An image engine able to create and open disk images.
pub trait ImageBackend: Send + Sync {
    /// Create a new image as described by `params`.
    fn create(&self, params: &CreateParams) -> PloopResult<()>;

    /// Open the image described by `descriptor`.
    fn open(&self, descriptor: &Path) -> PloopResult<Box<dyn DiskImage>>;

    /// Detach a device by name regardless of which image it serves.
    fn force_unmount(&self, device: &str) -> PloopResult<()>;

    /// Set the engine's own log verbosity.
    fn set_verbosity(&self, level: i32);
}

/// An open image descriptor.
pub trait DiskImage: Send {
    /// Mount the image, returning the block device serving it.
    fn mount(&mut self, params: &MountParams) -> PloopResult<String>;

    /// Unmount the image. Fails with [`PloopError::NotMounted`] if it is not mounted.
    fn unmount(&mut self) -> PloopResult<()>;

    /// Take an internal snapshot, returning its identifier.
    fn snapshot(&mut self) -> PloopResult<String>;

    /// Make `uuid` the base of a fresh top delta, dropping the old top delta.
    fn switch_snapshot(&mut self, uuid: &str) -> PloopResult<()>;

    /// Whether a device currently serves this image.
    fn is_mounted(&self) -> PloopResult<bool>;

    /// Release the descriptor, committing any pending descriptor changes.
    fn close(self: Box<Self>) -> PloopResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!("expanded".parse::<ImageMode>().unwrap(), ImageMode::Expanded);
        assert_eq!(
            "Preallocated".parse::<ImageMode>().unwrap(),
            ImageMode::Preallocated
        );
        assert_eq!("RAW".parse::<ImageMode>().unwrap(), ImageMode::Raw);
        assert!("sparse".parse::<ImageMode>().is_err());
    }

    #[test]
    fn cluster_sectors_from_log() {
        let params = CreateParams {
            image: PathBuf::from("/x/root.hdd"),
            size: ByteSize::gibibytes(1),
            mode: ImageMode::Expanded,
            cluster_log: 9,
        };
        assert_eq!(params.cluster_sectors(), 512);
    }

    #[test]
    fn mount_label_formatting() {
        let mut params = MountParams::default();
        assert_eq!(params.mount_data(), None);

        params.label = Some(String::new());
        assert_eq!(params.mount_data(), None);

        params.label = Some("system_u:object_r:svirt_sandbox_file_t:s0:c1,c2".to_string());
        assert_eq!(
            params.mount_data().unwrap(),
            "context=\"system_u:object_r:svirt_sandbox_file_t:s0:c1,c2\""
        );
    }
}
