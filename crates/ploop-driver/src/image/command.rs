//! Image backend driving the `ploop` command-line utility.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use parking_lot::Mutex;
use ploop_common::paths::IMAGE_PREFIX;
use ploop_common::{PloopError, PloopResult};

use super::{CreateParams, DiskImage, ImageBackend, MountParams};

/// Exit status ploop uses for "device is not mounted" (`SYSEXIT_DEV_NOT_MOUNTED`).
pub const EXIT_DEV_NOT_MOUNTED: i32 = 40;

/// Filesystem created inside new images.
const IMAGE_FSTYPE: &str = "ext4";

/// Where the kernel lists block devices.
const SYSFS_BLOCK: &str = "/sys/block";

/// Backend that shells out to `ploop`.
#[derive(Debug, Clone)]
pub struct PloopCli {
    /// Path or name of the ploop binary.
    binary: PathBuf,
    /// Directory listing block devices (normally `/sys/block`).
    sysfs_block: PathBuf,
    /// Verbosity passed as `-v`, shared with every open image.
    verbosity: Arc<Mutex<Option<i32>>>,
}

impl Default for PloopCli {
    fn default() -> Self {
        Self::new("ploop")
    }
}

impl PloopCli {
    /// Create a backend using the given ploop binary.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            sysfs_block: PathBuf::from(SYSFS_BLOCK),
            verbosity: Arc::new(Mutex::new(None)),
        }
    }

    /// Use a different block device listing (for tests and chroots).
    #[must_use]
    pub fn with_sysfs_block(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sysfs_block = dir.into();
        self
    }

    fn run<I, S>(&self, operation: &str, target: &str, args: I) -> PloopResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.binary);
        if let Some(level) = *self.verbosity.lock() {
            command.arg("-v").arg(level.to_string());
        }
        command.arg(operation).args(args);

        tracing::debug!(?command, "Running ploop");

        let output = command.output().map_err(|e| PloopError::Native {
            operation: operation.to_string(),
            code: None,
            message: format!("failed to execute {}: {}", self.binary.display(), e),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let code = output.status.code();
        if code == Some(EXIT_DEV_NOT_MOUNTED) {
            return Err(PloopError::NotMounted {
                target: target.to_string(),
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };

        Err(PloopError::Native {
            operation: operation.to_string(),
            code,
            message,
        })
    }

    /// Find the ploop device whose base delta is `image`.
    ///
    /// The kernel exposes each attached delta under
    /// `/sys/block/ploopN/pdelta/<level>/image`; level 0 is the base.
    pub fn find_device(&self, image: &Path) -> PloopResult<Option<String>> {
        let entries = match std::fs::read_dir(&self.sysfs_block) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with("ploop") {
                continue;
            }

            let Ok(base) = std::fs::read_to_string(entry.path().join("pdelta/0/image")) else {
                continue;
            };
            if Path::new(base.trim()) == image {
                return Ok(Some(format!("/dev/{name}")));
            }
        }

        Ok(None)
    }
}

impl ImageBackend for PloopCli {
    fn create(&self, params: &CreateParams) -> PloopResult<()> {
        tracing::debug!(
            image = %params.image.display(),
            size = %params.size,
            mode = %params.mode,
            cluster_log = params.cluster_log,
            "Creating ploop image"
        );

        let args: Vec<OsString> = vec![
            "-s".into(),
            format!("{}K", params.size.as_kibibytes()).into(),
            "-f".into(),
            params.mode.as_str().into(),
            "-t".into(),
            IMAGE_FSTYPE.into(),
            "-b".into(),
            params.cluster_sectors().to_string().into(),
            params.image.clone().into(),
        ];

        self.run("init", &params.image.display().to_string(), args)?;
        Ok(())
    }

    fn open(&self, descriptor: &Path) -> PloopResult<Box<dyn DiskImage>> {
        // ploop itself would fail later with a less useful message.
        std::fs::metadata(descriptor)?;

        Ok(Box::new(PloopImage {
            descriptor: descriptor.to_path_buf(),
            cli: self.clone(),
        }))
    }

    fn force_unmount(&self, device: &str) -> PloopResult<()> {
        tracing::debug!(device, "Force unmounting ploop device");
        self.run("umount", device, ["-d", device])?;
        Ok(())
    }

    fn set_verbosity(&self, level: i32) {
        *self.verbosity.lock() = Some(level);
    }
}

/// An image opened through [`PloopCli`].
///
/// Every ploop invocation rewrites the descriptor itself, so there is no
/// in-memory state to commit on close.
#[derive(Debug)]
struct PloopImage {
    descriptor: PathBuf,
    cli: PloopCli,
}

impl PloopImage {
    fn target(&self) -> String {
        self.descriptor.display().to_string()
    }

    fn base_image(&self) -> PathBuf {
        self.descriptor
            .parent()
            .map_or_else(|| PathBuf::from(IMAGE_PREFIX), |dir| dir.join(IMAGE_PREFIX))
    }
}

impl DiskImage for PloopImage {
    fn mount(&mut self, params: &MountParams) -> PloopResult<String> {
        let mut args: Vec<OsString> = vec!["-m".into(), params.target.clone().into()];
        if params.read_only {
            args.push("-r".into());
        }
        if let Some(data) = params.mount_data() {
            args.push("-o".into());
            args.push(data.into());
        }
        args.push(self.descriptor.clone().into());

        let output = self.cli.run("mount", &self.target(), args)?;

        if let Some(device) = parse_device(&output) {
            return Ok(device);
        }

        // Older ploop builds are quiet on success; ask the kernel instead.
        self.cli
            .find_device(&self.base_image())?
            .ok_or_else(|| PloopError::Internal {
                message: format!("mounted {} but found no ploop device for it", self.target()),
            })
    }

    fn unmount(&mut self) -> PloopResult<()> {
        self.cli
            .run("umount", &self.target(), [self.descriptor.as_os_str()])?;
        Ok(())
    }

    fn snapshot(&mut self) -> PloopResult<String> {
        let uuid = format!("{{{}}}", uuid::Uuid::new_v4());
        self.cli.run(
            "snapshot",
            &self.target(),
            [OsStr::new("-u"), OsStr::new(&uuid), self.descriptor.as_os_str()],
        )?;
        Ok(uuid)
    }

    fn switch_snapshot(&mut self, uuid: &str) -> PloopResult<()> {
        self.cli.run(
            "snapshot-switch",
            &self.target(),
            [OsStr::new("-u"), OsStr::new(uuid), self.descriptor.as_os_str()],
        )?;
        Ok(())
    }

    fn is_mounted(&self) -> PloopResult<bool> {
        Ok(self.cli.find_device(&self.base_image())?.is_some())
    }

    fn close(self: Box<Self>) -> PloopResult<()> {
        Ok(())
    }
}

/// Extract the `/dev/ploopN` device from `ploop mount` output.
fn parse_device(output: &str) -> Option<String> {
    output.split_whitespace().find_map(|token| {
        let start = token.find("/dev/ploop")?;
        let device: String = token[start..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '/')
            .collect();
        Some(device)
    })
}
