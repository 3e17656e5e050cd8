//! In-memory image backend for tests.
//!
//! Creates real descriptor and delta files so the driver's directory work
//! can be checked, and tracks mounts and snapshots in shared state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use ploop_common::paths::{DESCRIPTOR_FILE, IMAGE_PREFIX};
use ploop_common::{PloopError, PloopResult};

use super::{CreateParams, DiskImage, ImageBackend, MountParams};

/// File dropped into a mount point while the fake image is mounted.
pub const MOUNTED_FILE: &str = "fake-mounted";

#[derive(Debug, Clone)]
pub struct FakeMount {
    pub device: String,
    pub target: PathBuf,
    pub read_only: bool,
    pub label: Option<String>,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub creates: Vec<CreateParams>,
    pub mounts: HashMap<PathBuf, FakeMount>,
    pub mount_calls: usize,
    pub unmount_calls: usize,
    pub snapshots: Vec<(PathBuf, String)>,
    pub switches: Vec<(PathBuf, String)>,
    pub forced: Vec<String>,
    pub verbosity: Option<i32>,
    pub fail_create: bool,
    pub fail_unmount: bool,
    pub fail_force_unmount: bool,
    next_device: u32,
}

#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount_of(&self, descriptor: &Path) -> Option<FakeMount> {
        self.state.lock().mounts.get(descriptor).cloned()
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().snapshots.len()
    }
}

impl ImageBackend for FakeBackend {
    fn create(&self, params: &CreateParams) -> PloopResult<()> {
        let mut state = self.state.lock();
        if state.fail_create {
            return Err(PloopError::Native {
                operation: "init".to_string(),
                code: Some(24),
                message: "mkfs.ext4 not found".to_string(),
            });
        }

        let dir = params.image.parent().ok_or_else(|| PloopError::Internal {
            message: "image without directory".to_string(),
        })?;
        std::fs::create_dir_all(dir)?;
        std::fs::write(
            dir.join(DESCRIPTOR_FILE),
            format!("size={}K mode={}\n", params.size.as_kibibytes(), params.mode),
        )?;
        std::fs::write(&params.image, b"base delta")?;

        state.creates.push(params.clone());
        Ok(())
    }

    fn open(&self, descriptor: &Path) -> PloopResult<Box<dyn DiskImage>> {
        std::fs::metadata(descriptor)?;
        Ok(Box::new(FakeImage {
            descriptor: descriptor.to_path_buf(),
            state: Arc::clone(&self.state),
        }))
    }

    fn force_unmount(&self, device: &str) -> PloopResult<()> {
        let mut state = self.state.lock();
        if state.fail_force_unmount {
            return Err(PloopError::Native {
                operation: "umount".to_string(),
                code: Some(22),
                message: format!("device {device} is busy"),
            });
        }

        let descriptor = state
            .mounts
            .iter()
            .find(|(_, mount)| mount.device == device)
            .map(|(descriptor, _)| descriptor.clone())
            .ok_or_else(|| PloopError::NotMounted {
                target: device.to_string(),
            })?;

        if let Some(mount) = state.mounts.remove(&descriptor) {
            let _ = std::fs::remove_file(mount.target.join(MOUNTED_FILE));
        }
        state.forced.push(device.to_string());
        Ok(())
    }

    fn set_verbosity(&self, level: i32) {
        self.state.lock().verbosity = Some(level);
    }
}

struct FakeImage {
    descriptor: PathBuf,
    state: Arc<Mutex<FakeState>>,
}

impl FakeImage {
    fn dir(&self) -> &Path {
        self.descriptor.parent().unwrap_or_else(|| Path::new("."))
    }
}

impl DiskImage for FakeImage {
    fn mount(&mut self, params: &MountParams) -> PloopResult<String> {
        let mut state = self.state.lock();
        state.mount_calls += 1;
        if state.mounts.contains_key(&self.descriptor) {
            return Err(PloopError::Native {
                operation: "mount".to_string(),
                code: Some(17),
                message: "image is already mounted".to_string(),
            });
        }

        state.next_device += 1;
        let device = format!("/dev/ploop{}", 1000 + state.next_device);
        std::fs::write(params.target.join(MOUNTED_FILE), &device)?;
        state.mounts.insert(
            self.descriptor.clone(),
            FakeMount {
                device: device.clone(),
                target: params.target.clone(),
                read_only: params.read_only,
                label: params.label.clone(),
            },
        );
        Ok(device)
    }

    fn unmount(&mut self) -> PloopResult<()> {
        let mut state = self.state.lock();
        state.unmount_calls += 1;
        if state.fail_unmount {
            return Err(PloopError::Native {
                operation: "umount".to_string(),
                code: Some(22),
                message: "target is busy".to_string(),
            });
        }

        let mount = state
            .mounts
            .remove(&self.descriptor)
            .ok_or_else(|| PloopError::NotMounted {
                target: self.descriptor.display().to_string(),
            })?;
        let _ = std::fs::remove_file(mount.target.join(MOUNTED_FILE));
        Ok(())
    }

    fn snapshot(&mut self) -> PloopResult<String> {
        let uuid = format!("{{{}}}", uuid::Uuid::new_v4());
        std::fs::write(self.dir().join(format!("{IMAGE_PREFIX}.{uuid}")), b"top delta")?;

        let mut descriptor = std::fs::read_to_string(&self.descriptor)?;
        descriptor.push_str(&format!("snapshot={uuid}\n"));
        std::fs::write(&self.descriptor, descriptor)?;

        self.state
            .lock()
            .snapshots
            .push((self.descriptor.clone(), uuid.clone()));
        Ok(uuid)
    }

    fn switch_snapshot(&mut self, uuid: &str) -> PloopResult<()> {
        let descriptor = std::fs::read_to_string(&self.descriptor)?;
        if !descriptor.contains(&format!("snapshot={uuid}")) {
            return Err(PloopError::Native {
                operation: "snapshot-switch".to_string(),
                code: Some(38),
                message: format!("no snapshot {uuid}"),
            });
        }

        std::fs::write(&self.descriptor, format!("{descriptor}active={uuid}\n"))?;
        self.state
            .lock()
            .switches
            .push((self.descriptor.clone(), uuid.to_string()));
        Ok(())
    }

    fn is_mounted(&self) -> PloopResult<bool> {
        Ok(self.state.lock().mounts.contains_key(&self.descriptor))
    }

    fn close(self: Box<Self>) -> PloopResult<()> {
        Ok(())
    }
}
