//! Reference-counted mounting of layer images.
//!
//! Every tracked layer owns a slot holding its [`MountRecord`]. The slot
//! table lock is only held long enough to find or insert a slot; the slot's
//! own mutex is held across the whole decision and the native call, so
//! Get/Put on the same layer are serialized while unrelated layers proceed
//! in parallel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use ploop_common::paths::SNAPSHOT_MARKER;
use ploop_common::{DriverPaths, PloopError, PloopResult};

use crate::fsutil;
use crate::image::{ImageBackend, MountParams};

/// A mounted layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    /// Outstanding holders; always at least one while tracked.
    pub count: usize,
    /// Block device serving the mount.
    pub device: String,
    /// Whether the layer was mounted read-only.
    pub read_only: bool,
}

type Slot = Arc<Mutex<Option<MountRecord>>>;

/// Tracks mounted layers and their holders.
pub struct MountManager {
    backend: Arc<dyn ImageBackend>,
    paths: DriverPaths,
    slots: DashMap<String, Slot>,
}

impl MountManager {
    /// Create an empty mount manager.
    pub fn new(backend: Arc<dyn ImageBackend>, paths: DriverPaths) -> Self {
        Self {
            backend,
            paths,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, id: &str) -> Slot {
        self.slots.entry(id.to_string()).or_default().clone()
    }

    /// Drop the slot of `id` from the table if it is empty and nobody else
    /// holds it.
    ///
    /// Callers only reach a slot through the table, so with the table shard
    /// locked a strong count of two (table + caller) means no one is waiting.
    /// A Get that ran after the caller unlocked may have refilled the slot,
    /// which then stays.
    fn release_slot(&self, id: &str, slot: &Slot) {
        self.slots.remove_if(id, |_, held| {
            Arc::ptr_eq(held, slot)
                && Arc::strong_count(held) == 2
                && held.try_lock().is_some_and(|record| record.is_none())
        });
    }

    /// Mount layer `id` (or join an existing mount) and return its mount point.
    pub fn get(&self, id: &str, mount_label: &str) -> PloopResult<PathBuf> {
        let mount_point = self.paths.mount_point(id);
        let slot = self.slot(id);
        let mut record = slot.lock();

        if let Some(existing) = record.as_mut() {
            existing.count += 1;
            tracing::debug!(layer_id = id, count = existing.count, "Layer already mounted");
            return Ok(mount_point);
        }

        let mounted = self.mount(id, mount_label, &mount_point);
        match mounted {
            Ok(new_record) => {
                tracing::debug!(
                    layer_id = id,
                    device = %new_record.device,
                    read_only = new_record.read_only,
                    "Layer mounted"
                );
                *record = Some(new_record);
                Ok(mount_point)
            }
            Err(e) => {
                drop(record);
                self.release_slot(id, &slot);
                Err(e)
            }
        }
    }

    fn mount(&self, id: &str, mount_label: &str, mount_point: &Path) -> PloopResult<MountRecord> {
        let mut image = self.backend.open(&self.paths.descriptor(id))?;

        // A layer children were cloned from must not change underneath them.
        let read_only = fsutil::has_value(&self.paths.layer(id), SNAPSHOT_MARKER);

        let params = MountParams {
            target: mount_point.to_path_buf(),
            read_only,
            label: (!mount_label.is_empty()).then(|| mount_label.to_string()),
        };

        let mounted = image.mount(&params);
        let closed = image.close();
        let device = mounted?;
        closed?;

        Ok(MountRecord {
            count: 1,
            device,
            read_only,
        })
    }

    /// Release one hold on layer `id`, unmounting it when the last hold goes.
    ///
    /// Releasing a layer that is not mounted is not an error. If the native
    /// unmount fails the record is still dropped and
    /// [`PloopError::UnmountFailed`] is returned.
    pub fn put(&self, id: &str) -> PloopResult<()> {
        let slot = self.slot(id);
        let mut record = slot.lock();

        if let Some(existing) = record.as_mut()
            && existing.count > 1
        {
            existing.count -= 1;
            tracing::debug!(layer_id = id, count = existing.count, "Layer still held");
            return Ok(());
        }

        let tracked = record.take();
        let unmounted = self.unmount(id);
        drop(record);
        self.release_slot(id, &slot);

        match unmounted {
            Ok(()) => {
                tracing::debug!(layer_id = id, tracked = tracked.is_some(), "Layer unmounted");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(layer_id = id, error = %e, "Unmount failed, dropping mount record");
                Err(PloopError::UnmountFailed {
                    id: id.to_string(),
                    source: Box::new(e),
                })
            }
        }
    }

    fn unmount(&self, id: &str) -> PloopResult<()> {
        let descriptor = self.paths.descriptor(id);
        let mut image = match self.backend.open(&descriptor) {
            Ok(image) => image,
            // No image, nothing to unmount.
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        let unmounted = image.unmount();
        let closed = image.close();
        match unmounted {
            Ok(()) => {}
            Err(e) if e.is_not_mounted() => {}
            Err(e) => return Err(e),
        }
        closed
    }

    /// Whether layer `id` has a mount record.
    pub fn is_tracked(&self, id: &str) -> bool {
        self.ref_count(id) > 0
    }

    /// Number of holders of layer `id`.
    pub fn ref_count(&self, id: &str) -> usize {
        let Some(slot) = self.slots.get(id).map(|slot| Arc::clone(&slot)) else {
            return 0;
        };
        slot.lock().as_ref().map_or(0, |record| record.count)
    }

    /// Record of layer `id`, if mounted.
    pub fn record(&self, id: &str) -> Option<MountRecord> {
        let slot = self.slots.get(id).map(|slot| Arc::clone(&slot))?;
        slot.lock().clone()
    }

    /// All tracked mounts, sorted by layer ID.
    pub fn tracked(&self) -> Vec<(String, MountRecord)> {
        let mut tracked: Vec<_> = self
            .snapshot_slots()
            .into_iter()
            .filter_map(|(id, slot)| {
                let record = slot.lock().clone();
                record.map(|record| (id, record))
            })
            .collect();
        tracked.sort_by(|a, b| a.0.cmp(&b.0));
        tracked
    }

    /// Unmount and forget layer `id` regardless of how many holders it has.
    ///
    /// Returns whether a record was released. If neither the descriptor nor
    /// the device can be unmounted, the record is kept and the error returned.
    pub fn force_release(&self, id: &str) -> PloopResult<bool> {
        let slot = self.slot(id);
        let mut record = slot.lock();

        let released = match record.as_ref() {
            Some(tracked) => {
                self.detach(id, tracked)?;
                *record = None;
                true
            }
            None => false,
        };

        drop(record);
        self.release_slot(id, &slot);
        Ok(released)
    }

    /// Unmount and forget every tracked layer regardless of holders.
    ///
    /// Failures are logged and every record is dropped either way. Returns
    /// the number of records released.
    pub fn force_release_all(&self) -> usize {
        self.snapshot_slots()
            .into_iter()
            .filter(|(id, slot)| {
                let mut record = slot.lock();
                let tracked = record.take();

                if let Some(tracked) = &tracked
                    && let Err(e) = self.detach(id, tracked)
                {
                    tracing::warn!(
                        layer_id = id.as_str(),
                        device = %tracked.device,
                        error = %e,
                        "Dropping record of a layer that stays mounted"
                    );
                }

                drop(record);
                self.release_slot(id, slot);
                tracked.is_some()
            })
            .count()
    }

    /// Unmount a tracked layer through its descriptor, falling back to its device.
    fn detach(&self, id: &str, tracked: &MountRecord) -> PloopResult<()> {
        tracing::warn!(
            layer_id = id,
            count = tracked.count,
            device = %tracked.device,
            "Force unmounting layer"
        );

        let Err(e) = self.unmount(id) else {
            return Ok(());
        };
        tracing::warn!(layer_id = id, error = %e, "Unmount by descriptor failed, detaching device");

        match self.backend.force_unmount(&tracked.device) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_mounted() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Clone out the slot table so no table lock is held while locking slots.
    fn snapshot_slots(&self) -> Vec<(String, Slot)> {
        self.slots
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }
}
