//! Master template image.
//!
//! Formatting a fresh ploop image (sizing, cluster layout, mkfs) is slow, so
//! the driver does it once per start under `<home>/master` and gives every
//! parentless layer a plain file copy of the result.

use std::path::Path;
use std::sync::Arc;

use ploop_common::{DriverPaths, PloopError, PloopResult};

use crate::config::DriverOptions;
use crate::fsutil;
use crate::image::{CreateParams, ImageBackend};

/// Owner of the master template image.
pub struct MasterTemplate {
    backend: Arc<dyn ImageBackend>,
    paths: DriverPaths,
    params: CreateParams,
}

impl MasterTemplate {
    /// Describe the template for the given options. Nothing is created yet.
    pub fn new(backend: Arc<dyn ImageBackend>, paths: DriverPaths, options: &DriverOptions) -> Self {
        let params = CreateParams {
            image: paths.master_image(),
            size: options.size,
            mode: options.mode,
            cluster_log: options.cluster_log,
        };

        Self {
            backend,
            paths,
            params,
        }
    }

    /// Throw away any previous template and create a fresh one.
    ///
    /// Options may have changed since the last start, so the template is
    /// never reused.
    pub fn recreate(&self) -> PloopResult<()> {
        self.discard()?;

        tracing::debug!(
            path = %self.paths.master().display(),
            size = %self.params.size,
            mode = %self.params.mode,
            "Creating master template"
        );

        let master = self.paths.master();
        std::fs::create_dir_all(&master)?;
        if let Err(e) = self.backend.create(&self.params) {
            if let Err(cleanup) = std::fs::remove_dir_all(&master) {
                tracing::warn!(path = %master.display(), error = %cleanup, "Failed to remove partial master template");
            }
            return Err(PloopError::TemplateCreate {
                source: Box::new(e),
            });
        }

        tracing::info!(path = %self.paths.master().display(), "Master template created");
        Ok(())
    }

    /// Populate a new layer directory from the template.
    pub fn materialize(&self, layer_dir: &Path) -> PloopResult<()> {
        let copied = fsutil::copy_dir_files(&self.paths.master(), layer_dir)?;
        if copied == 0 {
            return Err(PloopError::Internal {
                message: format!(
                    "master template {} is empty",
                    self.paths.master().display()
                ),
            });
        }
        Ok(())
    }

    /// Unmount the template if something left it mounted, then delete it.
    pub fn discard(&self) -> PloopResult<()> {
        let descriptor = self.paths.master_descriptor();

        if descriptor.exists() {
            let mut image = self.backend.open(&descriptor)?;
            if image.is_mounted()? {
                tracing::warn!(path = %descriptor.display(), "Master template is mounted, unmounting");
                match image.unmount() {
                    Ok(()) => {}
                    Err(e) if e.is_not_mounted() => {}
                    Err(e) => return Err(e),
                }
            }
            image.close()?;
        }

        match std::fs::remove_dir_all(self.paths.master()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
