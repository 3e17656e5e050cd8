//! Common error types for the ploop driver.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`PloopError`].
pub type PloopResult<T> = Result<T, PloopError>;

/// Errors raised by the layering driver and its image backend.
#[derive(Error, Diagnostic, Debug)]
pub enum PloopError {
    /// Layer not found.
    #[error("Layer not found: {id}")]
    #[diagnostic(code(ploop::layer::not_found))]
    LayerNotFound {
        /// The layer ID that was not found.
        id: String,
    },

    /// A layer directory already exists for this ID.
    #[error("Layer already exists: {id}")]
    #[diagnostic(
        code(ploop::layer::exists),
        help("Layer IDs are assigned by the caller and must be unique")
    )]
    LayerExists {
        /// The conflicting layer ID.
        id: String,
    },

    /// Invalid layer ID format.
    #[error("Invalid layer ID: {id:?}")]
    #[diagnostic(
        code(ploop::layer::invalid_id),
        help("Layer IDs must be a single path component and cannot be 'master' or 'mnt'")
    )]
    InvalidLayerId {
        /// The invalid layer ID.
        id: String,
    },

    /// Option string without a `key=value` shape.
    #[error("Unable to parse option {option:?}: expected key=value")]
    #[diagnostic(code(ploop::config::malformed))]
    MalformedOption {
        /// The raw option string.
        option: String,
    },

    /// Option key the driver does not know.
    #[error("Unknown option {key}")]
    #[diagnostic(
        code(ploop::config::unknown),
        help("Recognized options: ploop.size, ploop.mode, ploop.clog, ploop.libdebug")
    )]
    UnknownOption {
        /// The unrecognized key.
        key: String,
    },

    /// Recognized option with an unusable value.
    #[error("Bad value for {key}: {value} ({reason})")]
    #[diagnostic(code(ploop::config::invalid))]
    InvalidOption {
        /// Option key.
        key: String,
        /// Offending value.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// Invalid human-readable size.
    #[error("Invalid size: {value}")]
    #[diagnostic(
        code(ploop::size::invalid),
        help("Use formats like '512m', '10G', '1.5GiB' or a plain byte count")
    )]
    InvalidSize {
        /// The invalid value.
        value: String,
    },

    /// The master template image could not be created.
    #[error("Failed to create master template image")]
    #[diagnostic(
        code(ploop::template::create),
        help(
            "The driver home must be on ext4 and the ploop utilities (ploop, mkfs.ext4, resize2fs) must be installed"
        )
    )]
    TemplateCreate {
        /// Underlying failure.
        #[source]
        source: Box<PloopError>,
    },

    /// Native ploop operation failed.
    #[error("ploop {operation} failed{}: {message}", exit_suffix(.code))]
    #[diagnostic(code(ploop::native))]
    Native {
        /// Native operation (init, mount, umount, ...).
        operation: String,
        /// Exit code reported by the native subsystem, if any.
        code: Option<i32>,
        /// Diagnostic output.
        message: String,
    },

    /// The image is not mounted.
    #[error("Image is not mounted: {target}")]
    #[diagnostic(code(ploop::native::not_mounted))]
    NotMounted {
        /// Descriptor or device that was not mounted.
        target: String,
    },

    /// The layer is still tracked as mounted after forced release attempts.
    #[error("Layer {id} is still mounted after {attempts} forced release attempts")]
    #[diagnostic(
        code(ploop::mount::busy),
        help("Something still holds the mount; check for processes using the mount point")
    )]
    StillMounted {
        /// Layer ID.
        id: String,
        /// Number of release attempts made.
        attempts: usize,
    },

    /// Native unmount failed; the mount record was released anyway.
    #[error("Unmount of layer {id} failed, mount record released")]
    #[diagnostic(
        code(ploop::mount::unmount_failed),
        help("The device may still be attached; run `ploopctl cleanup` or `ploop umount` manually")
    )]
    UnmountFailed {
        /// Layer ID.
        id: String,
        /// Underlying failure.
        #[source]
        source: Box<PloopError>,
    },

    /// A per-layer operation failed.
    #[error("{operation} {id}: {source}")]
    #[diagnostic(code(ploop::layer))]
    Layer {
        /// Layer ID.
        id: String,
        /// Driver operation (create, remove, get, ...).
        operation: &'static str,
        /// Underlying failure.
        #[source]
        source: Box<PloopError>,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(ploop::io))]
    Io(#[from] std::io::Error),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(ploop::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

fn exit_suffix(code: &Option<i32>) -> String {
    code.map(|c| format!(" (exit {c})")).unwrap_or_default()
}

impl PloopError {
    /// Attach layer and operation context.
    ///
    /// Errors that already name their layer are returned unchanged.
    #[must_use]
    pub fn for_layer(self, id: &str, operation: &'static str) -> Self {
        match self {
            Self::LayerNotFound { .. }
            | Self::LayerExists { .. }
            | Self::InvalidLayerId { .. }
            | Self::StillMounted { .. }
            | Self::UnmountFailed { .. }
            | Self::Layer { .. } => self,
            other => Self::Layer {
                id: id.to_string(),
                operation,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through [`PloopError::Layer`] context.
    #[must_use]
    pub fn inner(&self) -> &Self {
        match self {
            Self::Layer { source, .. } => source.inner(),
            other => other,
        }
    }

    /// Whether this error means "the image was not mounted".
    #[must_use]
    pub fn is_not_mounted(&self) -> bool {
        matches!(self.inner(), Self::NotMounted { .. })
    }

    /// Whether this is an I/O "not found" error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self.inner(), Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = PloopError::LayerNotFound {
            id: "abc123".to_string(),
        };
        assert_eq!(err.to_string(), "Layer not found: abc123");
    }

    #[test]
    fn native_display_includes_exit_code() {
        let err = PloopError::Native {
            operation: "mount".to_string(),
            code: Some(21),
            message: "mount failed".to_string(),
        };
        assert_eq!(err.to_string(), "ploop mount failed (exit 21): mount failed");
    }

    #[test]
    fn layer_context_is_transparent_to_classifiers() {
        let err = PloopError::NotMounted {
            target: "/x/DiskDescriptor.xml".to_string(),
        }
        .for_layer("L1", "put");
        assert!(err.is_not_mounted());
        assert_eq!(err.to_string(), "put L1: Image is not mounted: /x/DiskDescriptor.xml");
    }

    #[test]
    fn layer_context_is_not_doubled() {
        let err = PloopError::LayerExists {
            id: "L1".to_string(),
        }
        .for_layer("L1", "create");
        assert!(matches!(err, PloopError::LayerExists { .. }));

        let err = PloopError::Internal {
            message: "boom".to_string(),
        }
        .for_layer("L1", "get")
        .for_layer("L1", "get");
        assert_eq!(err.to_string(), "get L1: Internal error: boom");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PloopError = io_err.into();
        assert!(matches!(err, PloopError::Io(_)));
        assert!(err.is_not_found());
    }
}
