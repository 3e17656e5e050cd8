//! Layer ID validation.

use std::fmt;
use std::str::FromStr;

use crate::error::{PloopError, PloopResult};
use crate::paths::{MASTER_DIR, MOUNTS_DIR};

/// A validated layer ID.
///
/// Layer IDs are opaque strings chosen by the layer store. The driver only
/// requires that an ID can name a single directory under its home without
/// colliding with the reserved `master` and `mnt` entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayerId(String);

impl LayerId {
    /// Maximum length of a layer ID (a single filename component).
    pub const MAX_LENGTH: usize = 255;

    /// Create a new layer ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID cannot be used as a layer directory name.
    pub fn new(id: impl Into<String>) -> PloopResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Get the layer ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> PloopResult<()> {
        let invalid = id.is_empty()
            || id.len() > Self::MAX_LENGTH
            || id == "."
            || id == ".."
            || id == MASTER_DIR
            || id == MOUNTS_DIR
            || id.contains(['/', '\0']);

        if invalid {
            return Err(PloopError::InvalidLayerId { id: id.to_string() });
        }

        Ok(())
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LayerId {
    type Err = PloopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for LayerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
