//! Small key files stored inside a layer directory.
//!
//! Each value is a file named after its key. Writes are create-exclusive: a
//! value, once written, is only ever replaced by removing it first.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use ploop_common::PloopResult;

/// Write `value` under `key`, failing with `AlreadyExists` if it is already set.
pub fn write_value(dir: &Path, key: &str, value: &str) -> PloopResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(dir.join(key))?;

    file.write_all(value.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Read the value under `key`, or `None` if it was never written.
pub fn read_value(dir: &Path, key: &str) -> PloopResult<Option<String>> {
    match std::fs::read_to_string(dir.join(key)) {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove the value under `key`.
pub fn remove_value(dir: &Path, key: &str) -> PloopResult<()> {
    std::fs::remove_file(dir.join(key))?;
    Ok(())
}

/// Whether a value is stored under `key`.
///
/// Errors other than "not found" are logged and reported as absent.
pub fn has_value(dir: &Path, key: &str) -> bool {
    match std::fs::symlink_metadata(dir.join(key)) {
        Ok(_) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), key, error = %e, "Unexpected error checking value");
            false
        }
    }
}
