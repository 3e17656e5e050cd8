//! Filesystem helpers for layer directories.

pub mod copy;
pub mod values;

pub use copy::{copy_dir_files, copy_file, hardlink_prefixed};
pub use values::{has_value, read_value, remove_value, write_value};
