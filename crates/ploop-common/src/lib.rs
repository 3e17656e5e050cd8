//! # ploop-common
//!
//! Shared types for the ploop layering driver.
//!
//! This crate provides:
//! - The driver error taxonomy
//! - The on-disk layout of the driver home
//! - Layer ID validation
//! - Human-readable size parsing

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;
pub mod size;

pub use error::{PloopError, PloopResult};
pub use id::LayerId;
pub use paths::DriverPaths;
pub use size::ByteSize;
