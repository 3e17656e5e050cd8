//! # ploop-driver
//!
//! A copy-on-write container layer driver built on ploop virtual disk images.
//!
//! ## Features
//!
//! - **Fast fresh layers**: new layers are plain copies of a pre-formatted master template
//! - **Zero-copy clones**: children hardlink their parent's deltas and share one snapshot
//! - **Reference-counted mounts**: nested Get/Put share one mount, locked per layer
//!
//! ## Usage
//!
//! ```no_run
//! use ploop_driver::Driver;
//!
//! # fn example() -> ploop_common::PloopResult<()> {
//! let driver = Driver::init("/var/lib/ploop", ["ploop.size=10G"])?;
//!
//! driver.create("base", None)?;
//! driver.create("app", Some("base"))?;
//!
//! let rootfs = driver.get("app", "")?;
//! println!("app mounted at {}", rootfs.display());
//! driver.put("app")?;
//!
//! driver.cleanup();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod driver;
pub mod fsutil;
pub mod image;

pub use config::DriverOptions;
pub use driver::Driver;
