//! Driver options.
//!
//! Options arrive as a flat list of `key=value` strings, the same shape a
//! container engine passes as storage options. Keys are case-insensitive and
//! may carry a `ploop.` prefix.

use ploop_common::{ByteSize, PloopError, PloopResult};

use crate::image::ImageMode;

/// Smallest and largest accepted cluster block log.
const CLUSTER_LOG_RANGE: std::ops::RangeInclusive<u8> = 6..=16;

/// Parsed driver options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverOptions {
    /// Capacity of every new image.
    pub size: ByteSize,
    /// Allocation strategy of new images.
    pub mode: ImageMode,
    /// Cluster block size exponent (9 is 256K clusters, 11 is 1M).
    pub cluster_log: u8,
    /// Native ploop verbosity, if requested.
    pub lib_debug: Option<i32>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            size: ByteSize::gibibytes(8),
            mode: ImageMode::Expanded,
            cluster_log: 9,
            lib_debug: None,
        }
    }
}

impl DriverOptions {
    /// Parse a list of `key=value` options on top of the defaults.
    pub fn parse<I, S>(options: I) -> PloopResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Self::default();

        for option in options {
            let (key, value) = split_option(option.as_ref())?;
            let key = key.to_ascii_lowercase();
            let name = key.strip_prefix("ploop.").unwrap_or(&key);

            match name {
                "size" => parsed.size = parse_size(&key, value)?,
                "mode" => {
                    parsed.mode = value.parse().map_err(|_| invalid(&key, value, "unknown mode"))?;
                }
                "clog" => {
                    parsed.cluster_log = value
                        .parse::<u8>()
                        .ok()
                        .filter(|clog| CLUSTER_LOG_RANGE.contains(clog))
                        .ok_or_else(|| invalid(&key, value, "expected an integer from 6 to 16"))?;
                }
                "libdebug" => {
                    parsed.lib_debug = Some(
                        value
                            .parse()
                            .map_err(|_| invalid(&key, value, "expected an integer"))?,
                    );
                }
                _ => return Err(PloopError::UnknownOption { key: key.clone() }),
            }
        }

        Ok(parsed)
    }
}

fn split_option(option: &str) -> PloopResult<(&str, &str)> {
    let (key, value) = option
        .split_once('=')
        .ok_or_else(|| PloopError::MalformedOption {
            option: option.to_string(),
        })?;

    let key = key.trim();
    if key.is_empty() {
        return Err(PloopError::MalformedOption {
            option: option.to_string(),
        });
    }

    Ok((key, value.trim()))
}

fn parse_size(key: &str, value: &str) -> PloopResult<ByteSize> {
    let size = ByteSize::parse(value).map_err(|_| invalid(key, value, "not a size"))?;
    if size.as_kibibytes() == 0 {
        return Err(invalid(key, value, "must be at least 1K"));
    }
    Ok(size)
}

fn invalid(key: &str, value: &str, reason: &str) -> PloopError {
    PloopError::InvalidOption {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
