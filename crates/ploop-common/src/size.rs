//! Human-readable byte sizes.
//!
//! Sizes use binary multipliers regardless of spelling, so "1G", "1g",
//! "1GB" and "1GiB" all mean 1024^3 bytes. Fractions are allowed ("1.5G").

use std::fmt;
use std::str::FromStr;

use crate::error::{PloopError, PloopResult};

const KI: u64 = 1024;

/// Binary unit suffixes used when formatting, smallest first.
const BINARY_ABBRS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

/// A size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Create a size from bytes.
    #[must_use]
    pub const fn bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create a size from gibibytes.
    #[must_use]
    pub const fn gibibytes(gib: u64) -> Self {
        Self(gib * KI * KI * KI)
    }

    /// Size in bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Size in whole kibibytes (truncated).
    #[must_use]
    pub const fn as_kibibytes(&self) -> u64 {
        self.0 / KI
    }

    /// Parse a size string.
    ///
    /// Formats:
    /// - "1024" -> 1024 bytes
    /// - "10k", "10K", "10kb", "10KiB" -> 10 * 1024 bytes
    /// - "1.5G" -> 1.5 * 1024^3 bytes
    /// - "2 T" -> 2 * 1024^4 bytes
    pub fn parse(s: &str) -> PloopResult<Self> {
        let invalid = || PloopError::InvalidSize {
            value: s.to_string(),
        };

        let trimmed = s.trim();

        // Strip an optional "b"/"ib" tail, then an optional unit letter.
        let mut rest = trimmed;
        let mut binary_marker = false;
        if let Some(stripped) = rest.strip_suffix(['b', 'B']) {
            rest = stripped;
            if let Some(stripped) = rest.strip_suffix(['i', 'I']) {
                rest = stripped;
                binary_marker = true;
            }
        }

        let exponent = match rest.chars().last() {
            Some('k' | 'K') => 1,
            Some('m' | 'M') => 2,
            Some('g' | 'G') => 3,
            Some('t' | 'T') => 4,
            Some('p' | 'P') => 5,
            _ => 0,
        };
        if exponent > 0 {
            rest = &rest[..rest.len() - 1];
        } else if binary_marker {
            return Err(invalid());
        }

        let number = rest.trim_end();
        if number.is_empty() || !number.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(invalid());
        }

        let multiplier = KI.pow(exponent);
        if let Ok(whole) = number.parse::<u64>() {
            return whole.checked_mul(multiplier).map(Self).ok_or_else(invalid);
        }

        let value: f64 = number.parse().map_err(|_| invalid())?;
        let bytes = value * multiplier as f64;
        if !bytes.is_finite() || bytes >= u64::MAX as f64 {
            return Err(invalid());
        }

        Ok(Self(bytes as u64))
    }
}

/// Format a byte count with binary units and four significant digits
/// ("8 GiB", "1.5 GiB", "976.6 KiB").
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < BINARY_ABBRS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let digits = if value < 1.0 {
        1
    } else {
        value.log10().floor() as usize + 1
    };
    let decimals = 4usize.saturating_sub(digits);

    let mut formatted = format!("{value:.decimals$}");
    if formatted.contains('.') {
        formatted = formatted
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string();
    }

    format!("{formatted} {}", BINARY_ABBRS[unit])
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_bytes(self.0))
    }
}

impl FromStr for ByteSize {
    type Err = PloopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_plain_bytes() {
        assert_eq!(ByteSize::parse("1024").unwrap().as_bytes(), 1024);
        assert_eq!(ByteSize::parse("0").unwrap().as_bytes(), 0);
    }

    #[test]
    fn parse_binary_suffixes() {
        assert_eq!(ByteSize::parse("1k").unwrap().as_bytes(), 1024);
        assert_eq!(ByteSize::parse("1K").unwrap().as_bytes(), 1024);
        assert_eq!(ByteSize::parse("10m").unwrap().as_bytes(), 10 * 1024 * 1024);
        assert_eq!(ByteSize::parse("1G").unwrap(), ByteSize::gibibytes(1));
        assert_eq!(ByteSize::parse("1GB").unwrap(), ByteSize::gibibytes(1));
        assert_eq!(ByteSize::parse("1GiB").unwrap(), ByteSize::gibibytes(1));
        assert_eq!(ByteSize::parse("2 t").unwrap().as_bytes(), 2 * KI.pow(4));
        assert_eq!(ByteSize::parse("1p").unwrap().as_bytes(), KI.pow(5));
    }

    #[test]
    fn parse_fractions() {
        assert_eq!(
            ByteSize::parse("1.5G").unwrap().as_bytes(),
            3 * 512 * 1024 * 1024
        );
        assert_eq!(ByteSize::parse("0.5k").unwrap().as_bytes(), 512);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(ByteSize::parse("").is_err());
        assert!(ByteSize::parse("G").is_err());
        assert!(ByteSize::parse("-1G").is_err());
        assert!(ByteSize::parse("10X").is_err());
        assert!(ByteSize::parse("1iB").is_err());
        assert!(ByteSize::parse("1.2.3G").is_err());
        assert!(ByteSize::parse("99999999999P").is_err());
    }

    #[test]
    fn display_binary_units() {
        assert_eq!(ByteSize::gibibytes(8).to_string(), "8 GiB");
        assert_eq!(ByteSize::gibibytes(1).to_string(), "1 GiB");
        assert_eq!(ByteSize::bytes(3 * 512 * 1024 * 1024).to_string(), "1.5 GiB");
        assert_eq!(ByteSize::bytes(1_000_000).to_string(), "976.6 KiB");
        assert_eq!(ByteSize::bytes(500).to_string(), "500 B");
        assert_eq!(ByteSize::bytes(0).to_string(), "0 B");
    }

    proptest! {
        #[test]
        fn whole_binary_units_survive_display(n in 1u64..1000, unit in 0u32..5) {
            let size = ByteSize::bytes(n * KI.pow(unit));
            prop_assert_eq!(ByteSize::parse(&size.to_string().replace(' ', "")).unwrap(), size);
        }
    }
}
