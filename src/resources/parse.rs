//! Operator-facing size and bandwidth string grammars.
//!
//! Byte sizes follow the common size-library convention: decimal prefixes
//! carry binary multipliers ("1GB" == 1024³ bytes). Bandwidth accepts a
//! bits-per-second family ("1Gbps", lowercase b) and a bytes-per-second
//! family (any byte size, optionally suffixed "/s" or "ps").

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid byte size {0:?}")]
    ByteSize(String),
    #[error("invalid bandwidth {0:?}")]
    Bandwidth(String),
    #[error("disk I/O limit must be a bytes-per-second value, got {0:?}")]
    BitsForDiskIo(String),
}

/// Parse a human byte-size string ("100GB", "50MiB", "1g", "4096") into bytes.
///
/// Case-insensitive; K/M/G/T all use binary multipliers regardless of an
/// `iB` spelling. Fractional values are floored after scaling.
pub fn parse_byte_size(input: &str) -> Result<u64, ParseError> {
    let s = input.trim().to_ascii_lowercase();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);

    let value: f64 = num
        .parse()
        .map_err(|_| ParseError::ByteSize(input.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ParseError::ByteSize(input.to_string()));
    }

    let multiplier: f64 = match unit.trim() {
        "" | "b" => 1.0,
        "k" | "kb" | "kib" => 1024.0,
        "m" | "mb" | "mib" => 1024.0 * 1024.0,
        "g" | "gb" | "gib" => 1024.0 * 1024.0 * 1024.0,
        "t" | "tb" | "tib" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return Err(ParseError::ByteSize(input.to_string())),
    };

    Ok((value * multiplier).floor() as u64)
}

/// Parse a bandwidth string into bytes per second.
///
/// A lowercase-`b` `bps` suffix selects the bits family with decimal
/// k/m/g prefixes ("1Gbps" → 125_000_000). Anything else is a byte size
/// with an optional "/s" or "ps" suffix ("125MB/s" → 125 × 1024²).
pub fn parse_bandwidth(input: &str) -> Result<u64, ParseError> {
    let trimmed = input.trim();

    if let Some(bits) = trimmed.strip_suffix("bps") {
        let bits = bits.trim();
        let (num, multiplier) = match bits.chars().last() {
            Some(c) if c.eq_ignore_ascii_case(&'k') => (&bits[..bits.len() - 1], 1e3),
            Some(c) if c.eq_ignore_ascii_case(&'m') => (&bits[..bits.len() - 1], 1e6),
            Some(c) if c.eq_ignore_ascii_case(&'g') => (&bits[..bits.len() - 1], 1e9),
            _ => (bits, 1.0),
        };
        let value: f64 = num
            .trim()
            .parse()
            .map_err(|_| ParseError::Bandwidth(input.to_string()))?;
        if !value.is_finite() || value < 0.0 {
            return Err(ParseError::Bandwidth(input.to_string()));
        }
        return Ok((value * multiplier / 8.0).floor() as u64);
    }

    let bytes = trimmed
        .strip_suffix("/s")
        .or_else(|| trimmed.strip_suffix("ps"))
        .unwrap_or(trimmed);
    parse_byte_size(bytes).map_err(|_| ParseError::Bandwidth(input.to_string()))
}

/// Parse a disk I/O rate. Only the bytes-per-second family is accepted;
/// a `bps` bits value is rejected rather than silently divided by 8.
pub fn parse_disk_io_bandwidth(input: &str) -> Result<u64, ParseError> {
    if input.trim().ends_with("bps") {
        return Err(ParseError::BitsForDiskIo(input.to_string()));
    }
    parse_bandwidth(input)
}
