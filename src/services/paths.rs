//! Deterministic blob paths: `<year>/<month>/<guid>[.<format>]`.
//!
//! Pure functions, no I/O. Year and month are always the first two
//! segments, so a bucket can be listed from disk without consulting
//! metadata.

use crate::errors::{CacheError, CacheResult};
use chrono::{DateTime, Datelike, Utc};
use std::path::{Component, Path, PathBuf};

/// Matches the `guid varchar(128)` column.
pub const MAX_IDENTIFIER_LEN: usize = 128;
pub const MAX_FORMAT_LEN: usize = 32;

/// Prefix of in-flight blob writes; never a valid identifier.
pub const TEMP_PREFIX: &str = ".tmp-";

/// Reject identifiers that could escape or collide within a bucket
/// directory.
pub fn validate_identifier(identifier: &str) -> CacheResult<()> {
    let invalid = identifier.is_empty()
        || identifier.len() > MAX_IDENTIFIER_LEN
        || identifier.starts_with('.')
        || identifier
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control());
    if invalid {
        return Err(CacheError::InvalidIdentifier(identifier.to_string()));
    }
    Ok(())
}

pub fn validate_format(format: &str) -> CacheResult<()> {
    if format.is_empty()
        || format.len() > MAX_FORMAT_LEN
        || !format.bytes().all(|b| b.is_ascii_alphanumeric())
    {
        return Err(CacheError::InvalidFormat(format.to_string()));
    }
    Ok(())
}

fn validate_bucket(year: i32, month: u32) -> CacheResult<()> {
    if !(1..=9999).contains(&year) || !(1..=12).contains(&month) {
        return Err(CacheError::InvalidBucket { year, month });
    }
    Ok(())
}

/// `<year>/<month>/<identifier>`, month without zero padding.
pub fn derive(identifier: &str, year: i32, month: u32) -> CacheResult<PathBuf> {
    validate_identifier(identifier)?;
    validate_bucket(year, month)?;
    let mut path = PathBuf::new();
    path.push(year.to_string());
    path.push(month.to_string());
    path.push(identifier);
    Ok(path)
}

/// `<year>/<month>/<identifier>.<format>`, the on-disk blob location.
pub fn derive_with_format(
    identifier: &str,
    year: i32,
    month: u32,
    format: &str,
) -> CacheResult<PathBuf> {
    validate_format(format)?;
    let mut path = derive(identifier, year, month)?;
    path.set_file_name(format!("{identifier}.{format}"));
    Ok(path)
}

/// The (year, month) bucket for an upload at `now`.
pub fn bucket_of(now: DateTime<Utc>) -> (i32, u32) {
    (now.year(), now.month())
}

/// A blob path taken apart again, as found by a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBlobPath {
    pub year: i32,
    pub month: u32,
    pub identifier: String,
    pub format: String,
}

/// Inverse of `derive_with_format`. Returns `None` for anything that could
/// not have been produced by it (temp files included).
pub fn parse(path: &Path) -> Option<ParsedBlobPath> {
    let mut parts = path.components().map(|c| match c {
        Component::Normal(s) => s.to_str(),
        _ => None,
    });
    let year: i32 = parts.next()??.parse().ok()?;
    let month: u32 = parts.next()??.parse().ok()?;
    let file_name = parts.next()??;
    if parts.next().is_some() {
        return None;
    }
    let (identifier, format) = file_name.rsplit_once('.')?;
    let parsed = ParsedBlobPath {
        year,
        month,
        identifier: identifier.to_string(),
        format: format.to_string(),
    };
    // Only canonical spellings round-trip (rejects "06" or "+2024").
    let canonical = derive_with_format(identifier, year, month, format).ok()?;
    (canonical == path).then_some(parsed)
}
