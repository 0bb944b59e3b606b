//! Represents one cached image blob.

use crate::errors::CacheResult;
use crate::services::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata for a single stored blob.
///
/// Exactly one record exists per `guid`. The record stores the metadata, not
/// the content bytes; the bytes live at `storage_path()` under the blob root.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ImageRecord {
    /// Unique identifier supplied by (or generated for) the uploader.
    pub guid: String,

    /// Upload year; first directory level on disk.
    pub year: i32,

    /// Upload month (1-12); second directory level on disk.
    pub month: u32,

    /// Size of the stored blob in bytes.
    pub file_size_byte: u64,

    /// Encoding as stored on disk, also the file extension.
    pub file_storage_format: String,

    pub upload_time: DateTime<Utc>,

    /// Owning application or tenant.
    pub app_code: String,

    /// Lowercase hex MD5 recorded at write time.
    pub md5: String,

    /// Successful reads so far; never decreases.
    pub download_count: u64,
}

impl ImageRecord {
    /// Path of the blob relative to the storage root, rebuilt from the
    /// recorded bucket and format.
    pub fn storage_path(&self) -> CacheResult<PathBuf> {
        paths::derive_with_format(
            &self.guid,
            self.year,
            self.month,
            &self.file_storage_format,
        )
    }
}
