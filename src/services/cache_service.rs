//! CacheService: keeps a blob on disk and its metadata record in step.
//!
//! Writes always go blob first, metadata second, so a record never points
//! at a blob that was not written, and a blob is never replaced once in
//! place. Reads trust the recorded bucket rather than guessing; a record
//! whose blob is missing is a consistency fault unless GC was reclaiming it.

use crate::errors::{CacheError, CacheResult};
use crate::metadata::{MetadataError, MetadataRepo, MetadataStore};
use crate::models::{
    image::ImageRecord,
    statistic::{DailyStatistic, day_key},
};
use crate::services::{
    GuidLocks, bounded,
    blob_store::{BlobRead, BlobStore, BlobWrite},
    paths,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error, warn};

/// Matches the `app_code varchar(64)` column.
const MAX_APP_CODE_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Upper bound for each blob or metadata call.
    pub operation_timeout: Duration,
    /// Extra attempts for a put that failed transiently.
    pub put_retries: u32,
    /// Backoff unit; attempt `n` waits `n * retry_backoff`.
    pub retry_backoff: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            put_retries: 2,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CachedImage {
    pub bytes: Bytes,
    pub size: u64,
    pub record: ImageRecord,
}

#[derive(Debug, Clone)]
pub enum CacheLookup {
    Hit(CachedImage),
    Miss,
}

#[derive(Debug, Clone)]
pub struct PutOutcome {
    /// Absolute path of the stored blob.
    pub path: PathBuf,
    pub size: u64,
    pub record: ImageRecord,
}

#[derive(Clone)]
pub struct CacheService {
    repo: MetadataRepo,
    blobs: Arc<dyn BlobStore>,
    locks: GuidLocks,
    config: CacheConfig,
}

impl CacheService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        config: CacheConfig,
    ) -> Self {
        Self {
            repo: MetadataRepo::new(store),
            blobs,
            locks: GuidLocks::new(),
            config,
        }
    }

    pub fn repo(&self) -> &MetadataRepo {
        &self.repo
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn locks(&self) -> &GuidLocks {
        &self.locks
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Serve a cached blob.
    ///
    /// No record means a miss, and the blob store is not consulted. A hit
    /// bumps the record's download count and today's download counters.
    pub async fn get(&self, guid: &str) -> CacheResult<CacheLookup> {
        self.get_at(Utc::now(), guid).await
    }

    pub async fn get_at(&self, now: DateTime<Utc>, guid: &str) -> CacheResult<CacheLookup> {
        paths::validate_identifier(guid)?;
        let limit = self.config.operation_timeout;

        let Some(record) = bounded(limit, self.repo.find_image(guid)).await? else {
            debug!(guid = %guid, "cache miss");
            return Ok(CacheLookup::Miss);
        };

        let path = record.storage_path()?;
        let (mut record, blob) = match bounded(limit, self.blobs.fetch(&path)).await? {
            Some(blob) => (record, blob),
            None => match self.recheck_missing_blob(guid).await? {
                Some(found) => found,
                None => return Ok(CacheLookup::Miss),
            },
        };
        if blob.size != record.file_size_byte {
            error!(
                guid = %guid,
                recorded = record.file_size_byte,
                actual = blob.size,
                "blob size does not match metadata"
            );
            return Err(CacheError::ConsistencyFault {
                guid: guid.to_string(),
                reason: format!(
                    "blob is {} bytes, metadata records {}",
                    blob.size, record.file_size_byte
                ),
            });
        }

        let counted = bounded(limit, self.repo.increment_download_count(guid)).await?;
        if counted == 0 {
            // Reclaimed between lookup and increment; the bytes are still valid.
            debug!(guid = %guid, "record removed while serving");
        } else {
            record.download_count += 1;
        }

        if let Err(err) = bounded(limit, self.repo.record_download(&day_key(now), blob.size)).await
        {
            warn!(guid = %guid, "failed to record download statistics: {}", err);
        }

        Ok(CacheLookup::Hit(CachedImage {
            bytes: blob.bytes,
            size: blob.size,
            record,
        }))
    }

    /// The blob was gone on the first read. GC removes the blob before the
    /// row while holding the stripe lock, so the answer is only trusted once
    /// that lock is ours: no record left is a miss, a record whose blob is
    /// still missing is a fault.
    async fn recheck_missing_blob(
        &self,
        guid: &str,
    ) -> CacheResult<Option<(ImageRecord, BlobRead)>> {
        let limit = self.config.operation_timeout;
        let _guard = self.locks.lock(guid).await;

        let Some(current) = bounded(limit, self.repo.find_image(guid)).await? else {
            debug!(guid = %guid, "image reclaimed while serving");
            return Ok(None);
        };
        let path = current.storage_path()?;
        match bounded(limit, self.blobs.fetch(&path)).await? {
            Some(blob) => Ok(Some((current, blob))),
            None => {
                error!(guid = %guid, path = %path.display(), "metadata references a missing blob");
                Err(CacheError::ConsistencyFault {
                    guid: guid.to_string(),
                    reason: format!("blob {} is missing", path.display()),
                })
            }
        }
    }

    /// Store a new blob under the current month's bucket.
    pub async fn put(
        &self,
        guid: &str,
        bytes: Bytes,
        format: &str,
        app_code: &str,
        md5: &str,
    ) -> CacheResult<PutOutcome> {
        self.put_at(Utc::now(), guid, bytes, format, app_code, md5)
            .await
    }

    /// `put` with an explicit upload time, which also fixes the bucket.
    pub async fn put_at(
        &self,
        now: DateTime<Utc>,
        guid: &str,
        bytes: Bytes,
        format: &str,
        app_code: &str,
        md5: &str,
    ) -> CacheResult<PutOutcome> {
        paths::validate_identifier(guid)?;
        paths::validate_format(format)?;
        let md5 = normalize_md5(md5)?;
        if app_code.is_empty() || app_code.len() > MAX_APP_CODE_LEN {
            return Err(CacheError::InvalidAppCode(app_code.to_string()));
        }

        let _guard = self.locks.lock(guid).await;
        let limit = self.config.operation_timeout;

        if bounded(limit, self.repo.find_image(guid)).await?.is_some() {
            return Err(CacheError::AlreadyExists(guid.to_string()));
        }

        let (year, month) = paths::bucket_of(now);
        let path = paths::derive_with_format(guid, year, month, format)?;
        let record = ImageRecord {
            guid: guid.to_string(),
            year,
            month,
            file_size_byte: bytes.len() as u64,
            file_storage_format: format.to_string(),
            upload_time: crate::metadata::repo::truncate_micros(now),
            app_code: app_code.to_string(),
            md5,
            download_count: 0,
        };

        let mut attempt = 0;
        let mut placed = None;
        let written = loop {
            match self
                .store_once(&path, &bytes, &record, &mut placed, attempt > 0)
                .await
            {
                Ok(written) => break written,
                Err(err) if err.is_transient() && attempt < self.config.put_retries => {
                    attempt += 1;
                    warn!(guid = %guid, attempt, "retrying put after transient failure: {}", err);
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                Err(err) => return Err(err),
            }
        };

        if let Err(err) = bounded(limit, self.repo.record_upload(&day_key(now), written.size)).await
        {
            warn!(guid = %guid, "failed to record upload statistics: {}", err);
        }

        debug!(guid = %guid, path = %written.path.display(), size = written.size, "stored image");
        Ok(PutOutcome {
            path: written.path,
            size: written.size,
            record,
        })
    }

    /// One write attempt: blob, then record.
    ///
    /// `placed` keeps a blob written by an earlier attempt of the same put,
    /// so a retry after a timed-out insert repeats only the insert. A failed
    /// insert removes the blob again, except when the outcome is unknown
    /// (timeout) or the row belongs to another writer; those blobs are left
    /// for the retry or the orphan sweep.
    async fn store_once(
        &self,
        path: &Path,
        bytes: &[u8],
        record: &ImageRecord,
        placed: &mut Option<Placement>,
        retrying: bool,
    ) -> CacheResult<BlobWrite> {
        let limit = self.config.operation_timeout;
        let placement = match placed.take() {
            Some(placement) => placement,
            None => self.place_blob(path, bytes, &record.guid, retrying).await?,
        };

        match bounded(limit, self.repo.insert_image(record)).await {
            Ok(()) => Ok(placement.written),
            Err(CacheError::Metadata(MetadataError::AlreadyExists(_))) => {
                if self.holds_own_record(record).await? {
                    debug!(guid = %record.guid, "insert from an earlier attempt had landed");
                    return Ok(placement.written);
                }
                Err(CacheError::AlreadyExists(record.guid.clone()))
            }
            Err(err @ CacheError::Timeout(_)) => {
                warn!(guid = %record.guid, "metadata insert timed out; keeping blob for retry");
                *placed = Some(placement);
                Err(err)
            }
            Err(err) if placement.adopted => {
                warn!(guid = %record.guid, "metadata insert failed, blob left for orphan sweep: {}", err);
                Err(err)
            }
            Err(err) => {
                warn!(guid = %record.guid, "metadata insert failed, rolling back blob: {}", err);
                if let Err(rollback_err) = bounded(limit, self.blobs.delete(path)).await {
                    warn!(
                        guid = %record.guid,
                        "blob rollback failed; left for orphan sweep: {}",
                        rollback_err
                    );
                }
                Err(err)
            }
        }
    }

    /// Write the blob without replacing anything already at `path`.
    ///
    /// On a retry, a blob with exactly our bytes is taken over: a write that
    /// timed out earlier in this put may still have landed.
    async fn place_blob(
        &self,
        path: &Path,
        bytes: &[u8],
        guid: &str,
        retrying: bool,
    ) -> CacheResult<Placement> {
        let limit = self.config.operation_timeout;
        match bounded(limit, self.blobs.write(path, bytes)).await {
            Ok(written) => Ok(Placement {
                written,
                adopted: false,
            }),
            Err(CacheError::BlobExists(existing)) => {
                if retrying {
                    if let Some(blob) = bounded(limit, self.blobs.fetch(path)).await? {
                        if blob.bytes.as_ref() == bytes {
                            debug!(guid = %guid, "taking over blob from an earlier attempt");
                            return Ok(Placement {
                                written: BlobWrite {
                                    path: existing,
                                    size: blob.size,
                                },
                                adopted: true,
                            });
                        }
                    }
                }
                warn!(guid = %guid, path = %existing.display(), "blob already present for a new image");
                Err(CacheError::AlreadyExists(guid.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    /// Whether the stored record for `record.guid` is this very upload.
    async fn holds_own_record(&self, record: &ImageRecord) -> CacheResult<bool> {
        let stored = bounded(
            self.config.operation_timeout,
            self.repo.find_image(&record.guid),
        )
        .await?;
        Ok(stored.is_some_and(|stored| same_upload(&stored, record)))
    }

    pub async fn info(&self, guid: &str) -> CacheResult<Option<ImageRecord>> {
        paths::validate_identifier(guid)?;
        bounded(self.config.operation_timeout, self.repo.find_image(guid)).await
    }

    /// Counters for `date`; a day without events reads as zeros.
    pub async fn statistic(&self, date: &str) -> CacheResult<DailyStatistic> {
        let found = bounded(self.config.operation_timeout, self.repo.daily_statistic(date)).await?;
        Ok(found.unwrap_or_else(|| DailyStatistic::empty(date)))
    }

    /// Readiness of both backing stores.
    pub async fn health_check(&self) -> CacheResult<()> {
        let limit = self.config.operation_timeout;
        bounded(limit, self.repo.store().health_check()).await?;
        bounded(limit, self.blobs.check()).await
    }
}

/// A blob this put is responsible for.
struct Placement {
    written: BlobWrite,
    /// Found already in place with our bytes rather than written by us.
    adopted: bool,
}

/// Same upload, ignoring counters that move after the insert.
fn same_upload(stored: &ImageRecord, record: &ImageRecord) -> bool {
    stored.year == record.year
        && stored.month == record.month
        && stored.file_size_byte == record.file_size_byte
        && stored.file_storage_format == record.file_storage_format
        && stored.upload_time == record.upload_time
        && stored.app_code == record.app_code
        && stored.md5 == record.md5
}

/// 32 hex characters, stored lowercase.
fn normalize_md5(md5: &str) -> CacheResult<String> {
    if md5.len() != 32 || !md5.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(CacheError::InvalidChecksum(md5.to_string()));
    }
    Ok(md5.to_ascii_lowercase())
}
