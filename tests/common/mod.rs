#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use image_cache::{
    errors::{CacheError, CacheResult},
    metadata::{
        FieldValue, Filter, MetadataBackend, MetadataError, MetadataResult, MetadataStore, Row,
        SqliteMetadataStore, Table,
    },
    services::{
        blob_store::{BlobRead, BlobStore, BlobWrite, FsBlobStore, StoredBlob},
        cache_service::{CacheConfig, CacheService},
    },
};
use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime},
};
use tempfile::TempDir;

pub const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

pub struct Harness {
    pub dir: TempDir,
    pub root: PathBuf,
    pub store: Arc<dyn MetadataStore>,
    pub cache: CacheService,
}

pub fn test_config() -> CacheConfig {
    CacheConfig {
        operation_timeout: Duration::from_secs(5),
        put_retries: 2,
        retry_backoff: Duration::from_millis(5),
    }
}

pub async fn harness() -> Harness {
    build(|fs| Arc::new(fs), |store| store).await
}

pub async fn harness_with_blobs<B>(wrap_blobs: B) -> Harness
where
    B: FnOnce(FsBlobStore) -> Arc<dyn BlobStore>,
{
    build(wrap_blobs, |store| store).await
}

pub async fn build<B, M>(wrap_blobs: B, wrap_store: M) -> Harness
where
    B: FnOnce(FsBlobStore) -> Arc<dyn BlobStore>,
    M: FnOnce(Arc<dyn MetadataStore>) -> Arc<dyn MetadataStore>,
{
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("images");
    let sqlite = SqliteMetadataStore::open(dir.path().join("meta").join("cache.db"))
        .await
        .unwrap();
    let store = wrap_store(Arc::new(sqlite));
    let blobs = wrap_blobs(FsBlobStore::new(&root));
    let cache = CacheService::new(store.clone(), blobs, test_config());
    Harness {
        dir,
        root,
        store,
        cache,
    }
}

pub fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
}

/// Counts reads so tests can tell whether the blob store was consulted.
pub struct CountingBlobStore {
    pub inner: FsBlobStore,
    pub fetches: Arc<AtomicUsize>,
}

#[async_trait]
impl BlobStore for CountingBlobStore {
    fn root(&self) -> &Path {
        self.inner.root()
    }

    async fn fetch(&self, path: &Path) -> CacheResult<Option<BlobRead>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(path).await
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> CacheResult<BlobWrite> {
        self.inner.write(path, bytes).await
    }

    async fn delete(&self, path: &Path) -> CacheResult<()> {
        self.inner.delete(path).await
    }

    async fn list(&self, older_than: SystemTime) -> CacheResult<Vec<StoredBlob>> {
        self.inner.list(older_than).await
    }

    async fn check(&self) -> CacheResult<()> {
        self.inner.check().await
    }
}

/// Injects failures: the first `failing_writes` writes fail with a storage
/// fault, deletes of paths containing `failing_delete` always fail, and the
/// `*_delay` fields slow down writes, successful deletes and listing.
pub struct FlakyBlobStore {
    pub inner: FsBlobStore,
    pub failing_writes: AtomicUsize,
    pub writes: Arc<AtomicUsize>,
    pub failing_delete: Option<String>,
    pub write_delay: Duration,
    pub list_delay: Duration,
    pub delete_delay: Duration,
}

impl FlakyBlobStore {
    pub fn new(inner: FsBlobStore) -> Self {
        Self {
            inner,
            failing_writes: AtomicUsize::new(0),
            writes: Arc::new(AtomicUsize::new(0)),
            failing_delete: None,
            write_delay: Duration::ZERO,
            list_delay: Duration::ZERO,
            delete_delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl BlobStore for FlakyBlobStore {
    fn root(&self) -> &Path {
        self.inner.root()
    }

    async fn fetch(&self, path: &Path) -> CacheResult<Option<BlobRead>> {
        self.inner.fetch(path).await
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> CacheResult<BlobWrite> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.write_delay).await;
        let remaining = self.failing_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(CacheError::storage(path, io::Error::other("disk hiccup")));
        }
        self.inner.write(path, bytes).await
    }

    async fn delete(&self, path: &Path) -> CacheResult<()> {
        if let Some(needle) = &self.failing_delete {
            if path.to_string_lossy().contains(needle.as_str()) {
                return Err(CacheError::storage(
                    path,
                    io::Error::new(io::ErrorKind::PermissionDenied, "read-only"),
                ));
            }
        }
        self.inner.delete(path).await?;
        tokio::time::sleep(self.delete_delay).await;
        Ok(())
    }

    async fn list(&self, older_than: SystemTime) -> CacheResult<Vec<StoredBlob>> {
        tokio::time::sleep(self.list_delay).await;
        self.inner.list(older_than).await
    }

    async fn check(&self) -> CacheResult<()> {
        self.inner.check().await
    }
}

/// Rejects every `image_info` insert with a non-transient error.
pub struct RejectingInserts {
    pub inner: Arc<dyn MetadataStore>,
}

#[async_trait]
impl MetadataStore for RejectingInserts {
    fn backend(&self) -> MetadataBackend {
        self.inner.backend()
    }

    async fn migrate(&self) -> MetadataResult<()> {
        self.inner.migrate().await
    }

    async fn insert(&self, table: Table, values: Vec<FieldValue>) -> MetadataResult<()> {
        if table == Table::ImageInfo {
            return Err(MetadataError::InvalidRow {
                table: table.name(),
                reason: "rejected by test".into(),
            });
        }
        self.inner.insert(table, values).await
    }

    async fn select(&self, table: Table, filter: &Filter) -> MetadataResult<Vec<Row>> {
        self.inner.select(table, filter).await
    }

    async fn select_last(&self, table: Table, filter: &Filter) -> MetadataResult<Option<Row>> {
        self.inner.select_last(table, filter).await
    }

    async fn select_older_than(
        &self,
        table: Table,
        time_field: &str,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> MetadataResult<Vec<Row>> {
        self.inner
            .select_older_than(table, time_field, cutoff, limit)
            .await
    }

    async fn update(
        &self,
        table: Table,
        field: &str,
        value: FieldValue,
        filter: &Filter,
    ) -> MetadataResult<u64> {
        self.inner.update(table, field, value, filter).await
    }

    async fn increment(
        &self,
        table: Table,
        deltas: &[(&str, i64)],
        filter: &Filter,
    ) -> MetadataResult<u64> {
        self.inner.increment(table, deltas, filter).await
    }

    async fn delete(&self, table: Table, filter: &Filter) -> MetadataResult<u64> {
        self.inner.delete(table, filter).await
    }

    async fn health_check(&self) -> MetadataResult<()> {
        self.inner.health_check().await
    }
}

/// Makes the first `stalled` `image_info` inserts hang for `stall`. With
/// `commit_first` the row is written before the hang, so a caller that gives
/// up early cannot tell whether it landed; without it the row never lands.
pub struct StallingInserts {
    pub inner: Arc<dyn MetadataStore>,
    pub inserts: Arc<AtomicUsize>,
    pub stalled: usize,
    pub stall: Duration,
    pub commit_first: bool,
}

#[async_trait]
impl MetadataStore for StallingInserts {
    fn backend(&self) -> MetadataBackend {
        self.inner.backend()
    }

    async fn migrate(&self) -> MetadataResult<()> {
        self.inner.migrate().await
    }

    async fn insert(&self, table: Table, values: Vec<FieldValue>) -> MetadataResult<()> {
        if table != Table::ImageInfo {
            return self.inner.insert(table, values).await;
        }
        let seen = self.inserts.fetch_add(1, Ordering::SeqCst);
        if seen >= self.stalled {
            return self.inner.insert(table, values).await;
        }
        if self.commit_first {
            self.inner.insert(table, values).await?;
            tokio::time::sleep(self.stall).await;
            Ok(())
        } else {
            tokio::time::sleep(self.stall).await;
            self.inner.insert(table, values).await
        }
    }

    async fn select(&self, table: Table, filter: &Filter) -> MetadataResult<Vec<Row>> {
        self.inner.select(table, filter).await
    }

    async fn select_last(&self, table: Table, filter: &Filter) -> MetadataResult<Option<Row>> {
        self.inner.select_last(table, filter).await
    }

    async fn select_older_than(
        &self,
        table: Table,
        time_field: &str,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> MetadataResult<Vec<Row>> {
        self.inner
            .select_older_than(table, time_field, cutoff, limit)
            .await
    }

    async fn update(
        &self,
        table: Table,
        field: &str,
        value: FieldValue,
        filter: &Filter,
    ) -> MetadataResult<u64> {
        self.inner.update(table, field, value, filter).await
    }

    async fn increment(
        &self,
        table: Table,
        deltas: &[(&str, i64)],
        filter: &Filter,
    ) -> MetadataResult<u64> {
        self.inner.increment(table, deltas, filter).await
    }

    async fn delete(&self, table: Table, filter: &Filter) -> MetadataResult<u64> {
        self.inner.delete(table, filter).await
    }

    async fn health_check(&self) -> MetadataResult<()> {
        self.inner.health_check().await
    }
}
