//! Blob storage on the local filesystem.
//!
//! Paths handed to a `BlobStore` are relative to its root and come from
//! `paths::derive_with_format`. Not-found is reported as `None` (or success,
//! for delete); every other I/O failure is a `StorageFault`.

use crate::errors::{CacheError, CacheResult};
use crate::services::paths::TEMP_PREFIX;
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::SystemTime,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BlobRead {
    pub bytes: Bytes,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct BlobWrite {
    /// Absolute location of the written blob.
    pub path: PathBuf,
    pub size: u64,
}

/// A file found under the root by `list`.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    /// Relative to the store root.
    pub path: PathBuf,
    pub modified: SystemTime,
}

impl StoredBlob {
    /// Leftover from an interrupted write.
    pub fn is_temp(&self) -> bool {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(TEMP_PREFIX))
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Root directory that relative paths resolve against.
    fn root(&self) -> &Path;

    async fn fetch(&self, path: &Path) -> CacheResult<Option<BlobRead>>;

    /// Never replaces an existing blob: a taken target is `BlobExists`.
    async fn write(&self, path: &Path, bytes: &[u8]) -> CacheResult<BlobWrite>;

    /// Idempotent: a missing blob is success.
    async fn delete(&self, path: &Path) -> CacheResult<()>;

    /// Files under `<root>/<year>/<month>/` last modified before
    /// `older_than`, temp files included.
    async fn list(&self, older_than: SystemTime) -> CacheResult<Vec<StoredBlob>>;

    /// Write/read/delete probe used by readiness checks.
    async fn check(&self) -> CacheResult<()>;
}

/// `BlobStore` over a local directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Recursively remove empty directories up to the root.
    ///
    /// Stops at the first directory that is not empty, missing, or fails to
    /// delete.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.root) && current != self.root {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    /// Numeric child directories of `dir` (the year and month levels).
    async fn numeric_dirs(&self, dir: &Path) -> CacheResult<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CacheError::storage(dir, err)),
        };
        let mut dirs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| CacheError::storage(dir, err))?
        {
            let is_numeric = entry
                .file_name()
                .to_str()
                .is_some_and(|name| !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()));
            let is_dir = entry
                .file_type()
                .await
                .map_err(|err| CacheError::storage(entry.path(), err))?
                .is_dir();
            if is_numeric && is_dir {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn fetch(&self, path: &Path) -> CacheResult<Option<BlobRead>> {
        let full_path = self.root.join(path);
        match fs::read(&full_path).await {
            Ok(bytes) => {
                let size = bytes.len() as u64;
                Ok(Some(BlobRead {
                    bytes: Bytes::from(bytes),
                    size,
                }))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CacheError::storage(full_path, err)),
        }
    }

    /// Writes to a temp file beside the target, syncs it, then links it into
    /// place so readers never see a partial blob. Unlike a rename, the link
    /// fails when the target exists, so two writers cannot swap each other's
    /// bytes.
    async fn write(&self, path: &Path, bytes: &[u8]) -> CacheResult<BlobWrite> {
        let file_path = self.root.join(path);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            CacheError::storage(
                &file_path,
                std::io::Error::other("blob path missing parent directory"),
            )
        })?;
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| CacheError::storage(&parent, err))?;

        let tmp_path = parent.join(format!("{}{}", TEMP_PREFIX, Uuid::new_v4()));
        if let Err(err) = write_synced(&tmp_path, bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(CacheError::storage(&tmp_path, err));
        }

        let linked = fs::hard_link(&tmp_path, &file_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        match linked {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                debug!("blob {} already present, not replaced", file_path.display());
                return Err(CacheError::BlobExists(file_path));
            }
            Err(err) => return Err(CacheError::storage(&file_path, err)),
        }

        debug!("wrote blob {} ({} bytes)", file_path.display(), bytes.len());
        Ok(BlobWrite {
            path: file_path,
            size: bytes.len() as u64,
        })
    }

    async fn delete(&self, path: &Path) -> CacheResult<()> {
        let file_path = self.root.join(path);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed blob {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob {} already missing", file_path.display());
                return Ok(());
            }
            Err(err) => return Err(CacheError::storage(file_path, err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn list(&self, older_than: SystemTime) -> CacheResult<Vec<StoredBlob>> {
        let mut found = Vec::new();
        for year_dir in self.numeric_dirs(&self.root).await? {
            for month_dir in self.numeric_dirs(&year_dir).await? {
                let mut entries = match fs::read_dir(&month_dir).await {
                    Ok(entries) => entries,
                    Err(err) if err.kind() == ErrorKind::NotFound => continue,
                    Err(err) => return Err(CacheError::storage(&month_dir, err)),
                };
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|err| CacheError::storage(&month_dir, err))?
                {
                    let full_path = entry.path();
                    let metadata = match entry.metadata().await {
                        Ok(metadata) => metadata,
                        // Removed between readdir and stat.
                        Err(err) if err.kind() == ErrorKind::NotFound => continue,
                        Err(err) => return Err(CacheError::storage(&full_path, err)),
                    };
                    if !metadata.is_file() {
                        continue;
                    }
                    let modified = metadata
                        .modified()
                        .map_err(|err| CacheError::storage(&full_path, err))?;
                    if modified >= older_than {
                        continue;
                    }
                    if let Ok(relative) = full_path.strip_prefix(&self.root) {
                        found.push(StoredBlob {
                            path: relative.to_path_buf(),
                            modified,
                        });
                    }
                }
            }
        }
        found.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(found)
    }

    async fn check(&self) -> CacheResult<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|err| CacheError::storage(&self.root, err))?;
        let probe = self.root.join(format!(".readyz-{}", Uuid::new_v4()));
        let result = async {
            fs::write(&probe, b"readyz").await?;
            let bytes = fs::read(&probe).await?;
            if bytes != b"readyz" {
                return Err(std::io::Error::other("file content mismatch"));
            }
            Ok::<(), std::io::Error>(())
        }
        .await;
        let _ = fs::remove_file(&probe).await;
        result.map_err(|err| CacheError::storage(probe, err))
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}
