//! Garbage collection of expired images and orphaned blobs.

use crate::errors::{CacheError, CacheResult};
use crate::models::gc_log::GcLogEntry;
use crate::services::{bounded, cache_service::CacheService, paths};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::{Duration, SystemTime},
};
use tokio::{sync::Mutex, task::JoinHandle, time};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Minimum time between two runs.
    pub min_interval: Duration,
    /// Records older than this are reclaimed. `None` keeps them forever.
    pub retention: Option<Duration>,
    /// Orphan files younger than this are left alone.
    pub orphan_grace: Duration,
    /// Expired records handled per run.
    pub batch_size: u32,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(86_400),
            retention: None,
            orphan_grace: Duration::from_secs(3_600),
            batch_size: 500,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GcState {
    Idle,
    Due,
    Running,
}

impl GcState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => GcState::Due,
            2 => GcState::Running,
            _ => GcState::Idle,
        }
    }
}

/// Outcome of one run.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct GcReport {
    pub collection_time: Option<DateTime<Utc>>,
    /// Everything reclaimed; this is what lands in the GC log.
    pub garbage_count: i64,
    pub expired_records: i64,
    pub orphan_blobs: i64,
    pub failed: Vec<String>,
}

#[derive(Clone)]
pub struct GcScheduler {
    cache: CacheService,
    config: GcConfig,
    running: Arc<Mutex<()>>,
    state: Arc<AtomicU8>,
}

impl GcScheduler {
    pub fn new(cache: CacheService, config: GcConfig) -> Self {
        Self {
            cache,
            config,
            running: Arc::new(Mutex::new(())),
            state: Arc::new(AtomicU8::new(GcState::Idle as u8)),
        }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn state(&self) -> GcState {
        GcState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: GcState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub async fn last_run(&self) -> CacheResult<Option<GcLogEntry>> {
        bounded(
            self.cache.config().operation_timeout,
            self.cache.repo().last_gc_log(),
        )
        .await
    }

    pub async fn is_due(&self) -> CacheResult<bool> {
        self.is_due_at(Utc::now(), self.config.min_interval).await
    }

    /// Due when no run was ever logged, or when at least `min_interval`
    /// whole seconds have passed since the last logged run.
    pub async fn is_due_at(&self, now: DateTime<Utc>, min_interval: Duration) -> CacheResult<bool> {
        let due = match self.last_run().await? {
            None => true,
            Some(last) => {
                let interval = i64::try_from(min_interval.as_secs()).unwrap_or(i64::MAX);
                (now - last.collection_time).num_seconds() >= interval
            }
        };
        // A running pass owns the state; otherwise it mirrors the latest check.
        let next = if due { GcState::Due } else { GcState::Idle };
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != GcState::Running as u8).then_some(next as u8)
            });
        Ok(due)
    }

    pub async fn run(&self) -> CacheResult<GcReport> {
        self.run_at(Utc::now()).await
    }

    /// One collection pass. The run is logged even when nothing was
    /// reclaimed or some reclamations failed.
    pub async fn run_at(&self, now: DateTime<Utc>) -> CacheResult<GcReport> {
        let Ok(_running) = self.running.try_lock() else {
            return Err(CacheError::GcInProgress);
        };
        self.set_state(GcState::Running);
        let result = self.collect(now).await;
        self.set_state(GcState::Idle);
        result
    }

    /// `run` when due. `None` means the interval has not elapsed yet.
    pub async fn run_if_due(&self) -> CacheResult<Option<GcReport>> {
        if !self.is_due().await? {
            return Ok(None);
        }
        self.run().await.map(Some)
    }

    /// Background loop: check every `check_every`, run when due.
    pub fn spawn(self, check_every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = time::interval(check_every);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                match self.run_if_due().await {
                    Ok(Some(report)) => info!(
                        garbage_count = report.garbage_count,
                        "Scheduled garbage collection finished"
                    ),
                    Ok(None) => debug!("Garbage collection not due"),
                    Err(CacheError::GcInProgress) => debug!("Garbage collection already running"),
                    Err(err) => warn!("Scheduled garbage collection failed: {}", err),
                }
            }
        })
    }

    async fn collect(&self, now: DateTime<Utc>) -> CacheResult<GcReport> {
        info!(collection_time = %now, "Starting garbage collection");
        let mut report = GcReport {
            collection_time: Some(now),
            ..GcReport::default()
        };

        if let Some(retention) = self.config.retention {
            self.reclaim_expired(now, retention, &mut report).await?;
        }
        self.sweep_orphans(now, &mut report).await;

        report.garbage_count = report.expired_records + report.orphan_blobs;
        bounded(
            self.cache.config().operation_timeout,
            self.cache.repo().append_gc_log(now, report.garbage_count),
        )
        .await?;

        if report.failed.is_empty() {
            info!(
                garbage_count = report.garbage_count,
                expired = report.expired_records,
                orphans = report.orphan_blobs,
                "Garbage collection finished"
            );
            Ok(report)
        } else {
            warn!(
                garbage_count = report.garbage_count,
                failed = report.failed.len(),
                "Garbage collection partially failed"
            );
            Err(CacheError::PartialGcFailure { report })
        }
    }

    /// Records uploaded before `now - retention`. The candidate list is one
    /// SELECT; each record is re-read under its stripe lock so a record that
    /// changed or vanished since is skipped.
    async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
        report: &mut GcReport,
    ) -> CacheResult<()> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|err| CacheError::Configuration(format!("retention out of range: {err}")))?;
        let cutoff = now - retention;
        let limit = self.cache.config().operation_timeout;

        let candidates = match bounded(
            limit,
            self.cache
                .repo()
                .expired_images(cutoff, self.config.batch_size),
        )
        .await
        {
            Ok(candidates) => candidates,
            Err(err) => {
                report.failed.push(format!("expired records: {err}"));
                return Ok(());
            }
        };
        debug!(count = candidates.len(), cutoff = %cutoff, "expired candidates");

        for candidate in candidates {
            let guid = candidate.guid.as_str();
            let _guard = self.cache.locks().lock(guid).await;

            let current = match bounded(limit, self.cache.repo().find_image(guid)).await {
                Ok(current) => current,
                Err(err) => {
                    report.failed.push(format!("{guid}: {err}"));
                    continue;
                }
            };
            if current.as_ref().map(|r| r.upload_time) != Some(candidate.upload_time) {
                debug!(guid = %guid, "expired record changed since enumeration, skipping");
                continue;
            }

            let outcome = async {
                let path = candidate.storage_path()?;
                bounded(limit, self.cache.blobs().delete(&path)).await?;
                bounded(limit, self.cache.repo().delete_image(guid)).await
            }
            .await;
            match outcome {
                Ok(_) => {
                    debug!(guid = %guid, "reclaimed expired image");
                    report.expired_records += 1;
                }
                Err(err) => {
                    warn!(guid = %guid, "failed to reclaim expired image: {}", err);
                    report.failed.push(format!("{guid}: {err}"));
                }
            }
        }
        Ok(())
    }

    /// Files under the blob root that no record points at, plus stale temp
    /// files, once they are older than `orphan_grace`.
    async fn sweep_orphans(&self, now: DateTime<Utc>, report: &mut GcReport) {
        let limit = self.cache.config().operation_timeout;
        let older_than = SystemTime::from(now)
            .checked_sub(self.config.orphan_grace)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let stored = match bounded(limit, self.cache.blobs().list(older_than)).await {
            Ok(stored) => stored,
            Err(err) => {
                report.failed.push(format!("orphan listing: {err}"));
                return;
            }
        };

        for blob in stored {
            let label = blob.path.display().to_string();
            // Temp files and names no record could produce are never referenced.
            let identifier = if blob.is_temp() {
                None
            } else {
                paths::parse(&blob.path).map(|parsed| parsed.identifier)
            };

            let _guard = match &identifier {
                Some(guid) => Some(self.cache.locks().lock(guid).await),
                None => None,
            };
            if let Some(guid) = &identifier {
                match self.is_referenced(guid, &blob.path).await {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(err) => {
                        report.failed.push(format!("{label}: {err}"));
                        continue;
                    }
                }
            }

            match bounded(limit, self.cache.blobs().delete(&blob.path)).await {
                Ok(()) => {
                    debug!(path = %label, "removed orphan blob");
                    report.orphan_blobs += 1;
                }
                Err(err) => {
                    warn!(path = %label, "failed to remove orphan blob: {}", err);
                    report.failed.push(format!("{label}: {err}"));
                }
            }
        }
    }

    /// Whether the record for `guid` points at exactly `path`.
    async fn is_referenced(&self, guid: &str, path: &Path) -> CacheResult<bool> {
        let limit = self.cache.config().operation_timeout;
        match bounded(limit, self.cache.repo().find_image(guid)).await? {
            Some(record) => Ok(record.storage_path()? == path),
            None => Ok(false),
        }
    }
}
