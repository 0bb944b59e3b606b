mod common;

use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use futures::future;
use common::{
    CountingBlobStore, EMPTY_MD5, FlakyBlobStore, RejectingInserts, StallingInserts, at, build,
    harness, harness_with_blobs, test_config,
};
use image_cache::{
    errors::CacheError,
    metadata::{MetadataError, MetadataRepo},
    models::image::ImageRecord,
    services::{
        blob_store::FsBlobStore,
        cache_service::{CacheConfig, CacheLookup, CacheService},
        gc_service::{GcConfig, GcScheduler},
    },
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

fn body(len: usize) -> Bytes {
    Bytes::from(vec![7u8; len])
}

#[tokio::test]
async fn put_lands_in_upload_bucket_and_get_round_trips() {
    let h = harness().await;
    let uploaded = at(2024, 6, 15);

    let outcome = h
        .cache
        .put_at(uploaded, "abc123", body(500), "jpg", "app1", EMPTY_MD5)
        .await
        .unwrap();
    assert!(outcome.path.ends_with("2024/6/abc123.jpg"));
    assert!(h.root.join("2024/6/abc123.jpg").is_file());
    assert_eq!(outcome.size, 500);
    assert_eq!(outcome.record.file_size_byte, 500);
    assert_eq!((outcome.record.year, outcome.record.month), (2024, 6));

    for expected_count in 1..=2 {
        let CacheLookup::Hit(image) = h.cache.get_at(uploaded, "abc123").await.unwrap() else {
            panic!("expected a hit");
        };
        assert_eq!(image.bytes, body(500));
        assert_eq!(image.size, 500);
        assert_eq!(image.record.download_count, expected_count);
    }

    let stored = h.cache.info("abc123").await.unwrap().unwrap();
    assert_eq!(stored.download_count, 2);
    assert_eq!(stored.md5, EMPTY_MD5);
    assert_eq!(stored.app_code, "app1");
}

#[tokio::test]
async fn missing_guid_is_a_miss_without_reading_blobs() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let counter = fetches.clone();
    let h = harness_with_blobs(move |inner| {
        Arc::new(CountingBlobStore {
            inner,
            fetches: counter,
        })
    })
    .await;

    assert!(matches!(
        h.cache.get("missing-guid").await.unwrap(),
        CacheLookup::Miss
    ));
    assert_eq!(fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn record_without_blob_is_a_consistency_fault() {
    let h = harness().await;
    let repo = MetadataRepo::new(h.store.clone());
    repo.insert_image(&ImageRecord {
        guid: "orphan1".into(),
        year: 2024,
        month: 6,
        file_size_byte: 10,
        file_storage_format: "png".into(),
        upload_time: at(2024, 6, 1),
        app_code: "app1".into(),
        md5: EMPTY_MD5.into(),
        download_count: 0,
    })
    .await
    .unwrap();

    let err = h.cache.get("orphan1").await.unwrap_err();
    assert!(matches!(err, CacheError::ConsistencyFault { ref guid, .. } if guid == "orphan1"));

    let record = h.cache.info("orphan1").await.unwrap().unwrap();
    assert_eq!(record.download_count, 0);
}

#[tokio::test]
async fn truncated_blob_is_a_consistency_fault() {
    let h = harness().await;
    h.cache
        .put_at(at(2024, 6, 1), "short", body(64), "png", "app1", EMPTY_MD5)
        .await
        .unwrap();
    std::fs::write(h.root.join("2024/6/short.png"), b"cut").unwrap();

    assert!(matches!(
        h.cache.get("short").await,
        Err(CacheError::ConsistencyFault { .. })
    ));
}

#[tokio::test]
async fn concurrent_gets_count_every_download() {
    let h = harness().await;
    let day = at(2024, 6, 20);
    h.cache
        .put_at(day, "popular", body(32), "webp", "app1", EMPTY_MD5)
        .await
        .unwrap();

    let tasks = (0..20).map(|_| {
        let cache = h.cache.clone();
        tokio::spawn(async move { cache.get_at(day, "popular").await })
    });
    for joined in future::join_all(tasks).await {
        assert!(matches!(joined.unwrap().unwrap(), CacheLookup::Hit(_)));
    }

    let record = h.cache.info("popular").await.unwrap().unwrap();
    assert_eq!(record.download_count, 20);

    let stats = h.cache.statistic("2024-06-20").await.unwrap();
    assert_eq!(stats.upload_count, 1);
    assert_eq!(stats.upload_size_byte, 32);
    assert_eq!(stats.download_count, 20);
    assert_eq!(stats.download_size_byte, 20 * 32);
}

#[tokio::test]
async fn duplicate_guid_is_rejected_and_original_kept() {
    let h = harness().await;
    h.cache
        .put_at(at(2024, 5, 1), "dup", body(10), "jpg", "app1", EMPTY_MD5)
        .await
        .unwrap();

    let err = h
        .cache
        .put_at(at(2024, 6, 1), "dup", body(99), "png", "app2", EMPTY_MD5)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::AlreadyExists(ref guid) if guid == "dup"));

    assert!(!h.root.join("2024/6/dup.png").exists());
    let record = h.cache.info("dup").await.unwrap().unwrap();
    assert_eq!((record.month, record.file_size_byte), (5, 10));
}

#[tokio::test]
async fn writers_without_shared_locks_never_swap_blobs() {
    let h = harness().await;
    let mut slow = FlakyBlobStore::new(FsBlobStore::new(&h.root));
    slow.write_delay = Duration::from_millis(300);
    // Same database and root, separate stripe locks: a second process.
    let other = CacheService::new(h.store.clone(), Arc::new(slow), test_config());
    let day = at(2024, 6, 1);

    let late = tokio::spawn(async move {
        other
            .put_at(day, "dup", body(99), "jpg", "app2", EMPTY_MD5)
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.cache
        .put_at(day, "dup", body(10), "jpg", "app1", EMPTY_MD5)
        .await
        .unwrap();

    let err = late.await.unwrap().unwrap_err();
    assert!(matches!(err, CacheError::AlreadyExists(ref guid) if guid == "dup"));

    let CacheLookup::Hit(image) = h.cache.get_at(day, "dup").await.unwrap() else {
        panic!("expected a hit");
    };
    assert_eq!(image.bytes, body(10));
    assert_eq!(image.record.app_code, "app1");
}

fn short_timeouts() -> CacheConfig {
    CacheConfig {
        operation_timeout: Duration::from_millis(200),
        ..test_config()
    }
}

#[tokio::test]
async fn retry_recognises_an_insert_that_landed_after_timing_out() {
    let inserts = Arc::new(AtomicUsize::new(0));
    let counter = inserts.clone();
    let h = build(
        |fs| Arc::new(fs),
        move |store| {
            Arc::new(StallingInserts {
                inner: store,
                inserts: counter,
                stalled: 1,
                stall: Duration::from_secs(2),
                commit_first: true,
            })
        },
    )
    .await;
    let cache = CacheService::new(
        h.store.clone(),
        Arc::new(FsBlobStore::new(&h.root)),
        short_timeouts(),
    );

    let outcome = cache
        .put_at(at(2024, 6, 1), "slow", body(12), "png", "app1", EMPTY_MD5)
        .await
        .unwrap();
    assert_eq!(outcome.size, 12);
    assert_eq!(inserts.load(Ordering::SeqCst), 2);
    assert!(h.root.join("2024/6/slow.png").is_file());

    let stored = cache.info("slow").await.unwrap().unwrap();
    assert_eq!(stored, outcome.record);
    assert_eq!(cache.statistic("2024-06-01").await.unwrap().upload_count, 1);
}

#[tokio::test]
async fn insert_that_never_lands_leaves_the_blob_for_the_orphan_sweep() {
    let inserts = Arc::new(AtomicUsize::new(0));
    let counter = inserts.clone();
    let h = build(
        |fs| Arc::new(fs),
        move |store| {
            Arc::new(StallingInserts {
                inner: store,
                inserts: counter,
                stalled: usize::MAX,
                stall: Duration::from_secs(2),
                commit_first: false,
            })
        },
    )
    .await;
    let writes = Arc::new(AtomicUsize::new(0));
    let mut counted = FlakyBlobStore::new(FsBlobStore::new(&h.root));
    counted.writes = writes.clone();
    let cache = CacheService::new(h.store.clone(), Arc::new(counted), short_timeouts());

    let err = cache
        .put_at(at(2024, 6, 1), "lost", body(5), "png", "app1", EMPTY_MD5)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Timeout(_)));
    // One attempt plus two retries, each repeating only the insert.
    assert_eq!(inserts.load(Ordering::SeqCst), 3);
    assert_eq!(writes.load(Ordering::SeqCst), 1);
    assert!(cache.info("lost").await.unwrap().is_none());
    assert!(h.root.join("2024/6/lost.png").is_file());

    let gc = GcScheduler::new(cache.clone(), GcConfig::default());
    let report = gc
        .run_at(Utc::now() + ChronoDuration::hours(2))
        .await
        .unwrap();
    assert_eq!(report.orphan_blobs, 1);
    assert!(!h.root.join("2024/6/lost.png").exists());
}

#[tokio::test]
async fn failed_metadata_insert_rolls_back_the_blob() {
    let h = build(
        |fs| Arc::new(fs),
        |store| Arc::new(RejectingInserts { inner: store }),
    )
    .await;

    let err = h
        .cache
        .put_at(at(2024, 6, 1), "abc123", body(500), "jpg", "app1", EMPTY_MD5)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CacheError::Metadata(MetadataError::InvalidRow { .. })
    ));
    assert!(!h.root.join("2024/6/abc123.jpg").exists());
    assert!(!h.root.join("2024").exists());
    assert!(h.cache.info("abc123").await.unwrap().is_none());
    assert_eq!(h.cache.statistic("2024-06-01").await.unwrap().upload_count, 0);
}

#[tokio::test]
async fn transient_write_failures_are_retried() {
    let writes = Arc::new(AtomicUsize::new(0));
    let counter = writes.clone();
    let h = harness_with_blobs(move |inner| {
        let mut flaky = FlakyBlobStore::new(inner);
        flaky.failing_writes = AtomicUsize::new(2);
        flaky.writes = counter;
        Arc::new(flaky)
    })
    .await;

    h.cache
        .put_at(at(2024, 6, 1), "retry", body(8), "gif", "app1", EMPTY_MD5)
        .await
        .unwrap();
    assert_eq!(writes.load(Ordering::SeqCst), 3);
    assert!(h.root.join("2024/6/retry.gif").is_file());
}

#[tokio::test]
async fn retries_stop_after_the_configured_budget() {
    let writes = Arc::new(AtomicUsize::new(0));
    let counter = writes.clone();
    let h = harness_with_blobs(move |inner| {
        let mut flaky = FlakyBlobStore::new(inner);
        flaky.failing_writes = AtomicUsize::new(10);
        flaky.writes = counter;
        Arc::new(flaky)
    })
    .await;

    let err = h
        .cache
        .put_at(at(2024, 6, 1), "broken", body(8), "gif", "app1", EMPTY_MD5)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::StorageFault { .. }));
    // One attempt plus `put_retries` (2) retries.
    assert_eq!(writes.load(Ordering::SeqCst), 3);
    assert!(h.cache.info("broken").await.unwrap().is_none());
}

#[tokio::test]
async fn caller_errors_are_rejected_before_any_io() {
    let h = harness().await;
    let now = at(2024, 6, 1);

    let cases = [
        ("a/b", "jpg", "app1", EMPTY_MD5),
        ("", "jpg", "app1", EMPTY_MD5),
        ("ok", "j.pg", "app1", EMPTY_MD5),
        ("ok", "jpg", "app1", "not-a-checksum"),
        ("ok", "jpg", "", EMPTY_MD5),
    ];
    for (guid, format, app_code, md5) in cases {
        let err = h
            .cache
            .put_at(now, guid, body(1), format, app_code, md5)
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                CacheError::InvalidIdentifier(_)
                    | CacheError::InvalidFormat(_)
                    | CacheError::InvalidChecksum(_)
                    | CacheError::InvalidAppCode(_)
            ),
            "unexpected {err:?} for {guid:?}"
        );
    }
    assert!(!h.root.exists());
    assert!(matches!(
        h.cache.get("../etc").await,
        Err(CacheError::InvalidIdentifier(_))
    ));
}

#[tokio::test]
async fn md5_is_stored_lowercase() {
    let h = harness().await;
    let outcome = h
        .cache
        .put_at(
            at(2024, 6, 1),
            "upper",
            body(4),
            "bmp",
            "app1",
            "D41D8CD98F00B204E9800998ECF8427E",
        )
        .await
        .unwrap();
    assert_eq!(outcome.record.md5, EMPTY_MD5);
}

#[tokio::test]
async fn statistics_start_a_new_row_each_day() {
    let h = harness().await;
    h.cache
        .put_at(at(2024, 6, 1), "one", body(100), "jpg", "app1", EMPTY_MD5)
        .await
        .unwrap();
    h.cache
        .put_at(at(2024, 6, 1), "two", body(50), "jpg", "app1", EMPTY_MD5)
        .await
        .unwrap();
    h.cache
        .put_at(at(2024, 6, 2), "three", body(7), "jpg", "app1", EMPTY_MD5)
        .await
        .unwrap();

    let first = h.cache.statistic("2024-06-01").await.unwrap();
    assert_eq!((first.upload_count, first.upload_size_byte), (2, 150));
    let second = h.cache.statistic("2024-06-02").await.unwrap();
    assert_eq!((second.upload_count, second.upload_size_byte), (1, 7));

    let quiet = h.cache.statistic("2024-07-01").await.unwrap();
    assert_eq!(quiet.date, "2024-07-01");
    assert_eq!(quiet.upload_count + quiet.download_count, 0);
}

#[tokio::test]
async fn health_check_covers_both_stores() {
    let h = harness().await;
    h.cache.health_check().await.unwrap();
    assert!(h.root.is_dir());
}
