//! Cache orchestration: path derivation, blob storage, the cache manager and
//! the garbage collector.

pub mod blob_store;
pub mod cache_service;
pub mod gc_service;
pub mod paths;

use crate::errors::{CacheError, CacheResult};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::sync::{Mutex, MutexGuard};

const LOCK_STRIPES: usize = 64;

/// Striped per-guid locks. Writers and the garbage collector take the stripe
/// of a guid before touching its blob or record.
#[derive(Clone)]
pub struct GuidLocks {
    stripes: Arc<Vec<Mutex<()>>>,
}

impl GuidLocks {
    pub fn new() -> Self {
        Self {
            stripes: Arc::new((0..LOCK_STRIPES).map(|_| Mutex::new(())).collect()),
        }
    }

    pub async fn lock(&self, guid: &str) -> MutexGuard<'_, ()> {
        let digest = md5::compute(guid.as_bytes());
        let index = usize::from(digest[0]) % self.stripes.len();
        self.stripes[index].lock().await
    }
}

impl Default for GuidLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a store call under `limit`; expiry becomes `CacheError::Timeout`.
pub(crate) async fn bounded<T, E, F>(limit: Duration, fut: F) -> CacheResult<T>
where
    F: Future<Output = Result<T, E>>,
    CacheError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(CacheError::from),
        Err(_) => Err(CacheError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_guid_shares_a_stripe() {
        let locks = GuidLocks::new();
        let guard = locks.lock("abc123").await;
        assert!(
            tokio::time::timeout(Duration::from_millis(20), locks.lock("abc123"))
                .await
                .is_err()
        );
        drop(guard);
        let _again = locks.lock("abc123").await;
    }

    #[tokio::test]
    async fn bounded_maps_expiry_to_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, CacheError>(())
        };
        let err = bounded(Duration::from_millis(10), slow).await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout(_)));

        let fast = async { Ok::<_, CacheError>(7) };
        assert_eq!(bounded(Duration::from_secs(1), fast).await.unwrap(), 7);
    }
}
