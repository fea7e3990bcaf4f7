//! Storage quota introspection.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use super::storage::StorageBackend;
use super::types::{CacheError, CacheResult, StorageQuotaSnapshot};

/// Polling period used by interactive callers.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Reports how much of the platform's storage quota the cache is using.
#[derive(Debug)]
pub struct QuotaMonitor {
    storage: Arc<dyn StorageBackend>,
    near_limit_threshold: f64,
}

impl QuotaMonitor {
    pub fn new(storage: Arc<dyn StorageBackend>, near_limit_threshold: f64) -> Self {
        Self {
            storage,
            near_limit_threshold,
        }
    }

    /// Current usage snapshot. Fails open with an all-zero snapshot when the
    /// storage cannot report usage.
    pub fn get_quota_snapshot(&self) -> StorageQuotaSnapshot {
        match self.storage.estimate() {
            Some(estimate) => StorageQuotaSnapshot::from_usage(
                estimate.usage,
                estimate.quota,
                self.near_limit_threshold,
            ),
            None => StorageQuotaSnapshot::unavailable(),
        }
    }

    /// Publish a fresh snapshot every `period` until every receiver is dropped.
    pub fn watch(self: Arc<Self>, period: Duration) -> CacheResult<watch::Receiver<StorageQuotaSnapshot>> {
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| CacheError::RuntimeUnavailable)?;
        let (tx, rx) = watch::channel(self.get_quota_snapshot());

        handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {
                        if tx.send(self.get_quota_snapshot()).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Quota watcher stopped");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline_cache::storage::MemoryStorage;

    #[test]
    fn test_snapshot_from_storage_estimate() {
        let storage = Arc::new(MemoryStorage::with_quota(100));
        storage.write("k", &[0u8; 94]).unwrap();
        let monitor = QuotaMonitor::new(storage, 0.8);

        let snapshot = monitor.get_quota_snapshot();
        assert_eq!(snapshot.used_bytes, 95);
        assert_eq!(snapshot.quota_bytes, 100);
        assert!((snapshot.percentage - 0.95).abs() < 1e-9);
        assert!(snapshot.near_limit);
    }

    #[test]
    fn test_snapshot_fails_open() {
        let monitor = QuotaMonitor::new(Arc::new(MemoryStorage::new()), 0.8);
        assert_eq!(monitor.get_quota_snapshot(), StorageQuotaSnapshot::unavailable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_publishes_updates() {
        let storage = Arc::new(MemoryStorage::with_quota(100));
        let monitor = Arc::new(QuotaMonitor::new(storage.clone(), 0.8));
        let mut rx = monitor.watch(Duration::from_secs(60)).unwrap();
        assert_eq!(rx.borrow().used_bytes, 0);

        storage.write("k", &[0u8; 9]).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().used_bytes, 10);
    }
}
