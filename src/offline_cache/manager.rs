//! Cache manager: eviction policy, storage health and the cleanup scheduler.
//!
//! The manager is the only component allowed to bulk-delete durable
//! entries. It runs a periodic cleanup once [`CacheManager::initialize`] has
//! been called and reacts to quota-exceeded signals from the durable cache
//! with an emergency cleanup. Every operation is advisory: once the manager
//! has been destroyed the operations become no-ops and return `None`.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::durable::DurableCache;
use super::lock_unpoisoned;
use super::quota::QuotaMonitor;
use super::types::{
    CacheDomain, CacheError, CacheEvent, CacheHealthReport, CacheOperation, CacheOperationResult,
    CacheResult, CacheStatsSummary, CleanupOptions, CleanupPhase, CleanupReport, EntryInfo,
};

const STALE_DATA_AGE: Duration = Duration::from_secs(7 * 24 * 3600);
const EXPIRED_WARNING_THRESHOLD: usize = 10;

#[derive(Debug)]
enum ManagerState {
    Uninitialized,
    Initialized {
        shutdown: Arc<Notify>,
        task: JoinHandle<()>,
    },
    Destroyed,
}

/// Policy engine over the durable cache.
#[derive(Debug)]
pub struct CacheManager {
    cache: Arc<DurableCache>,
    quota: Arc<QuotaMonitor>,
    state: Mutex<ManagerState>,
}

impl CacheManager {
    pub fn new(cache: Arc<DurableCache>, quota: Arc<QuotaMonitor>) -> Self {
        Self {
            cache,
            quota,
            state: Mutex::new(ManagerState::Uninitialized),
        }
    }

    /// Start the periodic cleanup and the quota-exceeded listener.
    ///
    /// Must be called from within a Tokio runtime. Calling it again while
    /// initialized, or after [`destroy`](Self::destroy), does nothing.
    pub fn initialize(self: &Arc<Self>) -> CacheResult<()> {
        let mut state = lock_unpoisoned(&self.state);
        match *state {
            ManagerState::Uninitialized => {}
            ManagerState::Initialized { .. } => return Ok(()),
            ManagerState::Destroyed => {
                warn!("Ignoring initialize on a destroyed cache manager");
                return Ok(());
            }
        }

        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| CacheError::RuntimeUnavailable)?;
        let period = self.cache.config().cleanup_interval();
        let shutdown = Arc::new(Notify::new());
        let task = handle.spawn(run_scheduler(
            Arc::downgrade(self),
            self.cache.subscribe(),
            shutdown.clone(),
            period,
        ));

        *state = ManagerState::Initialized { shutdown, task };
        info!(
            "Cache manager initialized (cleanup every {}s)",
            period.as_secs()
        );
        Ok(())
    }

    /// Stop future scheduled cleanups. A sweep already running completes.
    /// Safe to call any number of times.
    pub fn destroy(&self) {
        let mut state = lock_unpoisoned(&self.state);
        match &*state {
            ManagerState::Destroyed => return,
            ManagerState::Initialized { shutdown, .. } => shutdown.notify_one(),
            ManagerState::Uninitialized => {}
        }
        *state = ManagerState::Destroyed;
        info!("Cache manager destroyed");
    }

    pub fn is_initialized(&self) -> bool {
        matches!(*lock_unpoisoned(&self.state), ManagerState::Initialized { .. })
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(*lock_unpoisoned(&self.state), ManagerState::Destroyed)
    }

    /// Whether the scheduler task is still alive.
    pub fn is_scheduled(&self) -> bool {
        match &*lock_unpoisoned(&self.state) {
            ManagerState::Initialized { task, .. } => !task.is_finished(),
            _ => false,
        }
    }

    /// Cleanup options derived from the cache configuration.
    pub fn default_cleanup_options(&self) -> CleanupOptions {
        let config = self.cache.config();
        CleanupOptions {
            max_age: config.max_entry_age(),
            max_size_bytes: config.max_cache_size_bytes,
            preserve_essential: true,
        }
    }

    /// Three-phase cleanup. Each phase only runs if the previous one left
    /// the cache over its size limit or the quota over the cleanup trigger:
    ///
    /// 1. expire: drop corrupted entries and expired entries;
    /// 2. age: drop entries older than `max_age`, oldest first;
    /// 3. size: drop the least recently written entries until the cache
    ///    fits in `max_size_bytes`.
    ///
    /// With `preserve_essential`, essential keys are only removed when corrupted.
    pub fn perform_cleanup(&self, options: CleanupOptions) -> Option<CleanupReport> {
        if self.is_destroyed() {
            debug!("Cleanup skipped: cache manager destroyed");
            return None;
        }

        let now = self.cache.now();
        let mut entries = match self.cache.entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cleanup skipped: failed to list cache entries: {}", e);
                return Some(CleanupReport::default());
            }
        };
        let mut report = CleanupReport::default();

        report.phases_run.push(CleanupPhase::Expire);
        entries.retain(|entry| {
            let expired = entry.is_expired(now) && evictable(entry, &options);
            if !(entry.corrupted || expired) {
                return true;
            }
            if self.cache.evict(&entry.storage_key) {
                report.expired_removed += 1;
                report.size_freed_bytes += entry.size_bytes;
            }
            false
        });

        if self.over_limit(&entries, &options) {
            report.phases_run.push(CleanupPhase::Age);
            let max_age_ms = i64::try_from(options.max_age.as_millis()).unwrap_or(i64::MAX);
            let cutoff = now.saturating_sub(max_age_ms);
            let (mut aged, kept): (Vec<EntryInfo>, Vec<EntryInfo>) = entries
                .into_iter()
                .partition(|e| e.eviction_timestamp() < cutoff && evictable(e, &options));
            aged.sort_by_key(EntryInfo::eviction_timestamp);
            for entry in &aged {
                if self.cache.evict(&entry.storage_key) {
                    report.aged_removed += 1;
                    report.size_freed_bytes += entry.size_bytes;
                }
            }
            entries = kept;
        }

        let mut remaining = total_size(&entries);
        if self.over_limit(&entries, &options) {
            report.phases_run.push(CleanupPhase::Size);
            let mut candidates: Vec<&EntryInfo> = entries
                .iter()
                .filter(|e| evictable(e, &options))
                .collect();
            candidates.sort_by_key(|e| e.eviction_timestamp());
            for entry in candidates {
                if remaining <= options.max_size_bytes {
                    break;
                }
                if self.cache.evict(&entry.storage_key) {
                    report.lru_removed += 1;
                    report.size_freed_bytes += entry.size_bytes;
                }
                remaining = remaining.saturating_sub(entry.size_bytes);
            }
        }
        report.remaining_bytes = remaining;

        if report.items_affected() > 0 {
            info!(
                "Cache cleanup removed {} entries ({} expired, {} aged, {} lru), freed {} bytes",
                report.items_affected(),
                report.expired_removed,
                report.aged_removed,
                report.lru_removed,
                report.size_freed_bytes
            );
        }
        Some(report)
    }

    /// Remove every entry outside the user-preferences domain, ignoring age
    /// and size thresholds. Reserved for genuine quota-exceeded conditions.
    pub fn perform_emergency_cleanup(&self) -> Option<CacheOperationResult> {
        if self.is_destroyed() {
            return None;
        }

        let entries = self.cache.entries().unwrap_or_else(|e| {
            warn!("Failed to list cache entries: {}", e);
            Vec::new()
        });

        let mut items_affected = 0;
        let mut size_freed = 0u64;
        for entry in entries
            .iter()
            .filter(|e| e.domain != CacheDomain::UserPreferences)
        {
            if self.cache.evict(&entry.storage_key) {
                items_affected += 1;
                size_freed += entry.size_bytes;
            }
        }

        warn!(
            "Emergency cache cleanup removed {} entries, freed {} bytes",
            items_affected, size_freed
        );

        Some(CacheOperationResult {
            operation: CacheOperation::EmergencyCleanup,
            success: true,
            message: format!(
                "Emergency cleanup removed {items_affected} entries, freed {size_freed} bytes"
            ),
            items_affected,
            size_freed_bytes: size_freed,
        })
    }

    /// Delete every cache entry. Explicit user action, so it runs in any state.
    pub fn clear_all(&self) -> CacheOperationResult {
        self.cache.clear_all()
    }

    /// Storage diagnostics with paired warnings and recommendations.
    pub fn check_storage_health(&self) -> Option<CacheHealthReport> {
        if self.is_destroyed() {
            return None;
        }

        let config = self.cache.config();
        let quota = self.quota.get_quota_snapshot();
        let stats = self.compute_stats();
        let now = self.cache.now();

        let mut warnings = Vec::new();
        let mut recommendations = Vec::new();

        if quota.percentage > config.critical_threshold {
            warnings.push(format!(
                "Storage critically full: {:.0}% of quota used",
                quota.percentage * 100.0
            ));
            recommendations.push(
                "Run an emergency cleanup or clear cached recommendations to free space"
                    .to_string(),
            );
        } else if quota.percentage > config.near_limit_threshold {
            warnings.push(format!(
                "Storage usage is high: {:.0}% of quota used",
                quota.percentage * 100.0
            ));
            recommendations
                .push("Run a cache cleanup to remove expired and old entries".to_string());
        }

        if stats.expired_item_count > EXPIRED_WARNING_THRESHOLD {
            warnings.push(format!(
                "{} expired entries are waiting to be cleaned up",
                stats.expired_item_count
            ));
            recommendations
                .push("Run a cache cleanup to reclaim space from expired entries".to_string());
        }

        let stale_ms = STALE_DATA_AGE.as_millis() as i64;
        if stats
            .oldest_item_timestamp
            .is_some_and(|oldest| now.saturating_sub(oldest) > stale_ms)
        {
            warnings.push("Oldest cached data is more than 7 days old".to_string());
            recommendations.push(
                "Refresh cached data while online to keep offline content current".to_string(),
            );
        }

        Some(CacheHealthReport {
            healthy: quota.percentage <= config.critical_threshold,
            warnings,
            recommendations,
            quota,
            stats,
        })
    }

    /// Single pass over every cache entry.
    pub fn get_cache_stats(&self) -> Option<CacheStatsSummary> {
        if self.is_destroyed() {
            return None;
        }
        Some(self.compute_stats())
    }

    fn compute_stats(&self) -> CacheStatsSummary {
        let now = self.cache.now();
        let entries = self.cache.entries().unwrap_or_else(|e| {
            warn!("Failed to list cache entries: {}", e);
            Vec::new()
        });

        let mut stats = CacheStatsSummary {
            total_items: entries.len(),
            total_size: total_size(&entries),
            ..Default::default()
        };
        for entry in &entries {
            if entry.corrupted || entry.is_expired(now) {
                stats.expired_item_count += 1;
            }
            if let Some(ts) = entry.timestamp {
                stats.oldest_item_timestamp =
                    Some(stats.oldest_item_timestamp.map_or(ts, |o| o.min(ts)));
                stats.newest_item_timestamp =
                    Some(stats.newest_item_timestamp.map_or(ts, |n| n.max(ts)));
            }
        }
        stats
    }

    fn over_limit(&self, entries: &[EntryInfo], options: &CleanupOptions) -> bool {
        total_size(entries) > options.max_size_bytes
            || self.quota.get_quota_snapshot().percentage
                > self.cache.config().cleanup_trigger_threshold
    }
}

fn evictable(entry: &EntryInfo, options: &CleanupOptions) -> bool {
    !(options.preserve_essential && entry.is_essential())
}

fn total_size(entries: &[EntryInfo]) -> u64 {
    entries.iter().map(|e| e.size_bytes).sum()
}

async fn run_scheduler(
    manager: Weak<CacheManager>,
    mut events: broadcast::Receiver<CacheEvent>,
    shutdown: Arc<Notify>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            _ = ticker.tick() => {
                let Some(manager) = manager.upgrade() else { break };
                debug!("Running scheduled cache cleanup");
                manager.perform_cleanup(manager.default_cleanup_options());
            }
            event = events.recv() => {
                let Some(manager) = manager.upgrade() else { break };
                match event {
                    Ok(CacheEvent::QuotaExceeded { storage_key, requested_bytes }) => {
                        warn!(
                            "Quota exceeded writing {} ({} bytes); running emergency cleanup",
                            storage_key, requested_bytes
                        );
                        manager.perform_emergency_cleanup();
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} cache events; running emergency cleanup", missed);
                        manager.perform_emergency_cleanup();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
    debug!("Cache manager scheduler stopped");
}
