//! Type definitions for the offline cache engine

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Milliseconds since the Unix epoch.
pub type EpochMillis = i64;

/// Storage key of the current user's preferences inside [`CacheDomain::UserPreferences`].
pub const PREFERENCES_KEY: &str = "current";

/// Storage key of the bootstrap dataset inside [`CacheDomain::EssentialData`].
pub const ESSENTIAL_DATA_KEY: &str = "bootstrap";

/// Storage key of the aggregated translation mapping inside [`CacheDomain::Translations`].
pub const TRANSLATION_MAP_KEY: &str = "mapping";

/// Storage key of the unfiltered recommendation page inside [`CacheDomain::Recommendations`].
pub const ALL_RECOMMENDATIONS_KEY: &str = "all";

const HOUR_MS: u64 = 60 * 60 * 1000;

/// Logical partition of the durable cache.
///
/// Every durable key carries its domain prefix, so the domain of any stored
/// entry can be recovered from the raw storage key alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheDomain {
    Recommendations,
    EssentialData,
    Translations,
    UserPreferences,
    LastSync,
}

impl CacheDomain {
    pub const ALL: [CacheDomain; 5] = [
        CacheDomain::Recommendations,
        CacheDomain::EssentialData,
        CacheDomain::Translations,
        CacheDomain::UserPreferences,
        CacheDomain::LastSync,
    ];

    /// Raw storage prefix for this domain. `LastSync` is a single scalar key.
    pub fn prefix(self) -> &'static str {
        match self {
            CacheDomain::Recommendations => "lg_rec:",
            CacheDomain::EssentialData => "lg_essential:",
            CacheDomain::Translations => "lg_translations:",
            CacheDomain::UserPreferences => "lg_prefs:",
            CacheDomain::LastSync => "lg_last_sync",
        }
    }

    /// Build the raw storage key for `key` in this domain.
    pub fn storage_key(self, key: &str) -> String {
        match self {
            CacheDomain::LastSync => self.prefix().to_string(),
            _ => format!("{}{}", self.prefix(), key),
        }
    }

    /// Recover the domain and domain-local key from a raw storage key.
    ///
    /// Returns `None` for keys that do not belong to the cache (the storage
    /// primitive may be shared with other writers).
    pub fn parse_storage_key(storage_key: &str) -> Option<(CacheDomain, &str)> {
        if storage_key == CacheDomain::LastSync.prefix() {
            return Some((CacheDomain::LastSync, ""));
        }
        CacheDomain::ALL
            .iter()
            .filter(|d| **d != CacheDomain::LastSync)
            .find_map(|d| storage_key.strip_prefix(d.prefix()).map(|rest| (*d, rest)))
    }

    /// Whether entries of this domain are essential keys that survive
    /// non-emergency eviction.
    pub fn is_essential(self) -> bool {
        matches!(
            self,
            CacheDomain::UserPreferences | CacheDomain::EssentialData | CacheDomain::LastSync
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CacheDomain::Recommendations => "recommendations",
            CacheDomain::EssentialData => "essential_data",
            CacheDomain::Translations => "translations",
            CacheDomain::UserPreferences => "user_preferences",
            CacheDomain::LastSync => "last_sync",
        }
    }
}

/// Whether a raw storage key is an essential key.
pub fn is_essential_key(storage_key: &str) -> bool {
    CacheDomain::parse_storage_key(storage_key).is_some_and(|(domain, _)| domain.is_essential())
}

/// Composite key used by the translation mapping:
/// `source-target-normalized text`, with `auto` standing in for an unknown source.
pub fn translation_cache_key(text: &str, target_language: &str, source_language: Option<&str>) -> String {
    format!(
        "{}-{}-{}",
        source_language.unwrap_or("auto"),
        target_language,
        text.trim().to_lowercase()
    )
}

/// A stored value wrapped with its write time and expiration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEnvelope<T> {
    pub data: T,
    pub timestamp: EpochMillis,
    pub expiration: EpochMillis,
}

impl<T> CacheEnvelope<T> {
    pub fn new(data: T, now: EpochMillis, ttl: Duration) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Self {
            data,
            timestamp: now,
            expiration: now.saturating_add(ttl_ms),
        }
    }

    pub fn is_expired(&self, now: EpochMillis) -> bool {
        now > self.expiration
    }
}

/// Header of an envelope, parsed without materialising `data`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub(crate) struct EnvelopeHeader {
    pub timestamp: EpochMillis,
    pub expiration: EpochMillis,
}

/// Metadata of one raw entry, as seen by the cache manager during a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub storage_key: String,
    pub domain: CacheDomain,
    pub size_bytes: u64,
    /// `None` when the entry could not be parsed.
    pub timestamp: Option<EpochMillis>,
    /// `None` for entries that never expire (the last-sync marker) or that
    /// could not be parsed.
    pub expiration: Option<EpochMillis>,
    pub corrupted: bool,
}

impl EntryInfo {
    pub fn is_expired(&self, now: EpochMillis) -> bool {
        self.expiration.is_some_and(|exp| now > exp)
    }

    /// Sort key for eviction: unknown timestamps sort as the oldest.
    pub fn eviction_timestamp(&self) -> EpochMillis {
        self.timestamp.unwrap_or(0)
    }

    pub fn is_essential(&self) -> bool {
        self.domain.is_essential()
    }
}

/// Outcome of a best-effort durable write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOutcome {
    Stored,
    /// The storage primitive refused the write because it is full; a
    /// quota-exceeded event was broadcast.
    QuotaExceeded,
    /// The storage primitive failed for another reason; the write was dropped.
    Dropped,
}

impl WriteOutcome {
    pub fn is_stored(self) -> bool {
        matches!(self, WriteOutcome::Stored)
    }
}

/// Event broadcast by the durable cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    QuotaExceeded { storage_key: String, requested_bytes: u64 },
}

/// Storage usage reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEstimate {
    pub usage: u64,
    pub quota: u64,
}

/// Point-in-time view of storage utilisation. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StorageQuotaSnapshot {
    pub used_bytes: u64,
    pub quota_bytes: u64,
    /// Fraction of the quota in use, `0.0..=1.0` (may exceed 1.0 if the
    /// platform over-reports usage).
    pub percentage: f64,
    pub near_limit: bool,
}

impl StorageQuotaSnapshot {
    /// Snapshot used when the platform offers no quota introspection.
    pub fn unavailable() -> Self {
        Self {
            used_bytes: 0,
            quota_bytes: 0,
            percentage: 0.0,
            near_limit: false,
        }
    }

    pub fn from_usage(used_bytes: u64, quota_bytes: u64, near_limit_threshold: f64) -> Self {
        if quota_bytes == 0 {
            return Self::unavailable();
        }
        let percentage = used_bytes as f64 / quota_bytes as f64;
        Self {
            used_bytes,
            quota_bytes,
            percentage,
            near_limit: percentage > near_limit_threshold,
        }
    }
}

/// Aggregate statistics over all cache entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatsSummary {
    pub total_items: usize,
    pub total_size: u64,
    pub oldest_item_timestamp: Option<EpochMillis>,
    pub newest_item_timestamp: Option<EpochMillis>,
    /// Entries past their expiration (or unreadable) that a sweep has not yet removed.
    pub expired_item_count: usize,
}

/// Result of a storage health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheHealthReport {
    pub healthy: bool,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
    pub quota: StorageQuotaSnapshot,
    pub stats: CacheStatsSummary,
}

/// Hit/miss/eviction counters of the durable cache since process start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub dropped_writes: u64,
    pub hit_rate: f64,
}

/// Cache management operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheOperation {
    Clear,
    Cleanup,
    EmergencyCleanup,
}

/// Cache management result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOperationResult {
    pub operation: CacheOperation,
    pub success: bool,
    pub message: String,
    pub items_affected: usize,
    pub size_freed_bytes: u64,
}

/// Phase of a regular cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPhase {
    Expire,
    Age,
    Size,
}

/// Breakdown of a regular cleanup run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub phases_run: Vec<CleanupPhase>,
    pub expired_removed: usize,
    pub aged_removed: usize,
    pub lru_removed: usize,
    pub size_freed_bytes: u64,
    pub remaining_bytes: u64,
}

impl CleanupReport {
    pub fn items_affected(&self) -> usize {
        self.expired_removed + self.aged_removed + self.lru_removed
    }
}

/// Options for [`CacheManager::perform_cleanup`](super::manager::CacheManager::perform_cleanup).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupOptions {
    pub max_age: Duration,
    pub max_size_bytes: u64,
    pub preserve_essential: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        let config = CacheConfig::default();
        Self {
            max_age: config.max_entry_age(),
            max_size_bytes: config.max_cache_size_bytes,
            preserve_essential: true,
        }
    }
}

/// Feature whose offline availability can be queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineFeature {
    Recommendations,
    Preferences,
    Translations,
    Essential,
    Speech,
}

impl OfflineFeature {
    pub fn domain(self) -> Option<CacheDomain> {
        match self {
            OfflineFeature::Recommendations => Some(CacheDomain::Recommendations),
            OfflineFeature::Preferences => Some(CacheDomain::UserPreferences),
            OfflineFeature::Translations => Some(CacheDomain::Translations),
            OfflineFeature::Essential => Some(CacheDomain::EssentialData),
            OfflineFeature::Speech => None,
        }
    }
}

/// What the application can still do without connectivity. Derived, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineCapabilitySet {
    pub can_browse_recommendations: bool,
    pub can_use_preferences: bool,
    pub can_translate: bool,
    pub can_use_speech: bool,
    pub available_categories: BTreeSet<String>,
    pub available_translation_count: usize,
    pub last_sync_timestamp: Option<EpochMillis>,
}

/// Structured answer to an error raised while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineFallback {
    pub feature: OfflineFeature,
    pub can_fallback: bool,
    pub fallback_data: Option<serde_json::Value>,
    pub message: String,
}

/// Filter for client-side recommendation search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineRecommendationQuery {
    /// Exact category to keep; `None` or `"all"` keeps every category.
    pub category: Option<String>,
    /// Case-insensitive substring matched against name, description and tags.
    pub query: Option<String>,
    pub limit: usize,
}

impl Default for OfflineRecommendationQuery {
    fn default() -> Self {
        Self {
            category: None,
            query: None,
            limit: 20,
        }
    }
}

/// Outcome of one preload task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TaskOutcome {
    Fetched,
    FromCache,
    Failed(String),
}

/// Result of a preload run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadResult {
    pub success: bool,
    pub errors: Vec<String>,
    pub preloaded_items: Vec<String>,
    /// Items that were served from the durable cache because the network failed.
    pub from_cache: Vec<String>,
    /// `true` when preloading was skipped because cached data is fresh and the client is offline.
    pub skipped: bool,
}

/// Cache configuration options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Quota advertised by the file-backed storage. `None` disables quota introspection.
    pub storage_quota_bytes: Option<u64>,
    pub max_cache_size_bytes: u64,
    pub cleanup_interval_secs: u64,
    pub max_entry_age_hours: u64,
    pub near_limit_threshold: f64,
    pub cleanup_trigger_threshold: f64,
    pub critical_threshold: f64,
    pub recommendations_ttl_hours: u64,
    pub essential_ttl_hours: u64,
    pub translations_ttl_hours: u64,
    pub preferences_ttl_hours: u64,
    pub enable_compression: bool,
    pub query_cache_entries: usize,
    pub query_gc_minutes: u64,
    pub preload_timeout_secs: u64,
    pub preload_categories: Vec<String>,
    pub preload_page_size: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            storage_quota_bytes: Some(50 * 1024 * 1024),
            max_cache_size_bytes: 5 * 1024 * 1024,
            cleanup_interval_secs: 3600,
            max_entry_age_hours: 24,
            near_limit_threshold: 0.8,
            cleanup_trigger_threshold: 0.85,
            critical_threshold: 0.9,
            recommendations_ttl_hours: 24,
            essential_ttl_hours: 168,   // 1 week
            translations_ttl_hours: 720, // 30 days
            preferences_ttl_hours: 8760, // 1 year
            enable_compression: false,
            query_cache_entries: 256,
            query_gc_minutes: 30,
            preload_timeout_secs: 15,
            preload_categories: vec![
                "street_food".to_string(),
                "shops".to_string(),
                "markets".to_string(),
            ],
            preload_page_size: 50,
        }
    }
}

impl CacheConfig {
    /// Default time-to-live for a domain. `LastSync` never expires.
    pub fn ttl(&self, domain: CacheDomain) -> Option<Duration> {
        let hours = match domain {
            CacheDomain::Recommendations => self.recommendations_ttl_hours,
            CacheDomain::EssentialData => self.essential_ttl_hours,
            CacheDomain::Translations => self.translations_ttl_hours,
            CacheDomain::UserPreferences => self.preferences_ttl_hours,
            CacheDomain::LastSync => return None,
        };
        Some(Duration::from_millis(hours * HOUR_MS))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn max_entry_age(&self) -> Duration {
        Duration::from_millis(self.max_entry_age_hours * HOUR_MS)
    }

    pub fn preload_timeout(&self) -> Duration {
        Duration::from_secs(self.preload_timeout_secs)
    }

    pub fn query_gc_time(&self) -> Duration {
        Duration::from_secs(self.query_gc_minutes * 60)
    }
}

/// Error types for the offline cache engine
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage quota exceeded: {requested} bytes requested, {available} bytes available")]
    QuotaExceeded { requested: u64, available: u64 },

    #[error("Corrupted cache entry: {0}")]
    CorruptedEntry(String),

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Cache manager requires a running Tokio runtime")]
    RuntimeUnavailable,

    #[error("Storage walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Result type for the offline cache engine
pub type CacheResult<T> = Result<T, CacheError>;
