//! Durable key/value cache with timestamped, TTL-bearing envelopes.
//!
//! Values are wrapped in a [`CacheEnvelope`] and written as JSON under a
//! domain-prefixed key. Reads are self-healing: an entry that fails to parse
//! or has expired is deleted and reported as absent. Writes are advisory and
//! never fail the caller because storage is full; a quota-exceeded event is
//! broadcast instead so the cache manager can react.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::lock_unpoisoned;
use super::storage::StorageBackend;
use super::types::{
    CacheConfig, CacheDomain, CacheEnvelope, CacheError, CacheEvent, CacheMetrics,
    CacheOperation, CacheOperationResult, CacheResult, EntryInfo, EnvelopeHeader, EpochMillis,
    WriteOutcome, TRANSLATION_MAP_KEY,
};

type TranslationMap = BTreeMap<String, String>;

/// Internal cache statistics
#[derive(Debug, Default)]
struct InternalCacheStats {
    hits: u64,
    misses: u64,
    writes: u64,
    evictions: u64,
    dropped_writes: u64,
}

/// Durable cache over a shared [`StorageBackend`].
#[derive(Debug)]
pub struct DurableCache {
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    events: broadcast::Sender<CacheEvent>,
    stats: Mutex<InternalCacheStats>,
    /// Serializes read-modify-write of the translation mapping.
    translation_lock: Mutex<()>,
}

impl DurableCache {
    /// Create a durable cache with the default configuration
    pub fn new(storage: Arc<dyn StorageBackend>, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(storage, clock, CacheConfig::default())
    }

    /// Create a durable cache with custom configuration
    pub fn with_config(
        storage: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            storage,
            clock,
            config,
            events,
            stats: Mutex::new(InternalCacheStats::default()),
            translation_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn now(&self) -> EpochMillis {
        self.clock.now_millis()
    }

    /// Subscribe to quota-exceeded signals.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Store `value` under `key` in `domain`, expiring after `ttl`.
    ///
    /// Returns an error only for malformed arguments or values that cannot be
    /// serialized. A full storage yields `Ok(WriteOutcome::QuotaExceeded)`.
    pub fn put<T: Serialize + ?Sized>(
        &self,
        domain: CacheDomain,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> CacheResult<WriteOutcome> {
        if domain == CacheDomain::LastSync {
            return Err(CacheError::InvalidArgument(
                "the last-sync marker is written with set_last_sync".to_string(),
            ));
        }
        validate_key(key)?;
        if ttl.as_millis() == 0 {
            return Err(CacheError::InvalidArgument(format!(
                "ttl for {}:{key} must be at least one millisecond",
                domain.as_str()
            )));
        }

        let envelope = CacheEnvelope::new(value, self.now(), ttl);
        let bytes = serde_json::to_vec(&envelope)?;
        Ok(self.write_raw(&domain.storage_key(key), &bytes))
    }

    /// Store `value` using the domain's configured TTL.
    pub fn put_default<T: Serialize + ?Sized>(
        &self,
        domain: CacheDomain,
        key: &str,
        value: &T,
    ) -> CacheResult<WriteOutcome> {
        let ttl = self.config.ttl(domain).ok_or_else(|| {
            CacheError::InvalidArgument(format!("{} has no default ttl", domain.as_str()))
        })?;
        self.put(domain, key, value, ttl)
    }

    /// Read the value stored under `key`, or `None` if it is missing,
    /// expired or unreadable. Expired and unreadable entries are deleted.
    pub fn get<T: DeserializeOwned>(&self, domain: CacheDomain, key: &str) -> Option<T> {
        let found = self
            .load_envelope::<T>(&domain.storage_key(key))
            .map(|envelope| envelope.data);
        self.record_lookup(found.is_some());
        if found.is_some() {
            debug!("Cache hit for: {}:{}", domain.as_str(), key);
        } else {
            debug!("Cache miss for: {}:{}", domain.as_str(), key);
        }
        found
    }

    /// Remove an entry from cache
    pub fn remove(&self, domain: CacheDomain, key: &str) -> bool {
        let storage_key = domain.storage_key(key);
        match self.storage.delete(&storage_key) {
            Ok(existed) => {
                if existed {
                    debug!("Removed cache entry: {}", storage_key);
                }
                existed
            }
            Err(e) => {
                warn!("Failed to remove cache entry {}: {}", storage_key, e);
                false
            }
        }
    }

    /// Delete every cache-owned key. Keys outside the cache's domains are left alone.
    pub fn clear_all(&self) -> CacheOperationResult {
        let entries = self.entries().unwrap_or_else(|e| {
            warn!("Failed to list cache entries: {}", e);
            Vec::new()
        });

        let mut items_affected = 0;
        let mut size_freed = 0u64;
        for entry in &entries {
            if matches!(self.storage.delete(&entry.storage_key), Ok(true)) {
                items_affected += 1;
                size_freed += entry.size_bytes;
            }
        }

        info!(
            "Cleared all cache entries: {} items, {} bytes freed",
            items_affected, size_freed
        );

        CacheOperationResult {
            operation: CacheOperation::Clear,
            success: items_affected == entries.len(),
            message: format!("Cleared {items_affected} items, freed {size_freed} bytes"),
            items_affected,
            size_freed_bytes: size_freed,
        }
    }

    /// Add one translation to the aggregated translation mapping.
    ///
    /// The mapping carries a single envelope: entries added while it is live
    /// share its expiration, and the first write after it expires starts a
    /// new mapping with a fresh domain TTL.
    pub fn put_translation(&self, cache_key: &str, text: &str) -> CacheResult<WriteOutcome> {
        validate_key(cache_key)?;
        let storage_key = CacheDomain::Translations.storage_key(TRANSLATION_MAP_KEY);
        let ttl = self
            .config
            .ttl(CacheDomain::Translations)
            .unwrap_or(Duration::from_secs(30 * 24 * 3600));

        let _guard = lock_unpoisoned(&self.translation_lock);
        let mut envelope = self
            .load_envelope::<TranslationMap>(&storage_key)
            .unwrap_or_else(|| CacheEnvelope::new(TranslationMap::new(), self.now(), ttl));
        envelope
            .data
            .insert(cache_key.to_string(), text.to_string());

        let bytes = serde_json::to_vec(&envelope)?;
        Ok(self.write_raw(&storage_key, &bytes))
    }

    /// Look up one translation in the aggregated mapping.
    pub fn get_translation(&self, cache_key: &str) -> Option<String> {
        let found = self
            .load_envelope::<TranslationMap>(
                &CacheDomain::Translations.storage_key(TRANSLATION_MAP_KEY),
            )
            .and_then(|mut envelope| envelope.data.remove(cache_key));
        self.record_lookup(found.is_some());
        found
    }

    /// Number of live translations in the mapping.
    pub fn translation_count(&self) -> usize {
        self.load_envelope::<TranslationMap>(
            &CacheDomain::Translations.storage_key(TRANSLATION_MAP_KEY),
        )
        .map(|envelope| envelope.data.len())
        .unwrap_or(0)
    }

    /// Record the time of the last sync attempt.
    pub fn set_last_sync(&self, at: EpochMillis) -> WriteOutcome {
        self.write_raw(CacheDomain::LastSync.prefix(), at.to_string().as_bytes())
    }

    /// Time of the last sync attempt, if any.
    pub fn last_sync(&self) -> Option<EpochMillis> {
        let storage_key = CacheDomain::LastSync.prefix();
        let bytes = self.read_bytes(storage_key)?;
        match serde_json::from_slice::<EpochMillis>(&bytes) {
            Ok(at) => Some(at),
            Err(e) => {
                warn!("Removing corrupted last-sync marker: {}", e);
                self.discard(storage_key);
                None
            }
        }
    }

    /// Whether cached data is older than `max_age`, or no sync has ever happened.
    pub fn needs_refresh(&self, max_age: Duration) -> bool {
        match self.last_sync() {
            None => true,
            Some(at) => {
                let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
                self.now().saturating_sub(at) > max_age_ms
            }
        }
    }

    /// Whether `domain` holds at least one live, readable entry. Never deletes.
    pub fn has_live_entries(&self, domain: CacheDomain) -> bool {
        let now = self.now();
        self.entries()
            .map(|entries| {
                entries
                    .iter()
                    .any(|e| e.domain == domain && !e.corrupted && !e.is_expired(now))
            })
            .unwrap_or(false)
    }

    /// Domain-local keys currently stored in `domain`, ascending.
    pub fn domain_keys(&self, domain: CacheDomain) -> Vec<String> {
        match self.storage.keys() {
            Ok(keys) => keys
                .iter()
                .filter_map(|k| CacheDomain::parse_storage_key(k))
                .filter(|(d, _)| *d == domain)
                .map(|(_, key)| key.to_string())
                .collect(),
            Err(e) => {
                warn!("Failed to list cache keys: {}", e);
                Vec::new()
            }
        }
    }

    /// Metadata for every cache-owned entry, in key order.
    pub fn entries(&self) -> CacheResult<Vec<EntryInfo>> {
        let mut entries = Vec::new();
        for storage_key in self.storage.keys()? {
            let Some((domain, _)) = CacheDomain::parse_storage_key(&storage_key) else {
                continue;
            };
            match self.storage.read(&storage_key) {
                Ok(Some(bytes)) => {
                    let size_bytes = (storage_key.len() + bytes.len()) as u64;
                    entries.push(describe_entry(storage_key, domain, size_bytes, &bytes));
                }
                Ok(None) => {}
                Err(CacheError::CorruptedEntry(_)) => entries.push(EntryInfo {
                    size_bytes: storage_key.len() as u64,
                    storage_key,
                    domain,
                    timestamp: None,
                    expiration: None,
                    corrupted: true,
                }),
                Err(e) => warn!("Failed to inspect cache entry {}: {}", storage_key, e),
            }
        }
        Ok(entries)
    }

    /// Delete a raw entry on behalf of the cache manager.
    pub(crate) fn evict(&self, storage_key: &str) -> bool {
        match self.storage.delete(storage_key) {
            Ok(existed) => {
                if existed {
                    lock_unpoisoned(&self.stats).evictions += 1;
                }
                existed
            }
            Err(e) => {
                warn!("Failed to evict cache entry {}: {}", storage_key, e);
                false
            }
        }
    }

    /// Counters since this cache was created.
    pub fn metrics(&self) -> CacheMetrics {
        let stats = lock_unpoisoned(&self.stats);
        let lookups = stats.hits + stats.misses;
        CacheMetrics {
            hits: stats.hits,
            misses: stats.misses,
            writes: stats.writes,
            evictions: stats.evictions,
            dropped_writes: stats.dropped_writes,
            hit_rate: if lookups > 0 {
                stats.hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }

    fn write_raw(&self, storage_key: &str, bytes: &[u8]) -> WriteOutcome {
        match self.storage.write(storage_key, bytes) {
            Ok(()) => {
                lock_unpoisoned(&self.stats).writes += 1;
                debug!("Stored cache entry: {}", storage_key);
                WriteOutcome::Stored
            }
            Err(CacheError::QuotaExceeded {
                requested,
                available,
            }) => {
                lock_unpoisoned(&self.stats).dropped_writes += 1;
                warn!(
                    "Storage quota exceeded writing {} ({} bytes, {} available); write dropped",
                    storage_key, requested, available
                );
                // No subscriber simply means no manager is running.
                let _ = self.events.send(CacheEvent::QuotaExceeded {
                    storage_key: storage_key.to_string(),
                    requested_bytes: requested,
                });
                WriteOutcome::QuotaExceeded
            }
            Err(e) => {
                lock_unpoisoned(&self.stats).dropped_writes += 1;
                warn!("Failed to store cache entry {}: {}", storage_key, e);
                WriteOutcome::Dropped
            }
        }
    }

    fn read_bytes(&self, storage_key: &str) -> Option<Vec<u8>> {
        match self.storage.read(storage_key) {
            Ok(bytes) => bytes,
            Err(CacheError::CorruptedEntry(reason)) => {
                warn!("Removing corrupted cache entry {}: {}", storage_key, reason);
                self.discard(storage_key);
                None
            }
            Err(e) => {
                warn!("Failed to read cache entry {}: {}", storage_key, e);
                None
            }
        }
    }

    fn load_envelope<T: DeserializeOwned>(&self, storage_key: &str) -> Option<CacheEnvelope<T>> {
        let bytes = self.read_bytes(storage_key)?;
        let envelope: CacheEnvelope<T> = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Removing corrupted cache entry {}: {}", storage_key, e);
                self.discard(storage_key);
                return None;
            }
        };
        if envelope.is_expired(self.now()) {
            debug!("Removing expired cache entry: {}", storage_key);
            self.discard(storage_key);
            return None;
        }
        Some(envelope)
    }

    fn discard(&self, storage_key: &str) {
        if let Err(e) = self.storage.delete(storage_key) {
            warn!("Failed to delete cache entry {}: {}", storage_key, e);
        }
    }

    fn record_lookup(&self, hit: bool) {
        let mut stats = lock_unpoisoned(&self.stats);
        if hit {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
    }
}

fn validate_key(key: &str) -> CacheResult<()> {
    if key.trim().is_empty() {
        return Err(CacheError::InvalidKey("cache key cannot be empty".to_string()));
    }
    Ok(())
}

fn describe_entry(
    storage_key: String,
    domain: CacheDomain,
    size_bytes: u64,
    bytes: &[u8],
) -> EntryInfo {
    let (timestamp, expiration, corrupted) = if domain == CacheDomain::LastSync {
        match serde_json::from_slice::<EpochMillis>(bytes) {
            Ok(at) => (Some(at), None, false),
            Err(_) => (None, None, true),
        }
    } else {
        match serde_json::from_slice::<EnvelopeHeader>(bytes) {
            Ok(header) => (Some(header.timestamp), Some(header.expiration), false),
            Err(_) => (None, None, true),
        }
    };
    EntryInfo {
        storage_key,
        domain,
        size_bytes,
        timestamp,
        expiration,
        corrupted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline_cache::clock::ManualClock;
    use crate::offline_cache::storage::MemoryStorage;

    fn cache_at(start: EpochMillis) -> (DurableCache, Arc<ManualClock>, Arc<MemoryStorage>) {
        let clock = Arc::new(ManualClock::new(start));
        let storage = Arc::new(MemoryStorage::new());
        let cache = DurableCache::new(storage.clone(), clock.clone());
        (cache, clock, storage)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (cache, _, _) = cache_at(1_000);
        let outcome = cache
            .put(CacheDomain::Recommendations, "all", &vec!["a", "b"], Duration::from_secs(60))
            .unwrap();
        assert!(outcome.is_stored());
        let value: Option<Vec<String>> = cache.get(CacheDomain::Recommendations, "all");
        assert_eq!(value, Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_envelope_layout_on_storage() {
        let (cache, _, storage) = cache_at(5_000);
        cache
            .put(CacheDomain::UserPreferences, "current", &42, Duration::from_millis(10))
            .unwrap();
        let raw = storage.read("lg_prefs:current").unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["data"], 42);
        assert_eq!(json["timestamp"], 5_000);
        assert_eq!(json["expiration"], 5_010);
    }

    #[test]
    fn test_expired_entry_is_removed_on_read() {
        let (cache, clock, storage) = cache_at(0);
        cache
            .put(CacheDomain::Translations, "x", "y", Duration::from_millis(100))
            .unwrap();
        clock.set(100);
        assert_eq!(cache.get::<String>(CacheDomain::Translations, "x"), Some("y".into()));
        clock.set(101);
        assert_eq!(cache.get::<String>(CacheDomain::Translations, "x"), None);
        assert_eq!(storage.read("lg_translations:x").unwrap(), None);
    }

    #[test]
    fn test_corrupted_entry_self_heals() {
        let (cache, _, storage) = cache_at(0);
        storage.write("lg_rec:all", b"{not json").unwrap();
        assert_eq!(cache.get::<Vec<String>>(CacheDomain::Recommendations, "all"), None);
        assert_eq!(storage.read("lg_rec:all").unwrap(), None);
    }

    #[test]
    fn test_invalid_arguments() {
        let (cache, _, _) = cache_at(0);
        assert!(matches!(
            cache.put(CacheDomain::Recommendations, "", &1, Duration::from_secs(1)),
            Err(CacheError::InvalidKey(_))
        ));
        assert!(matches!(
            cache.put(CacheDomain::Recommendations, "k", &1, Duration::ZERO),
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            cache.put(CacheDomain::LastSync, "k", &1, Duration::from_secs(1)),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_sub_millisecond_ttl_is_rejected() {
        let (cache, _, storage) = cache_at(5);
        assert!(matches!(
            cache.put(CacheDomain::Recommendations, "k", &1, Duration::from_micros(500)),
            Err(CacheError::InvalidArgument(_))
        ));
        assert_eq!(storage.read("lg_rec:k").unwrap(), None);
        assert!(cache
            .put(CacheDomain::Recommendations, "k", &1, Duration::from_millis(1))
            .unwrap()
            .is_stored());
    }

    #[test]
    fn test_quota_exceeded_is_signalled_not_raised() {
        let clock = Arc::new(ManualClock::new(0));
        let storage = Arc::new(MemoryStorage::with_quota(64));
        let cache = DurableCache::new(storage, clock);
        let mut events = cache.subscribe();

        let outcome = cache
            .put(CacheDomain::Recommendations, "all", &"x".repeat(200), Duration::from_secs(1))
            .unwrap();
        assert_eq!(outcome, WriteOutcome::QuotaExceeded);
        assert!(matches!(
            events.try_recv(),
            Ok(CacheEvent::QuotaExceeded { ref storage_key, .. }) if storage_key == "lg_rec:all"
        ));
        assert_eq!(cache.metrics().dropped_writes, 1);
    }

    #[test]
    fn test_translation_mapping_shares_one_ttl() {
        let (cache, clock, _) = cache_at(0);
        cache.put_translation("auto-en-namaste", "hello").unwrap();
        clock.advance(Duration::from_secs(10 * 24 * 3600));
        cache.put_translation("auto-en-dhanyavaad", "thank you").unwrap();
        assert_eq!(cache.translation_count(), 2);

        // 30 days after the first write the whole mapping expires together.
        clock.set(30 * 24 * 3600 * 1000 + 1);
        assert_eq!(cache.get_translation("auto-en-dhanyavaad"), None);
        assert_eq!(cache.translation_count(), 0);
    }

    #[test]
    fn test_concurrent_translations_are_all_kept() {
        let (cache, _, _) = cache_at(0);
        let cache = Arc::new(cache);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        cache
                            .put_translation(&format!("auto-en-{t}-{i}"), "text")
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.translation_count(), 800);
        assert_eq!(cache.get_translation("auto-en-7-99").as_deref(), Some("text"));
    }

    #[test]
    fn test_needs_refresh() {
        let (cache, clock, _) = cache_at(10_000);
        assert!(cache.needs_refresh(Duration::from_secs(3600)));
        cache.set_last_sync(10_000);
        assert!(!cache.needs_refresh(Duration::from_secs(3600)));
        clock.advance(Duration::from_secs(3601));
        assert!(cache.needs_refresh(Duration::from_secs(3600)));
    }

    #[test]
    fn test_clear_all_leaves_foreign_keys() {
        let (cache, _, storage) = cache_at(0);
        storage.write("other_app:key", b"keep").unwrap();
        cache
            .put(CacheDomain::Recommendations, "all", &1, Duration::from_secs(1))
            .unwrap();
        cache.set_last_sync(0);

        let result = cache.clear_all();
        assert!(result.success);
        assert_eq!(result.items_affected, 2);
        assert_eq!(storage.keys().unwrap(), vec!["other_app:key".to_string()]);
    }

    #[test]
    fn test_entries_describe_corruption() {
        let (cache, _, storage) = cache_at(0);
        cache
            .put(CacheDomain::Recommendations, "all", &1, Duration::from_secs(1))
            .unwrap();
        storage.write("lg_rec:broken", b"garbage").unwrap();
        cache.set_last_sync(77);

        let entries = cache.entries().unwrap();
        assert_eq!(entries.len(), 3);
        let broken = entries.iter().find(|e| e.storage_key == "lg_rec:broken").unwrap();
        assert!(broken.corrupted);
        assert_eq!(broken.eviction_timestamp(), 0);
        let marker = entries.iter().find(|e| e.domain == CacheDomain::LastSync).unwrap();
        assert_eq!(marker.timestamp, Some(77));
        assert_eq!(marker.expiration, None);
    }
}
