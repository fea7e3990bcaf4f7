//! In-memory query cache with per-entry staleness.
//!
//! The query cache sits in front of the network for the lifetime of the
//! process. Entries become stale after their stale time but are still served
//! as fallbacks until garbage collection removes them, which happens once an
//! entry is older than both its stale time and the cache-wide gc time.

use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use super::clock::Clock;
use super::lock_unpoisoned;
use super::types::{CacheConfig, CacheResult, EpochMillis};

/// Query keys shared by the preloader and the engine.
pub mod keys {
    use crate::guide_api::RecommendationQuery;

    pub const PREFERENCES: &str = "preferences";
    pub const RECOMMENDATIONS_ALL: &str = "recommendations:all";
    pub const ESSENTIAL: &str = "essential";

    pub fn recommendations_category(category: &str) -> String {
        format!("recommendations:category:{category}")
    }

    /// Key for an arbitrary recommendation request. Plain listings share the
    /// keys the preloader fills.
    pub fn recommendations(query: &RecommendationQuery) -> String {
        let category = query
            .category
            .as_deref()
            .filter(|c| !c.is_empty() && *c != "all");
        if query.is_plain_listing() {
            return match category {
                Some(category) => recommendations_category(category),
                None => RECOMMENDATIONS_ALL.to_string(),
            };
        }
        format!(
            "recommendations:search:{}:{}:{}:{}:{}",
            category.unwrap_or("all"),
            query.query.as_deref().unwrap_or("").trim().to_lowercase(),
            query.location().unwrap_or("").to_lowercase(),
            query.limit.unwrap_or(0),
            query.offset.unwrap_or(0)
        )
    }
}

#[derive(Debug, Clone)]
struct QueryEntry {
    data: serde_json::Value,
    updated_at: EpochMillis,
    stale_time: Duration,
}

impl QueryEntry {
    fn age(&self, now: EpochMillis) -> i64 {
        now.saturating_sub(self.updated_at)
    }

    fn is_stale(&self, now: EpochMillis) -> bool {
        self.age(now) > duration_ms(self.stale_time)
    }

    fn is_collectable(&self, now: EpochMillis, gc_time: Duration) -> bool {
        self.age(now) > duration_ms(self.stale_time.max(gc_time))
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Bounded in-memory cache of query results.
pub struct QueryCache {
    entries: Mutex<LruCache<String, QueryEntry>>,
    clock: Arc<dyn Clock>,
    gc_time: Duration,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("len", &self.len())
            .field("gc_time", &self.gc_time)
            .finish()
    }
}

impl QueryCache {
    pub fn new(clock: Arc<dyn Clock>, capacity: usize, gc_time: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            clock,
            gc_time,
        }
    }

    pub fn from_config(clock: Arc<dyn Clock>, config: &CacheConfig) -> Self {
        Self::new(clock, config.query_cache_entries, config.query_gc_time())
    }

    pub fn set_query_data<T: Serialize + ?Sized>(
        &self,
        key: &str,
        data: &T,
        stale_time: Duration,
    ) -> CacheResult<()> {
        let entry = QueryEntry {
            data: serde_json::to_value(data)?,
            updated_at: self.clock.now_millis(),
            stale_time,
        };
        lock_unpoisoned(&self.entries).put(key.to_string(), entry);
        debug!("Query cache updated: {}", key);
        Ok(())
    }

    /// Cached data for `key`, stale or not, unless it has been collected.
    pub fn get_query_data<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.lookup(key, false)
    }

    /// Cached data for `key` only while it is still fresh.
    pub fn get_fresh<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.lookup(key, true)
    }

    /// Whether `key` needs refetching. Missing keys are stale.
    pub fn is_stale(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        lock_unpoisoned(&self.entries)
            .peek(key)
            .map_or(true, |entry| entry.is_stale(now))
    }

    pub fn invalidate(&self, key: &str) -> bool {
        lock_unpoisoned(&self.entries).pop(key).is_some()
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.entries).clear();
        debug!("Query cache cleared");
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup<T: DeserializeOwned>(&self, key: &str, fresh_only: bool) -> Option<T> {
        let now = self.clock.now_millis();
        let mut entries = lock_unpoisoned(&self.entries);
        let entry = entries.get(key)?;
        if entry.is_collectable(now, self.gc_time) {
            entries.pop(key);
            debug!("Query cache entry collected: {}", key);
            return None;
        }
        if fresh_only && entry.is_stale(now) {
            return None;
        }
        match serde_json::from_value(entry.data.clone()) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Query cache entry {} has unexpected shape: {}", key, e);
                None
            }
        }
    }
}
