//! Essential-data preloading.
//!
//! Four independent tasks run concurrently: user preferences, the default
//! recommendation page, per-category recommendation pages and the bootstrap
//! dataset. Each task writes through to the durable cache and the query
//! cache, falls back to the durable cache when the network fails, and
//! reports a [`TaskOutcome`]. No task failure aborts its siblings.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::durable::DurableCache;
use super::manager::CacheManager;
use super::network::NetworkStatus;
use super::query_cache::{keys, QueryCache};
use super::types::{
    CacheDomain, PreloadResult, TaskOutcome, ALL_RECOMMENDATIONS_KEY, ESSENTIAL_DATA_KEY,
    PREFERENCES_KEY,
};
use crate::guide_api::{
    ApiError, ApiResult, EssentialData, GuideApi, RecommendationQuery, RecommendationResponse,
    UserPreferences,
};

const MINUTE: Duration = Duration::from_secs(60);

/// How long preloaded data may be reused offline without refreshing.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

pub const PREFERENCES_STALE_TIME: Duration = Duration::from_secs(10 * 60);
pub const RECOMMENDATIONS_STALE_TIME: Duration = Duration::from_secs(15 * 60);
pub const CATEGORY_STALE_TIME: Duration = Duration::from_secs(20 * 60);
pub const ESSENTIAL_STALE_TIME: Duration = Duration::from_secs(30 * 60);

/// Durable key of a per-category recommendation page.
pub fn category_cache_key(category: &str) -> String {
    format!("category:{category}")
}

/// Where one preloaded dataset lives.
struct Target<'a> {
    label: &'a str,
    domain: CacheDomain,
    key: &'a str,
    query_key: &'a str,
    stale_time: Duration,
}

/// Warms the durable and query caches from the backend.
#[derive(Debug)]
pub struct DataPreloader {
    cache: Arc<DurableCache>,
    manager: Arc<CacheManager>,
    queries: Arc<QueryCache>,
    api: Arc<dyn GuideApi>,
    network: Arc<NetworkStatus>,
}

impl DataPreloader {
    pub fn new(
        cache: Arc<DurableCache>,
        manager: Arc<CacheManager>,
        queries: Arc<QueryCache>,
        api: Arc<dyn GuideApi>,
        network: Arc<NetworkStatus>,
    ) -> Self {
        Self {
            cache,
            manager,
            queries,
            api,
            network,
        }
    }

    /// Preload everything the application needs to run offline.
    ///
    /// When not forced, a fresh sync and no connectivity skip the run.
    /// `success` is true when at most half of the tasks failed. The last-sync
    /// marker is updated once every task has settled, whatever the outcome.
    pub async fn preload_essential(&self, force_refresh: bool) -> PreloadResult {
        if !force_refresh
            && !self.cache.needs_refresh(REFRESH_INTERVAL)
            && !self.network.is_online()
        {
            debug!("Skipping preload: offline with recent cached data");
            return PreloadResult {
                success: true,
                skipped: true,
                ..Default::default()
            };
        }

        info!("Preloading essential data (force: {})", force_refresh);

        let (preferences, recommendations, categories, essential) = tokio::join!(
            self.preload_preferences(),
            self.preload_recommendations(),
            self.preload_categories(),
            self.preload_essential_data(),
        );

        self.cache.set_last_sync(self.cache.now());

        let outcomes = [
            ("preferences", preferences),
            ("recommendations", recommendations),
            ("categories", categories),
            ("essential_data", essential),
        ];
        let total = outcomes.len();

        let mut result = PreloadResult::default();
        for (name, outcome) in outcomes {
            match outcome {
                TaskOutcome::Fetched => result.preloaded_items.push(name.to_string()),
                TaskOutcome::FromCache => result.from_cache.push(name.to_string()),
                TaskOutcome::Failed(reason) => result.errors.push(reason),
            }
        }
        result.success = result.errors.len() <= total / 2;

        if result.success {
            info!(
                "Preload finished: {} fetched, {} from cache, {} failed",
                result.preloaded_items.len(),
                result.from_cache.len(),
                result.errors.len()
            );
        } else {
            warn!(
                "Preload failed: {} of {} tasks failed",
                result.errors.len(),
                total
            );
        }
        result
    }

    /// Drop every cached query and durable entry, then preload from scratch.
    pub async fn force_refresh(&self) -> PreloadResult {
        self.queries.clear();
        self.manager.clear_all();
        self.preload_essential(true).await
    }

    async fn preload_preferences(&self) -> TaskOutcome {
        let target = Target {
            label: "preferences",
            domain: CacheDomain::UserPreferences,
            key: PREFERENCES_KEY,
            query_key: keys::PREFERENCES,
            stale_time: PREFERENCES_STALE_TIME,
        };
        self.preload::<UserPreferences, _>(&target, self.api.fetch_preferences())
            .await
    }

    async fn preload_recommendations(&self) -> TaskOutcome {
        let query = RecommendationQuery::all(self.cache.config().preload_page_size);
        let target = Target {
            label: "recommendations",
            domain: CacheDomain::Recommendations,
            key: ALL_RECOMMENDATIONS_KEY,
            query_key: keys::RECOMMENDATIONS_ALL,
            stale_time: RECOMMENDATIONS_STALE_TIME,
        };
        self.preload::<RecommendationResponse, _>(&target, self.api.fetch_recommendations(&query))
            .await
    }

    /// One task over every configured category; fails if any category has
    /// neither fresh nor cached data.
    async fn preload_categories(&self) -> TaskOutcome {
        let config = self.cache.config();
        let page_size = config.preload_page_size;

        let outcomes = futures::future::join_all(config.preload_categories.iter().map(
            |category| async move {
                let query = RecommendationQuery::category(category.as_str(), page_size);
                let key = category_cache_key(category);
                let query_key = keys::recommendations_category(category);
                let target = Target {
                    label: category,
                    domain: CacheDomain::Recommendations,
                    key: &key,
                    query_key: &query_key,
                    stale_time: CATEGORY_STALE_TIME,
                };
                self.preload::<RecommendationResponse, _>(
                    &target,
                    self.api.fetch_recommendations(&query),
                )
                .await
            },
        ))
        .await;

        let failures: Vec<String> = outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                TaskOutcome::Failed(reason) => Some(reason.clone()),
                TaskOutcome::Fetched | TaskOutcome::FromCache => None,
            })
            .collect();

        if !failures.is_empty() {
            TaskOutcome::Failed(format!("categories: {}", failures.join("; ")))
        } else if outcomes.contains(&TaskOutcome::FromCache) {
            TaskOutcome::FromCache
        } else {
            TaskOutcome::Fetched
        }
    }

    async fn preload_essential_data(&self) -> TaskOutcome {
        let target = Target {
            label: "essential_data",
            domain: CacheDomain::EssentialData,
            key: ESSENTIAL_DATA_KEY,
            query_key: keys::ESSENTIAL,
            stale_time: ESSENTIAL_STALE_TIME,
        };
        self.preload::<EssentialData, _>(&target, self.api.fetch_essential_data())
            .await
    }

    async fn preload<T, F>(&self, target: &Target<'_>, fetch: F) -> TaskOutcome
    where
        T: Serialize + DeserializeOwned,
        F: Future<Output = ApiResult<T>>,
    {
        match self.fetch_with_timeout(fetch).await {
            Ok(value) => {
                if let Err(e) = self.cache.put_default(target.domain, target.key, &value) {
                    warn!("Failed to cache preloaded {}: {}", target.label, e);
                }
                self.remember(target, &value);
                debug!("Preloaded {}", target.label);
                TaskOutcome::Fetched
            }
            Err(e) => {
                warn!("Preload of {} failed: {}", target.label, e);
                match self.cache.get::<T>(target.domain, target.key) {
                    Some(cached) => {
                        self.remember(target, &cached);
                        debug!("Using cached {} after failed preload", target.label);
                        TaskOutcome::FromCache
                    }
                    None => TaskOutcome::Failed(format!("{}: {}", target.label, e)),
                }
            }
        }
    }

    /// Run `fetch` under the preload timeout. Offline runs fail fast without
    /// touching the network.
    async fn fetch_with_timeout<T, F>(&self, fetch: F) -> ApiResult<T>
    where
        F: Future<Output = ApiResult<T>>,
    {
        if !self.network.is_online() {
            return Err(ApiError::NotConnected);
        }
        let timeout = self.cache.config().preload_timeout();
        tokio::time::timeout(timeout, fetch)
            .await
            .unwrap_or(Err(ApiError::Timeout(timeout)))
    }

    fn remember<T: Serialize>(&self, target: &Target<'_>, value: &T) {
        if let Err(e) = self
            .queries
            .set_query_data(target.query_key, value, target.stale_time)
        {
            warn!("Failed to populate query cache for {}: {}", target.label, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guide_api::testing::MockGuideApi;
    use crate::offline_cache::clock::{Clock, ManualClock};
    use crate::offline_cache::quota::QuotaMonitor;
    use crate::offline_cache::storage::MemoryStorage;

    struct Fixture {
        clock: Arc<ManualClock>,
        cache: Arc<DurableCache>,
        queries: Arc<QueryCache>,
        network: Arc<NetworkStatus>,
        api: Arc<MockGuideApi>,
        preloader: DataPreloader,
    }

    fn fixture(api: MockGuideApi) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let storage = Arc::new(MemoryStorage::new());
        let cache = Arc::new(DurableCache::new(storage.clone(), clock.clone()));
        let quota = Arc::new(QuotaMonitor::new(storage, 0.8));
        let manager = Arc::new(CacheManager::new(cache.clone(), quota));
        let queries = Arc::new(QueryCache::new(clock.clone(), 64, 30 * MINUTE));
        let network = Arc::new(NetworkStatus::new(true));
        let api = Arc::new(api);
        let preloader = DataPreloader::new(
            cache.clone(),
            manager,
            queries.clone(),
            api.clone(),
            network.clone(),
        );
        Fixture {
            clock,
            cache,
            queries,
            network,
            api,
            preloader,
        }
    }

    #[tokio::test]
    async fn test_all_tasks_fetched() {
        let f = fixture(MockGuideApi::with_sample_data());
        let result = f.preloader.preload_essential(false).await;

        assert!(result.success);
        assert!(result.errors.is_empty());
        assert_eq!(
            result.preloaded_items,
            vec!["preferences", "recommendations", "categories", "essential_data"]
        );
        assert_eq!(f.cache.last_sync(), Some(f.clock.now_millis()));
        assert!(f
            .cache
            .get::<RecommendationResponse>(CacheDomain::Recommendations, "category:shops")
            .is_some());
        assert!(f
            .queries
            .get_fresh::<UserPreferences>(keys::PREFERENCES)
            .is_some());
    }

    #[tokio::test]
    async fn test_category_failure_without_cache_is_tolerated() {
        let api = MockGuideApi::with_sample_data();
        api.fail_category("markets");
        let f = fixture(api);

        let result = f.preloader.preload_essential(false).await;
        assert!(result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("categories: markets"));
        assert!(f.cache.last_sync().is_some());
    }

    #[tokio::test]
    async fn test_failed_tasks_fall_back_to_durable_cache() {
        let f = fixture(MockGuideApi::with_sample_data());
        f.preloader.preload_essential(false).await;
        f.queries.clear();

        f.api.set_failing(true);
        let result = f.preloader.preload_essential(true).await;
        assert!(result.success);
        assert!(result.errors.is_empty());
        assert_eq!(result.from_cache.len(), 4);
        assert!(f
            .queries
            .get_query_data::<RecommendationResponse>(keys::RECOMMENDATIONS_ALL)
            .is_some());
    }

    #[tokio::test]
    async fn test_majority_failure_reports_unsuccessful() {
        let api = MockGuideApi::with_sample_data();
        api.set_failing(true);
        let f = fixture(api);

        let result = f.preloader.preload_essential(false).await;
        assert!(!result.success);
        assert_eq!(result.errors.len(), 4);
        // Attempts count as a sync even when every task failed.
        assert!(f.cache.last_sync().is_some());
    }

    #[tokio::test]
    async fn test_offline_with_fresh_sync_skips() {
        let f = fixture(MockGuideApi::with_sample_data());
        f.preloader.preload_essential(false).await;
        let calls = f.api.call_count();

        f.network.set_online(false);
        let result = f.preloader.preload_essential(false).await;
        assert!(result.success);
        assert!(result.skipped);
        assert_eq!(f.api.call_count(), calls);
    }

    #[tokio::test]
    async fn test_offline_forced_preload_uses_cache_without_network() {
        let f = fixture(MockGuideApi::with_sample_data());
        f.preloader.preload_essential(false).await;
        let calls = f.api.call_count();

        f.network.set_online(false);
        let result = f.preloader.preload_essential(true).await;
        assert!(!result.skipped);
        assert_eq!(result.from_cache.len(), 4);
        assert_eq!(f.api.call_count(), calls);
    }

    #[tokio::test]
    async fn test_force_refresh_clears_then_reloads() {
        let f = fixture(MockGuideApi::with_sample_data());
        f.cache
            .put(CacheDomain::Recommendations, "category:crafts", &"old", MINUTE)
            .unwrap();
        f.queries.set_query_data("stale", &1, MINUTE).unwrap();

        let result = f.preloader.force_refresh().await;
        assert!(result.success);
        assert!(f.queries.get_query_data::<i32>("stale").is_none());
        assert!(!f
            .cache
            .domain_keys(CacheDomain::Recommendations)
            .contains(&"category:crafts".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_task_times_out() {
        let api = MockGuideApi::with_sample_data();
        api.hang_essential(true);
        let f = fixture(api);

        let result = f.preloader.preload_essential(false).await;
        assert!(result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("timed out"));
    }
}
