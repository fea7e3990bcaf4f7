//! Offline cache engine
//!
//! Durable TTL cache, eviction policy, quota monitoring, essential-data
//! preloading and offline fallback for The Local Guide. [`OfflineEngine`]
//! wires the pieces together and is what the application holds.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

pub mod clock;
pub mod durable;
pub mod fallback;
pub mod manager;
pub mod network;
pub mod preloader;
pub mod query_cache;
pub mod quota;
pub mod storage;
pub mod types;

use crate::guide_api::{
    ApiError, ApiResult, GuideApi, RecommendationItem, RecommendationQuery,
    RecommendationResponse, TranslationRequest, TranslationResponse, UserPreferences,
    UserPreferencesUpdate,
};
use clock::{Clock, SystemClock};
use durable::DurableCache;
use fallback::OfflineOrchestrator;
use manager::CacheManager;
use network::NetworkStatus;
use preloader::{category_cache_key, DataPreloader};
use query_cache::{keys, QueryCache};
use quota::QuotaMonitor;
use storage::{FileStorage, StorageBackend};
use types::*;

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Composition root of the offline cache.
#[derive(Debug)]
pub struct OfflineEngine {
    cache: Arc<DurableCache>,
    manager: Arc<CacheManager>,
    quota: Arc<QuotaMonitor>,
    queries: Arc<QueryCache>,
    preloader: DataPreloader,
    offline: OfflineOrchestrator,
    api: Arc<dyn GuideApi>,
    network: Arc<NetworkStatus>,
}

impl OfflineEngine {
    /// Create an engine persisting to `cache_dir`.
    pub fn new(
        cache_dir: impl AsRef<Path>,
        api: Arc<dyn GuideApi>,
        config: CacheConfig,
    ) -> CacheResult<Self> {
        let storage = Arc::new(FileStorage::with_config(cache_dir, &config)?);
        Ok(Self::with_parts(
            storage,
            Arc::new(SystemClock),
            api,
            Arc::new(NetworkStatus::default()),
            config,
        ))
    }

    /// Create an engine from explicit collaborators.
    pub fn with_parts(
        storage: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        api: Arc<dyn GuideApi>,
        network: Arc<NetworkStatus>,
        config: CacheConfig,
    ) -> Self {
        let quota = Arc::new(QuotaMonitor::new(storage.clone(), config.near_limit_threshold));
        let queries = Arc::new(QueryCache::from_config(clock.clone(), &config));
        let cache = Arc::new(DurableCache::with_config(storage, clock, config));
        let manager = Arc::new(CacheManager::new(cache.clone(), quota.clone()));
        let preloader = DataPreloader::new(
            cache.clone(),
            manager.clone(),
            queries.clone(),
            api.clone(),
            network.clone(),
        );
        let offline = OfflineOrchestrator::new(cache.clone(), network.clone());

        Self {
            cache,
            manager,
            quota,
            queries,
            preloader,
            offline,
            api,
            network,
        }
    }

    pub fn cache(&self) -> &Arc<DurableCache> {
        &self.cache
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    pub fn queries(&self) -> &Arc<QueryCache> {
        &self.queries
    }

    pub fn network(&self) -> &Arc<NetworkStatus> {
        &self.network
    }

    pub fn quota(&self) -> &Arc<QuotaMonitor> {
        &self.quota
    }

    /// Start periodic cleanup. Requires a Tokio runtime.
    pub fn initialize(&self) -> CacheResult<()> {
        self.manager.initialize()
    }

    pub fn destroy(&self) {
        self.manager.destroy();
    }

    /// Refresh the connectivity flag from the backend health endpoint.
    pub async fn probe_network(&self) -> bool {
        self.network.probe(self.api.as_ref()).await
    }

    pub async fn preload_essential(&self, force_refresh: bool) -> PreloadResult {
        self.preloader.preload_essential(force_refresh).await
    }

    pub async fn force_refresh(&self) -> PreloadResult {
        self.preloader.force_refresh().await
    }

    pub fn default_cleanup_options(&self) -> CleanupOptions {
        self.manager.default_cleanup_options()
    }

    pub fn perform_cleanup(&self, options: CleanupOptions) -> Option<CleanupReport> {
        self.manager.perform_cleanup(options)
    }

    pub fn perform_emergency_cleanup(&self) -> Option<CacheOperationResult> {
        self.manager.perform_emergency_cleanup()
    }

    /// Drop the query cache and every durable entry.
    pub fn clear_all_caches(&self) -> CacheOperationResult {
        self.queries.clear();
        self.manager.clear_all()
    }

    pub fn check_storage_health(&self) -> Option<CacheHealthReport> {
        self.manager.check_storage_health()
    }

    pub fn get_cache_stats(&self) -> Option<CacheStatsSummary> {
        self.manager.get_cache_stats()
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }

    pub fn quota_snapshot(&self) -> StorageQuotaSnapshot {
        self.quota.get_quota_snapshot()
    }

    pub fn is_available_offline(&self, feature: OfflineFeature) -> bool {
        self.offline.is_available_offline(feature)
    }

    pub fn get_offline_recommendations(
        &self,
        query: &OfflineRecommendationQuery,
    ) -> Vec<RecommendationItem> {
        self.offline.get_offline_recommendations(query)
    }

    pub fn get_offline_translation(
        &self,
        text: &str,
        target_language: &str,
        source_language: Option<&str>,
    ) -> Option<String> {
        self.offline
            .get_offline_translation(text, target_language, source_language)
    }

    pub fn get_offline_capabilities(&self) -> OfflineCapabilitySet {
        self.offline.get_offline_capabilities()
    }

    pub fn handle_offline_error<E: std::fmt::Display>(
        &self,
        error: E,
        feature: OfflineFeature,
    ) -> Result<OfflineFallback, E> {
        self.offline.handle_offline_error(error, feature)
    }

    /// Recommendations through the query cache, the network and, when
    /// offline, the durable cache.
    pub async fn recommendations(
        &self,
        query: &RecommendationQuery,
    ) -> ApiResult<RecommendationResponse> {
        let query_key = keys::recommendations(query);
        if let Some(fresh) = self.queries.get_fresh::<RecommendationResponse>(&query_key) {
            if covers_limit(&fresh, query.limit) {
                debug!("Serving recommendations from query cache: {}", query_key);
                return Ok(limit_page(fresh, query.limit));
            }
        }

        let error = match self.live(self.api.fetch_recommendations(query)).await {
            Ok(response) => {
                // Short listings must not replace the preloaded page they share keys with.
                let full_page = query
                    .limit
                    .map_or(true, |limit| limit >= self.cache.config().preload_page_size);
                match durable_recommendation_key(query) {
                    Some(durable_key) if full_page => {
                        if let Err(e) = self.cache.put_default(
                            CacheDomain::Recommendations,
                            &durable_key,
                            &response,
                        ) {
                            warn!("Failed to cache recommendations: {}", e);
                        }
                        self.remember(&query_key, &response, preloader::RECOMMENDATIONS_STALE_TIME);
                    }
                    Some(_) => {}
                    None => {
                        self.remember(&query_key, &response, preloader::RECOMMENDATIONS_STALE_TIME);
                    }
                }
                return Ok(response);
            }
            Err(e) => e,
        };

        if let Some(stale) = self.queries.get_query_data::<RecommendationResponse>(&query_key) {
            debug!("Serving stale recommendations after error: {}", error);
            return Ok(limit_page(stale, query.limit));
        }

        let fallback = self
            .offline
            .handle_offline_error(error, OfflineFeature::Recommendations)?;
        let items = self.get_offline_recommendations(&OfflineRecommendationQuery {
            category: query.category.clone(),
            query: query.query.clone(),
            limit: query.limit.map_or(20, |limit| limit as usize),
        });
        if items.is_empty() {
            return Err(ApiError::Unavailable(fallback.message));
        }
        Ok(RecommendationResponse {
            total: items.len(),
            page_size: u32::try_from(items.len()).unwrap_or(u32::MAX),
            items,
            category: query.category.clone(),
            query: query.query.clone(),
            page: 1,
            has_next: false,
        })
    }

    /// Translate through the translation cache. Live results are cached
    /// when the user's preferences allow it.
    pub async fn translate(&self, request: &TranslationRequest) -> ApiResult<TranslationResponse> {
        let cache_key = translation_cache_key(
            &request.text,
            &request.target_language,
            request.source_language.as_deref(),
        );
        if let Some(translated) = self.cache.get_translation(&cache_key) {
            debug!("Translation served from cache");
            return Ok(TranslationResponse {
                original_text: request.text.clone(),
                translated_text: translated,
                confidence: 1.0,
                detected_language: request.source_language.clone(),
                target_language: request.target_language.clone(),
                cached: true,
                slang_enhanced: false,
                processing_time_ms: None,
            });
        }

        let response = self.live(self.api.translate(request)).await?;
        if self.cached_preferences().cache_translations {
            if let Err(e) = self.cache.put_translation(&cache_key, &response.translated_text) {
                warn!("Failed to cache translation: {}", e);
            }
        }
        Ok(response)
    }

    /// Current preferences: fresh query data, then the network, then the
    /// durable cache, then the defaults.
    pub async fn preferences(&self) -> UserPreferences {
        if let Some(fresh) = self.queries.get_fresh::<UserPreferences>(keys::PREFERENCES) {
            return fresh;
        }
        match self.live(self.api.fetch_preferences()).await {
            Ok(preferences) => {
                self.store_preferences(&preferences);
                preferences
            }
            Err(e) => {
                debug!("Using cached preferences: {}", e);
                self.cached_preferences()
            }
        }
    }

    pub async fn save_preferences(&self, preferences: &UserPreferences) -> ApiResult<()> {
        self.live(self.api.save_preferences(preferences)).await?;
        self.store_preferences(preferences);
        info!("Preferences saved");
        Ok(())
    }

    /// Apply a partial update remotely, then to the cached copy.
    pub async fn update_preferences(
        &self,
        update: &UserPreferencesUpdate,
    ) -> ApiResult<UserPreferences> {
        self.live(self.api.update_preferences(update)).await?;
        let mut preferences = self.cached_preferences();
        preferences.apply(update);
        self.store_preferences(&preferences);
        info!("Preferences updated");
        Ok(preferences)
    }

    /// Reset to the server defaults and cache them.
    pub async fn reset_preferences(&self) -> ApiResult<UserPreferences> {
        self.live(self.api.reset_preferences()).await?;
        let defaults = UserPreferences::default();
        self.store_preferences(&defaults);
        info!("Preferences reset to defaults");
        Ok(defaults)
    }

    fn cached_preferences(&self) -> UserPreferences {
        self.queries
            .get_query_data(keys::PREFERENCES)
            .or_else(|| {
                self.cache
                    .get(CacheDomain::UserPreferences, PREFERENCES_KEY)
            })
            .unwrap_or_default()
    }

    fn store_preferences(&self, preferences: &UserPreferences) {
        if let Err(e) = self.cache.put_default(
            CacheDomain::UserPreferences,
            PREFERENCES_KEY,
            preferences,
        ) {
            warn!("Failed to cache preferences: {}", e);
        }
        self.remember(keys::PREFERENCES, preferences, preloader::PREFERENCES_STALE_TIME);
    }

    fn remember<T: serde::Serialize>(&self, key: &str, value: &T, stale_time: std::time::Duration) {
        if let Err(e) = self.queries.set_query_data(key, value, stale_time) {
            warn!("Failed to populate query cache for {}: {}", key, e);
        }
    }

    /// Await a network call unless the client is known to be offline.
    async fn live<T>(
        &self,
        call: impl std::future::Future<Output = ApiResult<T>>,
    ) -> ApiResult<T> {
        if !self.network.is_online() {
            return Err(ApiError::NotConnected);
        }
        call.await
    }
}

/// Whether a cached page can answer a request for `limit` items.
fn covers_limit(page: &RecommendationResponse, limit: Option<u32>) -> bool {
    limit.map_or(true, |limit| page.items.len() >= limit as usize || !page.has_next)
}

/// Trim a cached page to the requested number of items.
fn limit_page(mut page: RecommendationResponse, limit: Option<u32>) -> RecommendationResponse {
    if let Some(limit) = limit.map(|l| l as usize) {
        if page.items.len() > limit {
            page.items.truncate(limit);
            page.page_size = u32::try_from(limit).unwrap_or(u32::MAX);
            page.has_next = true;
        }
    }
    page
}

/// Durable key for plain listings. Searches, located requests and later
/// pages are not persisted.
fn durable_recommendation_key(query: &RecommendationQuery) -> Option<String> {
    if !query.is_plain_listing() {
        return None;
    }
    match query.category.as_deref().filter(|c| !c.is_empty() && *c != "all") {
        Some(category) => Some(category_cache_key(category)),
        None => Some(ALL_RECOMMENDATIONS_KEY.to_string()),
    }
}
