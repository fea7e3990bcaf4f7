//! Offline fallback over cached data.
//!
//! Every method is total: missing or unreadable data yields an empty or
//! negative answer, never an error.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::durable::DurableCache;
use super::network::NetworkStatus;
use super::types::{
    translation_cache_key, CacheDomain, OfflineCapabilitySet, OfflineFallback, OfflineFeature,
    OfflineRecommendationQuery, ESSENTIAL_DATA_KEY, PREFERENCES_KEY,
};
use crate::guide_api::{EssentialData, RecommendationItem, RecommendationResponse, UserPreferences};

/// Answers feature requests from the durable cache while offline.
#[derive(Debug)]
pub struct OfflineOrchestrator {
    cache: Arc<DurableCache>,
    network: Arc<NetworkStatus>,
}

impl OfflineOrchestrator {
    pub fn new(cache: Arc<DurableCache>, network: Arc<NetworkStatus>) -> Self {
        Self { cache, network }
    }

    /// Whether the feature's cache domain holds live data. Speech never works offline.
    pub fn is_available_offline(&self, feature: OfflineFeature) -> bool {
        feature
            .domain()
            .is_some_and(|domain| self.cache.has_live_entries(domain))
    }

    /// Every cached recommendation, deduplicated by id, in storage-key order.
    pub fn cached_recommendations(&self) -> Vec<RecommendationItem> {
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for key in self.cache.domain_keys(CacheDomain::Recommendations) {
            let Some(page) = self
                .cache
                .get::<RecommendationResponse>(CacheDomain::Recommendations, &key)
            else {
                continue;
            };
            for item in page.items {
                if seen.insert(item.id.clone()) {
                    items.push(item);
                }
            }
        }
        items
    }

    /// Filter cached recommendations by category and free-text query.
    pub fn get_offline_recommendations(
        &self,
        query: &OfflineRecommendationQuery,
    ) -> Vec<RecommendationItem> {
        if query.limit == 0 {
            return Vec::new();
        }

        let category = query.category.as_deref().filter(|c| *c != "all");
        let needle = query
            .query
            .as_deref()
            .map(|q| q.trim().to_lowercase())
            .filter(|q| !q.is_empty());

        let results: Vec<RecommendationItem> = self
            .cached_recommendations()
            .into_iter()
            .filter(|item| category.map_or(true, |c| item.category == c))
            .filter(|item| needle.as_deref().map_or(true, |n| matches_text(item, n)))
            .take(query.limit)
            .collect();

        debug!(
            "Offline recommendations: {} results (category: {:?}, query: {:?})",
            results.len(),
            category,
            needle
        );
        results
    }

    pub fn get_offline_translation(
        &self,
        text: &str,
        target_language: &str,
        source_language: Option<&str>,
    ) -> Option<String> {
        let key = translation_cache_key(text, target_language, source_language);
        self.cache.get_translation(&key)
    }

    pub fn get_offline_capabilities(&self) -> OfflineCapabilitySet {
        let available_categories = self
            .cached_recommendations()
            .into_iter()
            .map(|item| item.category)
            .collect();
        let available_translation_count = self.cache.translation_count();

        OfflineCapabilitySet {
            can_browse_recommendations: self.is_available_offline(OfflineFeature::Recommendations),
            can_use_preferences: self.is_available_offline(OfflineFeature::Preferences),
            can_translate: available_translation_count > 0,
            can_use_speech: false,
            available_categories,
            available_translation_count,
            last_sync_timestamp: self.cache.last_sync(),
        }
    }

    /// Turn an error raised while offline into a structured fallback.
    ///
    /// Online errors are returned unchanged: fallback only applies when the
    /// client is not connected.
    pub fn handle_offline_error<E: fmt::Display>(
        &self,
        error: E,
        feature: OfflineFeature,
    ) -> Result<OfflineFallback, E> {
        if self.network.is_online() {
            return Err(error);
        }
        debug!("Handling offline error for {:?}: {}", feature, error);

        let (fallback_data, message) = match feature {
            OfflineFeature::Recommendations => {
                let items = self.cached_recommendations();
                if items.is_empty() {
                    (
                        None,
                        "No recommendations are saved for offline use. Connect to the internet to browse recommendations.".to_string(),
                    )
                } else {
                    let message =
                        format!("You're offline. Showing {} saved recommendations.", items.len());
                    (serde_json::to_value(items).ok(), message)
                }
            }
            OfflineFeature::Preferences => {
                match self
                    .cache
                    .get::<UserPreferences>(CacheDomain::UserPreferences, PREFERENCES_KEY)
                {
                    Some(prefs) => (
                        serde_json::to_value(prefs).ok(),
                        "You're offline. Using your saved preferences; changes will not be synced until you reconnect.".to_string(),
                    ),
                    None => (
                        None,
                        "Your preferences are not available offline. Default settings are in use.".to_string(),
                    ),
                }
            }
            OfflineFeature::Translations => {
                let count = self.cache.translation_count();
                if count > 0 {
                    (
                        Some(serde_json::json!({ "available_translations": count })),
                        format!("You're offline. Only the {count} previously translated phrases are available."),
                    )
                } else {
                    (
                        None,
                        "Translation requires an internet connection and no translations are saved offline.".to_string(),
                    )
                }
            }
            OfflineFeature::Essential => {
                match self
                    .cache
                    .get::<EssentialData>(CacheDomain::EssentialData, ESSENTIAL_DATA_KEY)
                {
                    Some(data) => (
                        serde_json::to_value(data).ok(),
                        "You're offline. Using saved app data.".to_string(),
                    ),
                    None => (
                        None,
                        "App data has not been saved for offline use yet.".to_string(),
                    ),
                }
            }
            OfflineFeature::Speech => (
                None,
                "Voice input requires an internet connection. Please type your text instead."
                    .to_string(),
            ),
        };

        Ok(OfflineFallback {
            feature,
            can_fallback: fallback_data.is_some(),
            fallback_data,
            message,
        })
    }
}

fn matches_text(item: &RecommendationItem, needle: &str) -> bool {
    item.name.to_lowercase().contains(needle)
        || item.description.to_lowercase().contains(needle)
        || item
            .tags
            .iter()
            .any(|tag| tag.to_lowercase().contains(needle))
}
