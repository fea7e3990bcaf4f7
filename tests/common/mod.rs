//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use local_guide::guide_api::*;
use local_guide::offline_cache::{
    clock::ManualClock, network::NetworkStatus, storage::FileStorage, types::CacheConfig,
};
use local_guide::OfflineEngine;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const T0: i64 = 1_700_000_000_000;

pub fn place(id: &str, name: &str, category: &str) -> RecommendationItem {
    RecommendationItem {
        id: id.to_string(),
        name: name.to_string(),
        category: category.to_string(),
        description: format!("{name}, Varanasi"),
        location: "Varanasi".to_string(),
        cultural_insight: String::new(),
        image_url: None,
        rating: None,
        tags: Vec::new(),
        price_range: None,
        opening_hours: None,
        contact_info: None,
    }
}

/// Backend double serving a fixed catalogue.
#[derive(Debug)]
pub struct StubBackend {
    items: Vec<RecommendationItem>,
    down: AtomicBool,
    broken_categories: Mutex<HashSet<String>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            items: vec![
                place("sf-1", "Kachori", "street_food"),
                place("sh-1", "Silk House", "shops"),
                place("mk-1", "Thatheri Bazaar", "markets"),
            ],
            down: AtomicBool::new(false),
            broken_categories: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn break_category(&self, category: &str) {
        self.broken_categories
            .lock()
            .unwrap()
            .insert(category.to_string());
    }

    fn check(&self) -> ApiResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ApiError::Unavailable("stub backend down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl GuideApi for StubBackend {
    async fn fetch_preferences(&self) -> ApiResult<UserPreferences> {
        self.check()?;
        Ok(UserPreferences::default())
    }

    async fn save_preferences(&self, _preferences: &UserPreferences) -> ApiResult<()> {
        self.check()
    }

    async fn update_preferences(&self, _update: &UserPreferencesUpdate) -> ApiResult<()> {
        self.check()
    }

    async fn reset_preferences(&self) -> ApiResult<()> {
        self.check()
    }

    async fn fetch_recommendations(
        &self,
        query: &RecommendationQuery,
    ) -> ApiResult<RecommendationResponse> {
        self.check()?;
        let category = query.category.as_deref().filter(|c| *c != "all");
        if let Some(c) = category {
            if self.broken_categories.lock().unwrap().contains(c) {
                return Err(ApiError::Status {
                    status: 503,
                    url: format!("stub://recommendations/category/{c}"),
                });
            }
        }
        let items: Vec<RecommendationItem> = self
            .items
            .iter()
            .filter(|i| category.map_or(true, |c| i.category == c))
            .cloned()
            .collect();
        Ok(RecommendationResponse {
            total: items.len(),
            items,
            category: query.category.clone(),
            query: query.query.clone(),
            page: 1,
            page_size: query.limit.unwrap_or(10),
            has_next: false,
        })
    }

    async fn fetch_essential_data(&self) -> ApiResult<EssentialData> {
        self.check()?;
        Ok(EssentialData {
            categories: vec![CategoryInfo {
                value: "street_food".to_string(),
                label: "Street Food".to_string(),
                description: String::new(),
            }],
            supported_languages: vec![LanguageInfo {
                code: "hi".to_string(),
                name: "Hindi".to_string(),
            }],
            fetched_at: T0,
        })
    }

    async fn translate(&self, request: &TranslationRequest) -> ApiResult<TranslationResponse> {
        self.check()?;
        Ok(TranslationResponse {
            original_text: request.text.clone(),
            translated_text: format!("<{}>", request.text),
            confidence: 0.8,
            detected_language: request.source_language.clone(),
            target_language: request.target_language.clone(),
            cached: false,
            slang_enhanced: false,
            processing_time_ms: None,
        })
    }

    async fn health(&self) -> ApiResult<()> {
        self.check()
    }
}

/// Engine backed by real files in a temporary directory.
pub struct Fixture {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub backend: Arc<StubBackend>,
    pub engine: OfflineEngine,
}

pub fn fixture() -> Fixture {
    fixture_with(CacheConfig::default())
}

pub fn fixture_with(config: CacheConfig) -> Fixture {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let backend = Arc::new(StubBackend::new());
    let storage = Arc::new(FileStorage::with_config(dir.path(), &config).unwrap());
    let engine = OfflineEngine::with_parts(
        storage,
        clock.clone(),
        backend.clone(),
        Arc::new(NetworkStatus::new(true)),
        config,
    );
    Fixture {
        dir,
        clock,
        backend,
        engine,
    }
}
