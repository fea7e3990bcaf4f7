//! In-process [`GuideApi`] used by unit tests.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::*;

#[derive(Debug, Default)]
pub(crate) struct MockGuideApi {
    items: Vec<RecommendationItem>,
    preferences: Mutex<UserPreferences>,
    translations: Mutex<Vec<(String, String, String)>>,
    failing: AtomicBool,
    hang_essential: AtomicBool,
    failing_categories: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

pub(crate) fn item(id: &str, name: &str, category: &str, tags: &[&str]) -> RecommendationItem {
    RecommendationItem {
        id: id.to_string(),
        name: name.to_string(),
        category: category.to_string(),
        description: format!("{name} in the old city"),
        location: "Varanasi".to_string(),
        cultural_insight: "Popular with locals".to_string(),
        image_url: None,
        rating: Some(4.5),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        price_range: None,
        opening_hours: None,
        contact_info: None,
    }
}

impl MockGuideApi {
    pub fn with_sample_data() -> Self {
        Self {
            items: vec![
                item("sf-1", "Kachori Gali", "street_food", &["breakfast", "spicy"]),
                item("sf-2", "Blue Lassi", "street_food", &["lassi", "dessert"]),
                item("sh-1", "Silk House", "shops", &["silk", "sarees"]),
                item("mk-1", "Vishwanath Market", "markets", &["bangles"]),
            ],
            ..Default::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fail_category(&self, category: &str) {
        self.failing_categories
            .lock()
            .unwrap()
            .insert(category.to_string());
    }

    pub fn hang_essential(&self, hang: bool) {
        self.hang_essential.store(hang, Ordering::SeqCst);
    }

    pub fn add_translation(&self, text: &str, target: &str, translated: &str) {
        self.translations.lock().unwrap().push((
            text.to_string(),
            target.to_string(),
            translated.to_string(),
        ));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> ApiResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ApiError::Unavailable("mock backend down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl GuideApi for MockGuideApi {
    async fn fetch_preferences(&self) -> ApiResult<UserPreferences> {
        self.enter()?;
        Ok(self.preferences.lock().unwrap().clone())
    }

    async fn save_preferences(&self, preferences: &UserPreferences) -> ApiResult<()> {
        self.enter()?;
        *self.preferences.lock().unwrap() = preferences.clone();
        Ok(())
    }

    async fn update_preferences(&self, update: &UserPreferencesUpdate) -> ApiResult<()> {
        self.enter()?;
        self.preferences.lock().unwrap().apply(update);
        Ok(())
    }

    async fn reset_preferences(&self) -> ApiResult<()> {
        self.enter()?;
        *self.preferences.lock().unwrap() = UserPreferences::default();
        Ok(())
    }

    async fn fetch_recommendations(
        &self,
        query: &RecommendationQuery,
    ) -> ApiResult<RecommendationResponse> {
        self.enter()?;
        if let Some(category) = &query.category {
            if self.failing_categories.lock().unwrap().contains(category) {
                return Err(ApiError::Status {
                    status: 500,
                    url: format!("mock://recommendations/{category}"),
                });
            }
        }
        let needle = query.query.as_deref().map(str::to_lowercase);
        let items: Vec<RecommendationItem> = self
            .items
            .iter()
            .filter(|i| {
                query
                    .category
                    .as_deref()
                    .map_or(true, |c| c == "all" || i.category == c)
            })
            .filter(|i| {
                needle
                    .as_deref()
                    .map_or(true, |n| i.name.to_lowercase().contains(n))
            })
            .take(query.limit.unwrap_or(10) as usize)
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
        self.enter()?;
        if self.hang_essential.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(EssentialData {
            categories: RecommendationCategory::ALL
                .iter()
                .map(|c| CategoryInfo {
                    value: c.as_str().to_string(),
                    label: c.label().to_string(),
                    description: String::new(),
                })
                .collect(),
            supported_languages: vec![LanguageInfo {
                code: "en".to_string(),
                name: "English".to_string(),
            }],
            fetched_at: 0,
        })
    }

    async fn translate(&self, request: &TranslationRequest) -> ApiResult<TranslationResponse> {
        self.enter()?;
        let translated = self
            .translations
            .lock()
            .unwrap()
            .iter()
            .find(|(text, target, _)| *text == request.text && *target == request.target_language)
            .map(|(_, _, translated)| translated.clone())
            .unwrap_or_else(|| format!("[{}] {}", request.target_language, request.text));
        Ok(TranslationResponse {
            original_text: request.text.clone(),
            translated_text: translated,
            confidence: 0.9,
            detected_language: request.source_language.clone(),
            target_language: request.target_language.clone(),
            cached: false,
            slang_enhanced: false,
            processing_time_ms: None,
        })
    }

    async fn health(&self) -> ApiResult<()> {
        self.enter()
    }
}
