//! Wire types and errors for the Local Guide HTTP API

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::offline_cache::types::EpochMillis;

/// Header carrying the client's session identifier.
pub const SESSION_HEADER: &str = "X-Session-ID";

/// Recommendation categories served by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationCategory {
    StreetFood,
    Shops,
    Markets,
    Souvenirs,
    Clothing,
    Crafts,
}

impl RecommendationCategory {
    pub const ALL: [RecommendationCategory; 6] = [
        RecommendationCategory::StreetFood,
        RecommendationCategory::Shops,
        RecommendationCategory::Markets,
        RecommendationCategory::Souvenirs,
        RecommendationCategory::Clothing,
        RecommendationCategory::Crafts,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecommendationCategory::StreetFood => "street_food",
            RecommendationCategory::Shops => "shops",
            RecommendationCategory::Markets => "markets",
            RecommendationCategory::Souvenirs => "souvenirs",
            RecommendationCategory::Clothing => "clothing",
            RecommendationCategory::Crafts => "crafts",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RecommendationCategory::StreetFood => "Street Food",
            RecommendationCategory::Shops => "Shops",
            RecommendationCategory::Markets => "Markets",
            RecommendationCategory::Souvenirs => "Souvenirs",
            RecommendationCategory::Clothing => "Clothing",
            RecommendationCategory::Crafts => "Crafts",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == value)
    }
}

/// A single recommended place or item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationItem {
    pub id: String,
    pub name: String,
    pub category: String,
    pub description: String,
    pub location: String,
    pub cultural_insight: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opening_hours: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_info: Option<String>,
}

/// One page of recommendations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationResponse {
    pub items: Vec<RecommendationItem>,
    pub total: usize,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub has_next: bool,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    10
}

/// Parameters of a recommendation request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendationQuery {
    pub category: Option<String>,
    pub query: Option<String>,
    /// Free-text area the results should be near.
    pub location: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl RecommendationQuery {
    /// Unfiltered listing.
    pub fn all(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn category(category: impl Into<String>, limit: u32) -> Self {
        Self {
            category: Some(category.into()),
            limit: Some(limit),
            ..Default::default()
        }
    }

    /// Whether this request carries a free-text search.
    pub fn is_search(&self) -> bool {
        self.query.as_deref().is_some_and(|q| !q.trim().is_empty())
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref().map(str::trim).filter(|l| !l.is_empty())
    }

    /// First page of a category or unfiltered listing, the shape the
    /// preloader stores.
    pub fn is_plain_listing(&self) -> bool {
        !self.is_search() && self.location().is_none() && self.offset.unwrap_or(0) == 0
    }
}

/// Category description returned by the categories endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryInfo {
    pub value: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageInfo {
    pub code: String,
    pub name: String,
}

/// Body of the supported-languages endpoint. Only the recommended list is used.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SupportedLanguages {
    #[serde(default)]
    pub recommended: Vec<LanguageInfo>,
}

/// Bootstrap dataset needed to render the application offline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EssentialData {
    pub categories: Vec<CategoryInfo>,
    pub supported_languages: Vec<LanguageInfo>,
    pub fetched_at: EpochMillis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationPreferences {
    pub new_recommendations: bool,
    pub translation_updates: bool,
    pub system_updates: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            new_recommendations: true,
            translation_updates: false,
            system_updates: true,
        }
    }
}

/// Per-session user preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserPreferences {
    pub preferred_language: String,
    pub location_sharing: bool,
    pub cache_translations: bool,
    pub voice_input_enabled: bool,
    pub notification_preferences: NotificationPreferences,
    pub theme: Option<String>,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            preferred_language: "en".to_string(),
            location_sharing: false,
            cache_translations: true,
            voice_input_enabled: true,
            notification_preferences: NotificationPreferences::default(),
            theme: Some("light".to_string()),
        }
    }
}

impl UserPreferences {
    /// Merge a partial update into these preferences.
    pub fn apply(&mut self, update: &UserPreferencesUpdate) {
        if let Some(language) = &update.preferred_language {
            self.preferred_language = language.clone();
        }
        if let Some(sharing) = update.location_sharing {
            self.location_sharing = sharing;
        }
        if let Some(cache) = update.cache_translations {
            self.cache_translations = cache;
        }
        if let Some(voice) = update.voice_input_enabled {
            self.voice_input_enabled = voice;
        }
        if let Some(notifications) = &update.notification_preferences {
            self.notification_preferences = notifications.clone();
        }
        if let Some(theme) = &update.theme {
            self.theme = Some(theme.clone());
        }
    }
}

/// Partial preference update sent with PATCH.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreferencesUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_sharing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_translations: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_input_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_preferences: Option<NotificationPreferences>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_language: Option<String>,
    pub target_language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl TranslationRequest {
    pub fn new(text: impl Into<String>, target_language: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source_language: None,
            target_language: target_language.into(),
            context: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationResponse {
    pub original_text: String,
    pub translated_text: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub detected_language: Option<String>,
    pub target_language: String,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub slang_enhanced: bool,
    #[serde(default)]
    pub processing_time_ms: Option<f64>,
}

/// Acknowledgement envelope returned by mutating endpoints.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiAck {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// HTTP client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub session_id: Option<String>,
    pub request_timeout_secs: u64,
    pub requests_per_second: u32,
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            session_id: None,
            request_timeout_secs: 10,
            requests_per_second: 10,
            user_agent: format!("local_guide/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Error types for API calls
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network is not connected")]
    NotConnected,

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    /// Whether the failure means the backend could not be reached, as
    /// opposed to the backend rejecting the request.
    pub fn is_connectivity(&self) -> bool {
        match self {
            ApiError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            ApiError::Status { status, .. } => matches!(status, 502..=504),
            ApiError::Timeout(_) | ApiError::NotConnected | ApiError::Unavailable(_) => true,
            ApiError::Url(_) | ApiError::Decode(_) => false,
        }
    }
}

/// Result type for API calls
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferences_wire_format() {
        let json = serde_json::to_value(UserPreferences::default()).unwrap();
        assert_eq!(json["preferredLanguage"], "en");
        assert_eq!(json["cacheTranslations"], true);
        assert_eq!(json["notificationPreferences"]["translationUpdates"], false);
        assert_eq!(json["theme"], "light");

        let partial: UserPreferences =
            serde_json::from_str(r#"{"preferredLanguage":"hi","theme":"dark"}"#).unwrap();
        assert_eq!(partial.preferred_language, "hi");
        assert!(partial.voice_input_enabled);
    }

    #[test]
    fn test_preferences_apply_update() {
        let mut prefs = UserPreferences::default();
        prefs.apply(&UserPreferencesUpdate {
            preferred_language: Some("te".to_string()),
            cache_translations: Some(false),
            ..Default::default()
        });
        assert_eq!(prefs.preferred_language, "te");
        assert!(!prefs.cache_translations);
        assert_eq!(prefs.theme.as_deref(), Some("light"));

        let body = serde_json::to_string(&UserPreferencesUpdate {
            theme: Some("auto".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(body, r#"{"theme":"auto"}"#);
    }

    #[test]
    fn test_recommendation_response_defaults() {
        let response: RecommendationResponse = serde_json::from_str(
            r#"{"items":[{"id":"sf-1","name":"Kachori Gali","category":"street_food",
                "description":"Lane of kachori stalls","location":"Near Vishwanath Gali",
                "cultural_insight":"Breakfast staple"}],"total":1}"#,
        )
        .unwrap();
        assert_eq!(response.page, 1);
        assert_eq!(response.page_size, 10);
        assert!(!response.has_next);
        assert!(response.items[0].tags.is_empty());
    }

    #[test]
    fn test_category_parse() {
        assert_eq!(
            RecommendationCategory::parse("street_food"),
            Some(RecommendationCategory::StreetFood)
        );
        assert_eq!(RecommendationCategory::parse("temples"), None);
    }

    #[test]
    fn test_connectivity_classification() {
        assert!(ApiError::NotConnected.is_connectivity());
        assert!(ApiError::Timeout(Duration::from_secs(1)).is_connectivity());
        assert!(ApiError::Status {
            status: 503,
            url: "http://x".to_string()
        }
        .is_connectivity());
        assert!(!ApiError::Status {
            status: 404,
            url: "http://x".to_string()
        }
        .is_connectivity());
        assert!(!ApiError::Decode("bad".to_string()).is_connectivity());
    }
}
