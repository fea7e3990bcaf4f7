//! Client for the Local Guide backend.
//!
//! [`GuideApi`] is the seam the offline cache talks through; [`HttpGuideApi`]
//! is the production implementation over `reqwest`.

pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, info, instrument};
use url::Url;

pub use types::*;

/// Rate limiter for backend calls
type ApiRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::QuantaClock,
>;

/// Backend operations used by the offline cache.
#[async_trait]
pub trait GuideApi: Send + Sync + fmt::Debug {
    async fn fetch_preferences(&self) -> ApiResult<UserPreferences>;

    async fn save_preferences(&self, preferences: &UserPreferences) -> ApiResult<()>;

    async fn update_preferences(&self, update: &UserPreferencesUpdate) -> ApiResult<()>;

    /// Reset the session's preferences to the server defaults.
    async fn reset_preferences(&self) -> ApiResult<()>;

    async fn fetch_recommendations(
        &self,
        query: &RecommendationQuery,
    ) -> ApiResult<RecommendationResponse>;

    async fn fetch_essential_data(&self) -> ApiResult<EssentialData>;

    async fn translate(&self, request: &TranslationRequest) -> ApiResult<TranslationResponse>;

    /// Cheap liveness check.
    async fn health(&self) -> ApiResult<()>;
}

/// [`GuideApi`] over HTTP.
pub struct HttpGuideApi {
    client: Client,
    base_url: Url,
    session_id: Option<String>,
    timeout: Duration,
    rate_limiter: ApiRateLimiter,
}

impl fmt::Debug for HttpGuideApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpGuideApi")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl HttpGuideApi {
    pub fn new(config: &ApiConfig) -> ApiResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .gzip(true)
            .user_agent(config.user_agent.clone())
            .build()?;

        // A trailing slash makes relative joins append to the base path.
        let mut base = config.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)?;

        let per_second =
            NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(per_second));

        Ok(Self {
            client,
            base_url,
            session_id: config.session_id.clone(),
            timeout: config.request_timeout(),
            rate_limiter,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> ApiResult<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn recommendations_url(&self, query: &RecommendationQuery) -> ApiResult<Url> {
        let category = query
            .category
            .as_deref()
            .filter(|c| !c.is_empty() && *c != "all");

        let mut url = if query.is_search() {
            self.endpoint("api/recommendations/search")?
        } else if let Some(category) = category {
            self.endpoint(&format!("api/recommendations/{category}"))?
        } else {
            self.endpoint("api/recommendations/")?
        };

        {
            let mut pairs = url.query_pairs_mut();
            if query.is_search() {
                if let Some(q) = &query.query {
                    pairs.append_pair("query", q.trim());
                }
                if let Some(category) = category {
                    pairs.append_pair("category", category);
                }
            }
            if let Some(location) = query.location() {
                pairs.append_pair("location", location);
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
            if let Some(offset) = query.offset {
                pairs.append_pair("offset", &offset.to_string());
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    async fn execute(&self, request: RequestBuilder) -> ApiResult<Response> {
        self.rate_limiter.until_ready().await;

        let request = match &self.session_id {
            Some(id) => request.header(SESSION_HEADER, id),
            None => request,
        };

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| ApiError::Timeout(self.timeout))??;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> ApiResult<T> {
        let response = self.execute(self.client.get(url)).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn acknowledge(&self, request: RequestBuilder) -> ApiResult<()> {
        let response = self.execute(request).await?;
        let ack: ApiAck = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        debug!(
            "Backend acknowledged with status {}: {}",
            ack.status,
            ack.message.as_deref().unwrap_or("")
        );
        Ok(())
    }
}

#[async_trait]
impl GuideApi for HttpGuideApi {
    #[instrument(skip(self))]
    async fn fetch_preferences(&self) -> ApiResult<UserPreferences> {
        self.get_json(self.endpoint("api/preferences/")?).await
    }

    #[instrument(skip(self, preferences))]
    async fn save_preferences(&self, preferences: &UserPreferences) -> ApiResult<()> {
        let url = self.endpoint("api/preferences/")?;
        self.acknowledge(self.client.post(url).json(preferences)).await
    }

    #[instrument(skip(self, update))]
    async fn update_preferences(&self, update: &UserPreferencesUpdate) -> ApiResult<()> {
        let url = self.endpoint("api/preferences/")?;
        self.acknowledge(self.client.patch(url).json(update)).await
    }

    #[instrument(skip(self))]
    async fn reset_preferences(&self) -> ApiResult<()> {
        let url = self.endpoint("api/preferences/")?;
        self.acknowledge(self.client.delete(url)).await
    }

    #[instrument(skip(self, query), fields(category = ?query.category, search = ?query.query))]
    async fn fetch_recommendations(
        &self,
        query: &RecommendationQuery,
    ) -> ApiResult<RecommendationResponse> {
        let url = self.recommendations_url(query)?;
        debug!("Fetching recommendations from {}", url);
        let response: RecommendationResponse = self.get_json(url).await?;
        info!(
            "Fetched {} of {} recommendations",
            response.items.len(),
            response.total
        );
        Ok(response)
    }

    #[instrument(skip(self))]
    async fn fetch_essential_data(&self) -> ApiResult<EssentialData> {
        let categories: Vec<CategoryInfo> = self
            .get_json(self.endpoint("api/recommendations/categories")?)
            .await?;
        let languages: SupportedLanguages = self
            .get_json(self.endpoint("api/supported-languages")?)
            .await?;
        Ok(EssentialData {
            categories,
            supported_languages: languages.recommended,
            fetched_at: chrono::Utc::now().timestamp_millis(),
        })
    }

    #[instrument(skip(self, request), fields(target = %request.target_language))]
    async fn translate(&self, request: &TranslationRequest) -> ApiResult<TranslationResponse> {
        let url = self.endpoint("api/translate")?;
        let response = self.execute(self.client.post(url).json(request)).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    #[instrument(skip(self))]
    async fn health(&self) -> ApiResult<()> {
        self.execute(self.client.get(self.endpoint("health/")?))
            .await
            .map(|_| ())
    }
}
