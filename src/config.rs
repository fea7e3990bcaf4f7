//! Runtime configuration for the `local_guide` binary.
//!
//! Cache directory precedence:
//!   1. `--cache-dir` flag
//!   2. `LOCAL_GUIDE_CACHE_DIR` env var
//!   3. platform cache dir via `dirs`
//!   4. fallback: `./.local-guide-cache`
//!
//! The API base URL and session id follow flag > env > default the same way.

use std::path::PathBuf;

use crate::guide_api::ApiConfig;
use crate::offline_cache::types::CacheConfig;

pub const CACHE_DIR_ENV: &str = "LOCAL_GUIDE_CACHE_DIR";
pub const API_URL_ENV: &str = "LOCAL_GUIDE_API_URL";
pub const SESSION_ID_ENV: &str = "LOCAL_GUIDE_SESSION_ID";

/// Everything needed to build an engine for one CLI invocation.
#[derive(Debug, Clone)]
pub struct GuideConfig {
    pub cache_dir: PathBuf,
    pub api: ApiConfig,
    pub cache: CacheConfig,
    /// Start with the network marked unavailable.
    pub offline: bool,
}

/// Command-line overrides. `None` falls through to the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub cache_dir: Option<PathBuf>,
    pub api_url: Option<String>,
    pub session_id: Option<String>,
    pub offline: bool,
}

impl GuideConfig {
    /// Resolve configuration from overrides and the process environment.
    pub fn resolve(overrides: ConfigOverrides) -> Self {
        Self::resolve_with(overrides, |name| std::env::var(name).ok())
    }

    /// Resolve configuration with an explicit environment lookup.
    pub fn resolve_with(overrides: ConfigOverrides, env: impl Fn(&str) -> Option<String>) -> Self {
        let cache_dir = resolve_cache_dir(overrides.cache_dir, &env);

        let api = ApiConfig {
            base_url: overrides
                .api_url
                .or_else(|| non_empty(env(API_URL_ENV)))
                .unwrap_or_else(|| ApiConfig::default().base_url),
            session_id: overrides
                .session_id
                .or_else(|| non_empty(env(SESSION_ID_ENV))),
            ..Default::default()
        };

        Self {
            cache_dir,
            api,
            cache: CacheConfig::default(),
            offline: overrides.offline,
        }
    }
}

fn resolve_cache_dir(flag: Option<PathBuf>, env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    if let Some(env_dir) = non_empty(env(CACHE_DIR_ENV)) {
        return PathBuf::from(env_dir);
    }
    if let Some(base) = dirs::cache_dir() {
        return base.join("local_guide");
    }
    // Fallback: local hidden directory
    PathBuf::from(".").join(".local-guide-cache")
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
