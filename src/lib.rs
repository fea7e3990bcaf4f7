//! The Local Guide offline cache library
//!
//! This library provides the offline-first caching layer of The Local Guide:
//! a durable TTL cache, its eviction policy and quota monitoring, essential
//! data preloading and offline fallbacks, plus the HTTP client it preloads from.

pub use crate::offline_cache::OfflineEngine;

// Re-export commonly used dependencies for tests
pub use serde_json;

pub mod config;
pub mod guide_api;
pub mod offline_cache;
