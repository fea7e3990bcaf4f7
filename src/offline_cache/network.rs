//! Connectivity flag consulted before falling back to cached data.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::guide_api::GuideApi;

/// Reachability of the backend as last reported by the platform or a probe.
#[derive(Debug)]
pub struct NetworkStatus {
    online: AtomicBool,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkStatus {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            info!(
                "Network status changed: {}",
                if online { "online" } else { "offline" }
            );
        }
    }

    /// Check the backend health endpoint and record the result.
    pub async fn probe(&self, api: &dyn GuideApi) -> bool {
        let online = match api.health().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Health probe failed: {}", e);
                false
            }
        };
        self.set_online(online);
        online
    }
}
