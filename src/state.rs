use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::middleware::RateLimiter;
use crate::storage::Store;
use crate::vision::VisionClient;

/// Shared per-request context: the storage handle, the vision client and the
/// optional rate limiters (`None` = limiting disabled). Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub vision: Arc<VisionClient>,
    pub api_limiter: Option<Arc<RateLimiter>>,
    pub ai_limiter: Option<Arc<RateLimiter>>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, config: &AppConfig) -> Self {
        let (api_limiter, ai_limiter) = if config.api.enable_rate_limiting {
            (
                Some(Arc::new(RateLimiter::new(
                    config.api.rate_limit_requests,
                    Duration::from_secs(config.api.rate_limit_window_secs),
                ))),
                Some(Arc::new(RateLimiter::new(
                    config.api.ai_rate_limit_requests,
                    Duration::from_secs(config.api.ai_rate_limit_window_secs),
                ))),
            )
        } else {
            (None, None)
        };

        Self {
            store,
            vision: Arc::new(VisionClient::new(&config.vision)),
            api_limiter,
            ai_limiter,
        }
    }
}
