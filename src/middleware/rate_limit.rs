// Fixed-window request limiting
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};

use crate::error::ApiError;
use crate::state::AppState;

// Stale windows are pruned once the map grows past this
const MAX_TRACKED_KEYS: usize = 1024;

/// In-process fixed-window limiter: at most `max` hits per `window` for each
/// client key. Counts reset when a key's window expires.
pub struct RateLimiter {
    max: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

struct Window {
    started: Instant,
    hits: u32,
}

impl RateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Records a hit for `key` and reports whether it stayed within the
    /// limit.
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> bool {
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if windows.len() >= MAX_TRACKED_KEYS {
            let horizon = self.window;
            windows.retain(|_, w| now.duration_since(w.started) < horizon);
        }

        let window = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            hits: 0,
        });

        if now.duration_since(window.started) >= self.window {
            window.started = now;
            window.hits = 0;
        }

        window.hits += 1;
        window.hits <= self.max
    }
}

/// General API limiter, applied to the whole `/api` surface.
pub async fn api_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(limiter) = &state.api_limiter {
        if !limiter.check(&client_key(request.headers())) {
            return Err(ApiError::too_many_requests(
                "Too many requests, please try again later.",
            ));
        }
    }
    Ok(next.run(request).await)
}

/// Tighter limiter for the vision-analysis route.
pub async fn ai_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(limiter) = &state.ai_limiter {
        if !limiter.check(&client_key(request.headers())) {
            return Err(ApiError::too_many_requests(
                "AI analysis limit reached. Please try again in an hour.",
            ));
        }
    }
    Ok(next.run(request).await)
}

/// Client key: first hop of `X-Forwarded-For` when running behind a proxy,
/// otherwise a single shared bucket.
fn client_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "local".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_max_then_rejects() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let now = Instant::now();

        assert!(limiter.check_at("a", now));
        assert!(limiter.check_at("a", now));
        assert!(limiter.check_at("a", now));
        assert!(!limiter.check_at("a", now));
    }

    #[test]
    fn fresh_window_admits_again() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();

        assert!(limiter.check_at("a", now));
        assert!(!limiter.check_at("a", now));
        assert!(limiter.check_at("a", now + Duration::from_secs(61)));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();

        assert!(limiter.check_at("a", now));
        assert!(limiter.check_at("b", now));
        assert!(!limiter.check_at("a", now));
    }

    #[test]
    fn forwarded_for_first_hop_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "203.0.113.7, 10.0.0.1".parse().unwrap(),
        );

        assert_eq!(client_key(&headers), "203.0.113.7");
    }

    #[test]
    fn missing_forwarded_for_shares_one_bucket() {
        assert_eq!(client_key(&HeaderMap::new()), "local");
    }
}
