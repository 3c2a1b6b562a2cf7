#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use brewbuddy_api::app;
use brewbuddy_api::config::AppConfig;
use brewbuddy_api::middleware::RateLimiter;
use brewbuddy_api::state::AppState;
use brewbuddy_api::storage::{SqliteStore, Store};
use brewbuddy_api::vision::VisionClient;

/// Fresh router over its own in-memory database. Tests never share state.
pub async fn test_app() -> Result<Router> {
    let store = Arc::new(SqliteStore::connect(":memory:", 1).await?);
    store.initialize().await?;
    Ok(app(AppState::new(store, &AppConfig::from_env())))
}

/// Like [`test_app`] but with explicit per-route rate limits (requests per
/// hour), regardless of what the environment config says.
pub async fn limited_app(api_max: Option<u32>, ai_max: Option<u32>) -> Result<Router> {
    let store = Arc::new(SqliteStore::connect(":memory:", 1).await?);
    store.initialize().await?;

    let config = AppConfig::from_env();
    let hour = Duration::from_secs(3600);
    let state = AppState {
        store,
        vision: Arc::new(VisionClient::new(&config.vision)),
        api_limiter: api_max.map(|max| Arc::new(RateLimiter::new(max, hour))),
        ai_limiter: ai_max.map(|max| Arc::new(RateLimiter::new(max, hour))),
    };
    Ok(app(state))
}

/// One in-process request. Returns the status and the parsed JSON body
/// (`Value::Null` for empty bodies).
pub async fn send(app: &Router, request: Request<Body>) -> Result<(StatusCode, Value)> {
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).with_context(|| {
            format!(
                "non-JSON body for {status}: {}",
                String::from_utf8_lossy(&bytes)
            )
        })?
    };
    Ok((status, body))
}

pub fn get(path: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Body::empty())
        .unwrap()
}

pub fn post_json(path: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// GET with Bearer token and device id headers.
pub fn authed_get(path: &str, token: &str, device: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header("x-device-id", device)
        .body(Body::empty())
        .unwrap()
}

/// JSON request with Bearer token and device id headers.
pub fn authed_json(
    method: Method,
    path: &str,
    token: &str,
    device: &str,
    body: &Value,
) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header("x-device-id", device)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Registers a tester and returns the issued token.
pub async fn register(app: &Router, username: &str) -> Result<String> {
    let (status, body) = send(
        app,
        post_json("/api/auth/register", &json!({ "username": username })),
    )
    .await?;
    anyhow::ensure!(
        status == StatusCode::OK,
        "registration failed ({status}): {body}"
    );
    body["user"]["token"]
        .as_str()
        .map(str::to_string)
        .context("registration response carried no token")
}

/// Registers a tester and binds the given device via the validate route.
pub async fn register_bound(app: &Router, username: &str, device: &str) -> Result<String> {
    let token = register(app, username).await?;
    let (status, body) = send(app, authed_get("/api/auth/validate", &token, device)).await?;
    anyhow::ensure!(
        status == StatusCode::OK,
        "device binding failed ({status}): {body}"
    );
    Ok(token)
}
