// GET /api/health
use std::time::Instant;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{SecondsFormat, Utc};
use once_cell::sync::Lazy;
use serde_json::{json, Value};

use crate::config;
use crate::state::AppState;

static STARTED: Lazy<Instant> = Lazy::new(Instant::now);

/// Anchors the uptime clock; called once when the router is built.
pub fn init_uptime() {
    Lazy::force(&STARTED);
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let degraded = match state.store.ping().await {
        Ok(()) => false,
        Err(err) => {
            tracing::error!("Health check ping failed: {}", err);
            true
        }
    };

    let body = status_body(degraded);

    if degraded {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    } else {
        (StatusCode::OK, Json(body))
    }
}

fn status_body(degraded: bool) -> Value {
    let environment = if config::config().is_production() {
        "production"
    } else {
        "development"
    };

    json!({
        "status": if degraded { "degraded" } else { "ok" },
        "app": "brewbuddy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "uptime": STARTED.elapsed().as_secs_f64(),
        "environment": environment,
    })
}
