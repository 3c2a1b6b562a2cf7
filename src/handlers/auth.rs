// POST /api/auth/register and GET /api/auth/validate
use axum::{
    extract::{RawQuery, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::config;
use crate::error::ApiError;
use crate::middleware::{authenticate_request, extract_credentials};
use crate::state::AppState;

/// Closed-beta registration: a trimmed username of at least two characters,
/// capped at a fixed number of testers. The opaque token handed back is the
/// only credential the client ever holds.
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    let username = payload
        .get("username")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim();

    if username.chars().count() < 2 {
        return Err(ApiError::bad_request(
            "Username must be at least 2 characters",
        ));
    }

    let cap = config::config().api.max_testers;
    let count = state.store.user_count().await?;
    if count >= cap {
        let body = json!({
            "success": false,
            "error": format!("Tester limit reached ({cap}/{cap})"),
            "spotsRemaining": 0
        });
        return Ok((StatusCode::FORBIDDEN, Json(body)).into_response());
    }

    if state.store.username_exists(username).await? {
        return Err(ApiError::conflict("Username already taken"));
    }

    let token = Uuid::new_v4().to_string();
    let user = state.store.create_user(username, &token).await?;
    let new_count = state.store.user_count().await?;

    info!(username = %user.username, "Tester registered");

    let body = json!({
        "success": true,
        "user": {
            "id": user.id,
            "username": user.username,
            "token": user.token
        },
        "spotsRemaining": (cap - new_count).max(0)
    });
    Ok(Json(body).into_response())
}

/// Token validation and login. Runs the full device-binding protocol inline
/// (binding on first use), refreshes the last-login timestamp and returns
/// the profile. Authentication failures additionally carry `valid: false`.
pub async fn validate(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let credentials = extract_credentials(&headers, None, query.as_deref());

    let user = match authenticate_request(state.store.as_ref(), &credentials, &headers).await {
        Ok(user) => user,
        Err(err) => return validation_failure(err),
    };

    if let Err(err) = state.store.touch_last_login(user.id).await {
        return ApiError::from(err).into_response();
    }

    let device_id = user.device_id.clone().or(credentials.device_id);

    Json(json!({
        "success": true,
        "valid": true,
        "user": {
            "id": user.id,
            "username": user.username,
            "deviceId": device_id,
            "grinderPreference": user.grinder_preference,
            "methodPreference": user.method_preference,
            "waterHardness": user.water_hardness,
            "createdAt": user.created_at,
        }
    }))
    .into_response()
}

/// 401/403 outcomes of the validate route carry a `valid` flag on top of
/// the standard error shape; everything else passes through unchanged.
fn validation_failure(err: ApiError) -> Response {
    match err {
        ApiError::Unauthorized(_) | ApiError::Forbidden(_) => {
            let body = json!({
                "success": false,
                "valid": false,
                "error": err.message(),
            });
            (err.status_code(), Json(body)).into_response()
        }
        other => other.into_response(),
    }
}
