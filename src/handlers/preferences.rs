// Per-user brew preference endpoints: grinder, method, water hardness
use axum::{extract::State, Extension, Json};
use serde_json::{json, Value};
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;
use crate::storage::User;

/// Grinders the app ships dial charts for.
const VALID_GRINDERS: [&str; 3] = ["fellow_gen2", "comandante", "timemore"];

/// Brew methods with recipe support.
const VALID_METHODS: [&str; 5] = ["v60", "kalita", "chemex", "aeropress", "frenchpress"];

pub async fn get_grinder(Extension(user): Extension<User>) -> Json<Value> {
    Json(json!({ "success": true, "grinder": user.grinder_preference }))
}

pub async fn set_grinder(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let grinder = match payload.get("grinder").and_then(Value::as_str) {
        Some(grinder) if VALID_GRINDERS.contains(&grinder) => grinder,
        _ => {
            return Err(ApiError::bad_request(
                "Valid grinder required (fellow_gen2, comandante, or timemore)",
            ))
        }
    };

    state.store.set_grinder_preference(user.id, grinder).await?;
    info!(username = %user.username, grinder, "Grinder preference updated");

    Ok(Json(json!({ "success": true, "grinder": grinder })))
}

pub async fn get_method(Extension(user): Extension<User>) -> Json<Value> {
    Json(json!({ "success": true, "method": user.method_preference }))
}

pub async fn set_method(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let method = match payload.get("method").and_then(Value::as_str) {
        Some(method) if VALID_METHODS.contains(&method) => method,
        _ => {
            return Err(ApiError::bad_request(format!(
                "Valid method required. Options: {}",
                VALID_METHODS.join(", ")
            )))
        }
    };

    state.store.set_method_preference(user.id, method).await?;
    info!(username = %user.username, method, "Method preference updated");

    Ok(Json(json!({ "success": true, "method": method })))
}

pub async fn get_water_hardness(Extension(user): Extension<User>) -> Json<Value> {
    Json(json!({ "success": true, "waterHardness": user.water_hardness }))
}

pub async fn set_water_hardness(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let value = match payload.get("waterHardness") {
        None | Some(Value::Null) => {
            return Err(ApiError::bad_request("Water hardness value required"))
        }
        Some(value) => value,
    };

    let hardness = parse_hardness(value)
        .ok_or_else(|| ApiError::bad_request("Valid water hardness required (0-50 °dH)"))?;

    state.store.set_water_hardness(user.id, hardness).await?;
    info!(username = %user.username, hardness, "Water hardness updated");

    Ok(Json(json!({ "success": true, "waterHardness": hardness })))
}

/// Accepts numbers and numeric strings, bounded to the 0-50 °dH range.
fn parse_hardness(value: &Value) -> Option<f64> {
    let hardness = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    (0.0..=50.0).contains(&hardness).then_some(hardness)
}
