// POST /api/analyze - coffee label photo analysis
use axum::{extract::State, Extension, Json};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;
use crate::storage::User;
use crate::vision::NOT_COFFEE;

pub async fn analyze_image(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let image_data = payload
        .get("imageData")
        .and_then(Value::as_str)
        .filter(|data| !data.is_empty())
        .ok_or_else(|| ApiError::bad_request("Image data required"))?;
    let media_type = payload
        .get("mediaType")
        .and_then(Value::as_str)
        .unwrap_or("image/jpeg");

    info!(username = %user.username, media_type, "Label analysis started");

    let reply = state.vision.describe_image(image_data, media_type).await?;

    if reply.contains(NOT_COFFEE) {
        return Err(ApiError::unprocessable_entity("not_coffee"));
    }

    let data = extract_coffee_fields(&reply)
        .ok_or_else(|| ApiError::bad_gateway("Analysis failed. Please try again."))?;

    info!(username = %user.username, "Label analysis completed");

    Ok(Json(json!({ "success": true, "data": data })))
}

/// Pulls the outermost `{ ... }` block out of the reply (models like to wrap
/// JSON in prose or markdown fences), parses it, and maps it onto the label
/// fields the client expects. `addedDate` is always stamped fresh.
fn extract_coffee_fields(reply: &str) -> Option<Value> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    let parsed: Value = serde_json::from_str(&reply[start..=end]).ok()?;

    Some(json!({
        "name": field_or(&parsed, "name", "Unknown"),
        "origin": field_or(&parsed, "origin", "Unknown"),
        "process": field_or(&parsed, "process", "washed"),
        "cultivar": field_or(&parsed, "cultivar", "Unknown"),
        "altitude": field_or(&parsed, "altitude", "1500"),
        "roaster": field_or(&parsed, "roaster", "Unknown"),
        "tastingNotes": field_or(&parsed, "tastingNotes", "No notes"),
        "addedDate": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

/// Field lookup with fallback. Null, absent and empty values all fall back;
/// anything substantive passes through as-is.
fn field_or(parsed: &Value, key: &str, fallback: &str) -> Value {
    let substantive = match parsed.get(key) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64() != Some(0.0),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    };

    if substantive {
        parsed[key].clone()
    } else {
        Value::String(fallback.to_string())
    }
}
