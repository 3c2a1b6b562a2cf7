// GET and POST /api/coffees
use axum::{extract::State, Extension, Json};
use chrono::SecondsFormat;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;
use crate::storage::{CoffeeRow, User};
use crate::sync::sync_coffees;

pub async fn list_coffees(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, ApiError> {
    state.store.touch_last_login(user.id).await?;

    let rows = state.store.get_user_coffees(user.id).await?;
    let coffees: Vec<Value> = rows.iter().map(present_row).collect();

    Ok(Json(json!({ "success": true, "coffees": coffees })))
}

/// Full-set sync: upserts every submitted document under its stable uid,
/// then drops rows absent from the submission. All inside one transaction.
pub async fn save_coffees(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let docs = coffee_documents(&payload)?;
    let saved = sync_coffees(state.store.as_ref(), user.id, &docs).await?;

    info!(username = %user.username, saved, "Coffee collection synced");

    Ok(Json(json!({ "success": true, "saved": saved })))
}

/// A missing or null `coffees` field means "empty set" and clears the
/// collection; any other non-array shape is rejected before any write.
fn coffee_documents(payload: &Value) -> Result<Vec<Value>, ApiError> {
    match payload.get("coffees") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => {
            if items.iter().any(|item| !item.is_object()) {
                return Err(ApiError::bad_request("Each coffee must be an object"));
            }
            Ok(items.clone())
        }
        Some(_) => Err(ApiError::bad_request("Coffees must be an array")),
    }
}

/// Caller-visible projection of a stored row: the stable id, the document's
/// own fields, and the row timestamp as `savedAt`. A document's own `id`
/// field wins over the computed one; `savedAt` always reflects the row.
fn present_row(row: &CoffeeRow) -> Value {
    let mut out = Map::new();
    out.insert("id".to_string(), stable_id(row));
    for (key, value) in document_object(row) {
        out.insert(key, value);
    }
    out.insert("savedAt".to_string(), Value::String(saved_at(row)));
    Value::Object(out)
}

/// The row's uid when it has one, the numeric row id otherwise.
pub(crate) fn stable_id(row: &CoffeeRow) -> Value {
    match row.coffee_uid.as_deref() {
        Some(uid) if !uid.is_empty() => Value::String(uid.to_string()),
        _ => Value::from(row.id),
    }
}

/// Parses the stored document; anything but a JSON object degrades to an
/// empty one.
pub(crate) fn document_object(row: &CoffeeRow) -> Map<String, Value> {
    match serde_json::from_str::<Value>(&row.data) {
        Ok(Value::Object(doc)) => doc,
        _ => Map::new(),
    }
}

pub(crate) fn saved_at(row: &CoffeeRow) -> String {
    row.created_at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
