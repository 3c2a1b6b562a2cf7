// PATCH /api/brews/:id - card editor inline edits
use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde_json::{json, Value};
use tracing::info;

use crate::error::ApiError;
use crate::sanitize::clean_text;
use crate::state::AppState;
use crate::storage::{CoffeeRow, StoreError, User};

use super::coffees::{document_object, saved_at, stable_id};

const PATCHABLE_FIELDS: [(&str, &str); 3] = [
    ("coffee_name", "name"),
    ("origin", "origin"),
    ("roastery", "roastery"),
];

/// Partial edit of one stored coffee. Accepts the whitelisted fields only,
/// locates the target row by uid, row id, document `savedAt` or array index,
/// and re-saves that document under its existing uid.
pub async fn patch_brew(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let updates = sanitized_updates(&payload);
    if updates.is_empty() {
        return Err(ApiError::bad_request("No valid fields to update"));
    }

    let rows = state.store.get_user_coffees(user.id).await?;
    if rows.is_empty() {
        return Err(ApiError::not_found("No coffees found for user"));
    }

    let row = find_target(&rows, &id).ok_or_else(|| ApiError::not_found("Coffee not found"))?;

    let mut doc = document_object(row);
    for (target, value) in &updates {
        doc.insert((*target).to_string(), Value::String(value.clone()));
    }

    let uid = match row.coffee_uid.as_deref() {
        Some(existing) if !existing.is_empty() => existing.to_string(),
        _ => row.id.to_string(),
    };
    let data = serde_json::to_string(&Value::Object(doc.clone())).map_err(StoreError::from)?;

    let mut tx = state.store.begin().await?;
    tx.save_coffee(user.id, &uid, &data, row.method.as_deref())
        .await?;
    tx.commit().await?;

    info!(
        username = %user.username,
        id = %id,
        fields = ?updates.iter().map(|(target, _)| *target).collect::<Vec<_>>(),
        "Brew updated"
    );

    let mut coffee = doc;
    coffee.insert("id".to_string(), stable_id(row));
    coffee.insert("savedAt".to_string(), Value::String(saved_at(row)));

    Ok(Json(json!({ "success": true, "coffee": Value::Object(coffee) })))
}

/// Whitelisted patch fields, stringified, trimmed and cleaned.
/// `coffee_name` maps onto the document's `name` field.
fn sanitized_updates(payload: &Value) -> Vec<(&'static str, String)> {
    PATCHABLE_FIELDS
        .iter()
        .filter_map(|(field, target)| {
            let value = scalar_string(payload.get(field)?)?;
            Some((*target, clean_text(value.trim(), 200)))
        })
        .collect()
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn find_target<'a>(rows: &'a [CoffeeRow], id: &str) -> Option<&'a CoffeeRow> {
    rows.iter()
        .enumerate()
        .find(|(index, row)| {
            row.coffee_uid.as_deref() == Some(id)
                || row.id.to_string() == id
                || saved_at_matches(row, id)
                || index.to_string() == id
        })
        .map(|(_, row)| row)
}

/// Clients sometimes address a coffee by the `savedAt` they last saw, which
/// lives inside the stored document after a round trip.
fn saved_at_matches(row: &CoffeeRow, id: &str) -> bool {
    match document_object(row).get("savedAt") {
        Some(Value::String(s)) => s == id,
        Some(Value::Number(n)) => n.to_string() == id,
        _ => false,
    }
}
