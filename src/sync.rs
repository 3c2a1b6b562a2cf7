//! Stable coffee identity and the bulk-sync algorithm.

use std::fmt::Write as _;

use serde::Serialize;
use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::sanitize::{normalize_feedback, normalize_feedback_history, sanitize_coffee_data};
use crate::storage::{Store, StoreError};

/// Fingerprint source for documents without a client-supplied id.
///
/// Field order and the absent-vs-null distinction are part of the wire
/// contract: the serialized form must match what earlier versions of the app
/// hashed, or existing rows stop matching their re-submitted documents.
#[derive(Serialize)]
struct UidFingerprint<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    roaster: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    roastery: Option<&'a Value>,
    #[serde(rename = "addedDate", skip_serializing_if = "Option::is_none")]
    added_date: Option<&'a Value>,
}

/// Stable identity for a coffee document: the client-supplied `id` (string
/// or number, trimmed) when present, otherwise a SHA-1 hex digest over the
/// identifying fields. Feedback and other mutable fields never participate,
/// so edits keep the same uid.
pub fn stable_coffee_uid(doc: &Value) -> String {
    match doc.get("id") {
        Some(Value::String(id)) => return id.trim().to_string(),
        Some(Value::Number(id)) => return id.to_string(),
        _ => {}
    }

    let fingerprint = UidFingerprint {
        name: doc.get("name"),
        origin: doc.get("origin"),
        roaster: doc.get("roaster"),
        roastery: doc.get("roastery"),
        added_date: doc.get("addedDate"),
    };
    // A plain field struct always serializes.
    let serialized = serde_json::to_string(&fingerprint).unwrap_or_default();
    sha1_hex(serialized.as_bytes())
}

/// Replaces a user's visible coffee set with the supplied documents.
///
/// Every document is normalized, keyed and upserted; afterwards rows absent
/// from this submission are deleted, and only then does the transaction
/// commit. Upserting before deleting is load-bearing: any failure before the
/// commit leaves the previous complete set intact instead of an empty or
/// half-deleted one. Returns the number of documents accepted.
pub async fn sync_coffees(
    store: &dyn Store,
    user_id: i64,
    coffees: &[Value],
) -> Result<usize, StoreError> {
    // Dropping the handle on an early return rolls the whole batch back.
    let mut tx = store.begin().await?;
    let mut keep_uids = Vec::with_capacity(coffees.len());

    for coffee in coffees {
        let prepared = pre_normalize(coffee);
        let uid = stable_coffee_uid(&prepared);

        let sanitized = sanitize_coffee_data(&prepared);
        let method = sanitized
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let data = serde_json::to_string(&sanitized)?;

        tx.save_coffee(user_id, &uid, &data, method.as_deref()).await?;
        keep_uids.push(uid);
    }

    tx.replace_user_coffees(user_id, &keep_uids).await?;
    tx.commit().await?;

    Ok(coffees.len())
}

/// Normalizes the feedback structures before the uid is computed and the
/// document is sanitized, so a malformed feedback blob cannot change a
/// coffee's identity or survive into storage.
fn pre_normalize(coffee: &Value) -> Value {
    let mut doc = match coffee.as_object() {
        Some(map) => map.clone(),
        None => return coffee.clone(),
    };

    if let Some(feedback) = doc.remove("feedback") {
        doc.insert("feedback".to_string(), normalize_feedback(&feedback));
    }
    if let Some(history) = doc.remove("feedbackHistory") {
        doc.insert(
            "feedbackHistory".to_string(),
            normalize_feedback_history(&history),
        );
    }

    Value::Object(doc)
}

fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
