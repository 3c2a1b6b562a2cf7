//! Coffee document sanitization.
//!
//! Everything here is pure and takes `serde_json::Value` so malformed client
//! payloads degrade to empty/default values instead of erroring. Unrecognized
//! fields are always passed through untouched so older clients keep working.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Feedback history entries kept per coffee (most recent wins).
pub const MAX_HISTORY_ENTRIES: usize = 30;

/// Returned when a process name is missing or cannot be normalized.
pub const DEFAULT_PROCESS: &str = "unknown";

const FEEDBACK_KEYS: [&str; 4] = ["bitterness", "sweetness", "acidity", "body"];
const FEEDBACK_VALUES: [&str; 3] = ["low", "balanced", "high"];

const VALID_PROCESSES: [&str; 10] = [
    "washed",
    "natural",
    "honey",
    "anaerobic",
    "anaerobic natural",
    "wet hulled",
    "semi-washed",
    "pulped natural",
    "carbonic maceration",
    "unknown",
];

/// Removes HTML tags and entities from a string value. Non-strings become `""`.
///
/// Runs to a fixed point so tags re-formed by a previous removal pass
/// (`<scr<script>ipt>` and friends) are fully eliminated. Idempotent.
pub fn strip_html(value: &Value) -> String {
    match value.as_str() {
        Some(s) => strip_html_str(s),
        None => String::new(),
    }
}

/// First `max_length` characters of a string value. Non-strings become `""`.
pub fn truncate_string(value: &Value, max_length: usize) -> String {
    match value.as_str() {
        Some(s) => truncate_str(s, max_length),
        None => String::new(),
    }
}

/// Strip + truncate in one step, for free-text fields.
pub fn clean_text(input: &str, max_length: usize) -> String {
    truncate_str(&strip_html_str(input), max_length)
}

/// Cleans an altitude value down to digits, hyphens and whitespace, trimmed
/// and capped at 50 characters. Accepts strings and numbers; anything else
/// (and zero, matching the historical behavior) becomes `""`.
pub fn clean_altitude(value: &Value) -> String {
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => {
            if n.as_f64() == Some(0.0) {
                return String::new();
            }
            n.to_string()
        }
        _ => return String::new(),
    };
    if raw.is_empty() {
        return String::new();
    }
    let stripped = strip_html_str(&raw);
    let filtered: String = stripped
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '-' || c.is_whitespace())
        .collect();
    truncate_str(filtered.trim(), 50)
}

/// Normalizes a process name against the known list.
///
/// Exact matches (after stripping, lowercasing and trimming) win; otherwise
/// the first list entry contained in the input as a substring is used, so
/// "Honey Process" normalizes to "honey". Everything else falls back to
/// [`DEFAULT_PROCESS`].
pub fn validate_process(value: &Value) -> String {
    let raw = match value.as_str() {
        Some(s) if !s.is_empty() => s,
        _ => return DEFAULT_PROCESS.to_string(),
    };

    let lowered = strip_html_str(raw).to_lowercase();
    let cleaned = lowered.trim();

    if VALID_PROCESSES.contains(&cleaned) {
        return cleaned.to_string();
    }
    for valid in VALID_PROCESSES {
        if cleaned.contains(valid) {
            return valid.to_string();
        }
    }

    DEFAULT_PROCESS.to_string()
}

/// Normalizes a feedback object: recognized keys keep only the known enum
/// values (case-normalized), recognized keys with invalid string values are
/// dropped, and everything else passes through for backwards compatibility.
/// Non-object input is returned unchanged.
pub fn normalize_feedback(value: &Value) -> Value {
    let map = match value.as_object() {
        Some(m) => m,
        None => return value.clone(),
    };

    let mut normalized = Map::with_capacity(map.len());
    for (key, entry) in map {
        if FEEDBACK_KEYS.contains(&key.as_str()) {
            if let Some(s) = entry.as_str() {
                let cleaned = s.to_lowercase().trim().to_string();
                if FEEDBACK_VALUES.contains(&cleaned.as_str()) {
                    normalized.insert(key.clone(), Value::String(cleaned));
                }
                continue;
            }
        }
        normalized.insert(key.clone(), entry.clone());
    }

    Value::Object(normalized)
}

/// Normalizes a feedback history array: keeps the last [`MAX_HISTORY_ENTRIES`]
/// entries, drops entries without a parseable timestamp, and rebuilds the
/// survivors from recognized, type-checked fields only. Non-array input is
/// returned unchanged.
pub fn normalize_feedback_history(value: &Value) -> Value {
    let entries = match value.as_array() {
        Some(list) => list,
        None => return value.clone(),
    };

    let start = entries.len().saturating_sub(MAX_HISTORY_ENTRIES);
    let mut normalized = Vec::new();

    for entry in &entries[start..] {
        let map = match entry.as_object() {
            Some(m) => m,
            None => continue,
        };

        let timestamp = match map
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_history_timestamp)
        {
            Some(ts) => ts,
            None => continue,
        };

        let mut rebuilt = Map::new();
        rebuilt.insert(
            "timestamp".to_string(),
            Value::String(timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );

        for (field, max_length) in [
            ("previousGrind", 100),
            ("newGrind", 100),
            ("previousTemp", 50),
            ("newTemp", 50),
        ] {
            if let Some(s) = map.get(field).and_then(Value::as_str) {
                rebuilt.insert(field.to_string(), Value::String(truncate_str(s, max_length)));
            }
        }

        // serde_json numbers are always finite, so is_number covers the check.
        if let Some(delta) = map.get("grindOffsetDelta") {
            if delta.is_number() {
                rebuilt.insert("grindOffsetDelta".to_string(), delta.clone());
            }
        }
        for flag in ["customTempApplied", "resetToInitial"] {
            if let Some(b) = map.get(flag).and_then(Value::as_bool) {
                rebuilt.insert(flag.to_string(), Value::Bool(b));
            }
        }

        normalized.push(Value::Object(rebuilt));
    }

    Value::Array(normalized)
}

/// Sanitizes a complete coffee document before persistence.
///
/// Starts from a shallow copy (unknown fields survive), then overwrites the
/// free-text fields with stripped/truncated versions, `process` and
/// `altitude` with their normalized forms, and the feedback structures with
/// their normalized forms. Non-object input becomes `{}`.
pub fn sanitize_coffee_data(value: &Value) -> Value {
    let doc = match value.as_object() {
        Some(m) => m,
        None => return Value::Object(Map::new()),
    };

    let mut sanitized = doc.clone();

    for (field, max_length) in [
        ("name", 200),
        ("origin", 200),
        ("cultivar", 200),
        ("roaster", 200),
        ("roastery", 200),
        ("tastingNotes", 500),
    ] {
        if let Some(v) = doc.get(field) {
            let cleaned = match v.as_str() {
                Some(s) => clean_text(s, max_length),
                None => String::new(),
            };
            sanitized.insert(field.to_string(), Value::String(cleaned));
        }
    }

    if let Some(v) = doc.get("process") {
        sanitized.insert("process".to_string(), Value::String(validate_process(v)));
    }
    if let Some(v) = doc.get("altitude") {
        sanitized.insert("altitude".to_string(), Value::String(clean_altitude(v)));
    }
    if let Some(v) = doc.get("feedback") {
        sanitized.insert("feedback".to_string(), normalize_feedback(v));
    }
    if let Some(v) = doc.get("feedbackHistory") {
        sanitized.insert(
            "feedbackHistory".to_string(),
            normalize_feedback_history(v),
        );
    }

    Value::Object(sanitized)
}

fn strip_html_str(input: &str) -> String {
    let mut current = input.to_string();
    loop {
        let next = strip_entities(&strip_tags(&current));
        if next == current {
            return next;
        }
        current = next;
    }
}

// Removes every span from '<' to the next '>'. A '<' without a closing '>'
// is kept verbatim.
fn strip_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        match rest[start + 1..].find('>') {
            Some(end) => rest = &rest[start + 1 + end + 1..],
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

// Removes every span from '&' to the next ';' with at least one character
// in between.
fn strip_entities(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        match rest[start + 1..].find(';') {
            Some(end) if end > 0 => rest = &rest[start + 1 + end + 1..],
            _ => {
                out.push('&');
                rest = &rest[start + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn truncate_str(input: &str, max_length: usize) -> String {
    input.chars().take(max_length).collect()
}

fn parse_history_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if raw.len() > 50 {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_simple_tags() {
        assert_eq!(strip_html(&json!("<b>Bold</b>")), "Bold");
        assert_eq!(
            strip_html(&json!("<script>alert(\"xss\")</script>")),
            "alert(\"xss\")"
        );
        assert_eq!(strip_html(&json!("<div class=\"test\">Content</div>")), "Content");
        assert_eq!(strip_html(&json!("<p>Hello <b>World</b></p>")), "Hello World");
    }

    #[test]
    fn strips_entities() {
        assert_eq!(strip_html(&json!("&lt;script&gt;")), "script");
        assert_eq!(strip_html(&json!("&amp;")), "");
        assert_eq!(strip_html(&json!("Test&nbsp;Text")), "TestText");
    }

    #[test]
    fn strips_nested_and_malformed_tags() {
        assert_eq!(strip_html(&json!("<script<script>>")), ">");
        assert_eq!(strip_html(&json!("<<script>>alert(1)<</script>>")), ">alert(1)>");
        assert_eq!(
            strip_html(&json!("<b>Normal <script>evil</script> text</b>")),
            "Normal evil text"
        );
    }

    #[test]
    fn strip_html_rejects_non_strings() {
        assert_eq!(strip_html(&Value::Null), "");
        assert_eq!(strip_html(&json!(123)), "");
        assert_eq!(strip_html(&json!(["<b>x</b>"])), "");
        assert_eq!(strip_html(&json!("Plain text")), "Plain text");
    }

    #[test]
    fn strip_html_is_idempotent() {
        for input in ["<script<script>>", "&lt;b&gt;bold&lt;/b&gt;", "Plain", "<<a>><<b>>"] {
            let once = strip_html(&json!(input));
            let twice = strip_html(&json!(once));
            assert_eq!(once, twice, "not a fixed point for {input:?}");
        }
    }

    #[test]
    fn truncates_long_strings() {
        let long = "a".repeat(300);
        assert_eq!(truncate_string(&json!(long), 200), "a".repeat(200));
        assert_eq!(truncate_string(&json!("Short"), 200), "Short");
        let exact = "a".repeat(200);
        assert_eq!(truncate_string(&json!(exact.clone()), 200), exact);
        assert_eq!(truncate_string(&json!(42), 200), "");
    }

    #[test]
    fn truncate_length_bound() {
        for (input, max) in [("hello", 3), ("hello", 10), ("", 5)] {
            let out = truncate_string(&json!(input), max);
            assert_eq!(out.chars().count(), input.chars().count().min(max));
        }
    }

    #[test]
    fn cleans_altitude() {
        assert_eq!(clean_altitude(&json!("1500")), "1500");
        assert_eq!(clean_altitude(&json!("1500 masl")), "1500");
        assert_eq!(clean_altitude(&json!("1500-1800")), "1500-1800");
        assert_eq!(clean_altitude(&json!("<b>1500</b> masl")), "1500");
        assert_eq!(clean_altitude(&json!(1500)), "1500");
        assert_eq!(clean_altitude(&json!(0)), "");
        assert_eq!(clean_altitude(&json!("")), "");
        assert_eq!(clean_altitude(&Value::Null), "");
    }

    #[test]
    fn altitude_output_is_bounded_and_clean() {
        let noisy = format!("<i>{}</i> meters above sea level!!", "12-3 ".repeat(30));
        let out = clean_altitude(&json!(noisy));
        assert!(out.chars().count() <= 50);
        assert!(out
            .chars()
            .all(|c| c.is_ascii_digit() || c == '-' || c.is_whitespace()));
    }

    #[test]
    fn validates_known_processes() {
        assert_eq!(validate_process(&json!("washed")), "washed");
        assert_eq!(validate_process(&json!("natural")), "natural");
        assert_eq!(validate_process(&json!("honey")), "honey");
        assert_eq!(validate_process(&json!("anaerobic natural")), "anaerobic natural");
        assert_eq!(validate_process(&json!("unknown")), "unknown");
    }

    #[test]
    fn process_is_case_insensitive_and_html_agnostic() {
        assert_eq!(validate_process(&json!("WASHED")), "washed");
        assert_eq!(validate_process(&json!("HoNeY")), "honey");
        assert_eq!(validate_process(&json!("<b>washed</b>")), "washed");
        assert_eq!(
            validate_process(&json!("<b>WASHED</b>")),
            validate_process(&json!("washed"))
        );
    }

    #[test]
    fn process_matches_substrings() {
        assert_eq!(validate_process(&json!("honey process")), "honey");
        assert_eq!(validate_process(&json!("washed method")), "washed");
    }

    #[test]
    fn process_defaults_to_unknown() {
        assert_eq!(validate_process(&json!("invalid")), "unknown");
        assert_eq!(validate_process(&json!("some random text")), "unknown");
        assert_eq!(validate_process(&json!("")), "unknown");
        assert_eq!(validate_process(&Value::Null), "unknown");
        assert_eq!(validate_process(&json!(123)), "unknown");
    }

    #[test]
    fn sanitizes_string_fields() {
        let input = json!({
            "name": "<script>Evil Coffee</script>",
            "origin": "<b>Ethiopia</b>",
            "cultivar": "<div>Heirloom</div>",
            "roaster": "<a href=\"evil.com\">Roaster</a>",
            "roastery": "<i>The Barn</i>",
            "tastingNotes": "<p>Fruity and sweet</p>",
            "process": "washed",
            "altitude": "1500"
        });

        let result = sanitize_coffee_data(&input);

        assert_eq!(result["name"], "Evil Coffee");
        assert_eq!(result["origin"], "Ethiopia");
        assert_eq!(result["cultivar"], "Heirloom");
        assert_eq!(result["roaster"], "Roaster");
        assert_eq!(result["roastery"], "The Barn");
        assert_eq!(result["tastingNotes"], "Fruity and sweet");
        assert_eq!(result["process"], "washed");
        assert_eq!(result["altitude"], "1500");
    }

    #[test]
    fn sanitize_truncates_fields() {
        let input = json!({
            "name": "a".repeat(300),
            "origin": "b".repeat(300),
            "tastingNotes": "e".repeat(600),
        });

        let result = sanitize_coffee_data(&input);

        assert_eq!(result["name"].as_str().unwrap().len(), 200);
        assert_eq!(result["origin"].as_str().unwrap().len(), 200);
        assert_eq!(result["tastingNotes"].as_str().unwrap().len(), 500);
    }

    #[test]
    fn sanitize_preserves_unknown_fields() {
        let input = json!({
            "name": "Kochere",
            "addedDate": "2025-03-01",
            "brewCount": 7,
            "favorite": true,
            "legacyField": {"nested": "kept"}
        });

        let result = sanitize_coffee_data(&input);

        assert_eq!(result["addedDate"], "2025-03-01");
        assert_eq!(result["brewCount"], 7);
        assert_eq!(result["favorite"], true);
        assert_eq!(result["legacyField"]["nested"], "kept");
    }

    #[test]
    fn sanitize_handles_degenerate_input() {
        assert_eq!(sanitize_coffee_data(&Value::Null), json!({}));
        assert_eq!(sanitize_coffee_data(&json!({})), json!({}));
        assert_eq!(sanitize_coffee_data(&json!("text")), json!({}));
        assert_eq!(sanitize_coffee_data(&json!([1, 2])), json!({}));
    }

    #[test]
    fn sanitize_example_scenario() {
        let input = json!({
            "name": "<script>x</script>Coffee",
            "altitude": "1500 masl",
            "process": "Honey Process"
        });

        let result = sanitize_coffee_data(&input);

        assert_eq!(result["name"], "xCoffee");
        assert_eq!(result["altitude"], "1500");
        assert_eq!(result["process"], "honey");
    }

    #[test]
    fn feedback_keeps_valid_values_and_unknown_keys() {
        let input = json!({
            "feedback": {
                "bitterness": "HIGH",
                "sweetness": "balanced",
                "acidity": "low",
                "body": "invalid",
                "legacyKey": "keep-me"
            }
        });

        let result = sanitize_coffee_data(&input);

        assert_eq!(
            result["feedback"],
            json!({
                "bitterness": "high",
                "sweetness": "balanced",
                "acidity": "low",
                "legacyKey": "keep-me"
            })
        );
    }

    #[test]
    fn feedback_keeps_recognized_keys_with_non_string_values() {
        let result = normalize_feedback(&json!({"bitterness": 3, "body": true}));
        assert_eq!(result, json!({"bitterness": 3, "body": true}));
    }

    #[test]
    fn feedback_passes_non_objects_through() {
        assert_eq!(normalize_feedback(&Value::Null), Value::Null);
        assert_eq!(normalize_feedback(&json!("high")), json!("high"));
        assert_eq!(normalize_feedback(&json!([1])), json!([1]));
    }

    #[test]
    fn history_caps_entries_and_drops_invalid() {
        let mut entries: Vec<Value> = (0..35)
            .map(|i| {
                json!({
                    "timestamp": format!("2025-01-{:02}T00:00:00.000Z", i + 1),
                    "previousGrind": format!("old-{i}"),
                    "newGrind": format!("new-{i}"),
                    "previousTemp": "92",
                    "newTemp": "93",
                    "grindOffsetDelta": 0.5,
                    "customTempApplied": i % 2 == 0,
                    "resetToInitial": i % 3 == 0,
                })
            })
            .collect();
        entries.push(json!({"timestamp": "not-a-date", "previousGrind": "x"}));

        let result = sanitize_coffee_data(&json!({"feedbackHistory": entries}));
        let history = result["feedbackHistory"].as_array().unwrap();

        assert_eq!(history.len(), 29);
        assert_eq!(history[0]["previousGrind"], "old-6");
        assert_eq!(history[history.len() - 1]["newGrind"], "new-34");
    }

    #[test]
    fn history_rebuilds_entries_from_recognized_fields() {
        let input = json!([{
            "timestamp": "2025-06-01T10:30:00.000Z",
            "previousGrind": "g".repeat(150),
            "newTemp": "94",
            "grindOffsetDelta": 1.25,
            "customTempApplied": true,
            "injected": "<script>x</script>"
        }]);

        let result = normalize_feedback_history(&input);
        let entry = &result.as_array().unwrap()[0];

        assert_eq!(entry["timestamp"], "2025-06-01T10:30:00.000Z");
        assert_eq!(entry["previousGrind"].as_str().unwrap().len(), 100);
        assert_eq!(entry["newTemp"], "94");
        assert_eq!(entry["grindOffsetDelta"], 1.25);
        assert_eq!(entry["customTempApplied"], true);
        assert!(entry.get("injected").is_none());
        assert!(entry.get("newGrind").is_none());
    }

    #[test]
    fn history_normalizes_timestamp_formats() {
        let input = json!([
            {"timestamp": "2025-06-01"},
            {"timestamp": "2025-06-01T10:30:00"},
            {"timestamp": "2025-06-01T10:30:00+02:00"},
            {"timestamp": format!("2025-06-01T10:30:00.000Z{}", " ".repeat(60))},
        ]);

        let result = normalize_feedback_history(&input);
        let history = result.as_array().unwrap();

        assert_eq!(history.len(), 3);
        assert_eq!(history[0]["timestamp"], "2025-06-01T00:00:00.000Z");
        assert_eq!(history[1]["timestamp"], "2025-06-01T10:30:00.000Z");
        assert_eq!(history[2]["timestamp"], "2025-06-01T08:30:00.000Z");
    }

    #[test]
    fn history_passes_non_arrays_through() {
        assert_eq!(normalize_feedback_history(&Value::Null), Value::Null);
        assert_eq!(normalize_feedback_history(&json!({"a": 1})), json!({"a": 1}));
    }
}
