// Token + device-binding authentication
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use serde_json::{json, Value};

use crate::config;
use crate::error::ApiError;
use crate::state::AppState;
use crate::storage::{Store, User};

/// Raw credentials pulled from a request before any validation.
#[derive(Debug, Default, Clone)]
pub struct Credentials {
    pub token: Option<String>,
    pub device_id: Option<String>,
}

/// Resolves the token and device id independently, each preferring the
/// transport slot over the body over the query string. Empty values at a
/// higher level fall through to the next one.
pub fn extract_credentials(
    headers: &HeaderMap,
    body: Option<&Value>,
    query: Option<&str>,
) -> Credentials {
    let token = first_non_empty([
        bearer_token(headers),
        body_string(body, "token"),
        query_param(query, "token"),
    ]);

    let device_id = first_non_empty([
        header_value(headers, "x-device-id"),
        body_string(body, "deviceId"),
        query_param(query, "deviceId"),
    ]);

    Credentials { token, device_id }
}

/// Middleware for routes that require an authenticated user. Buffers the
/// request body so the body-level credential fallback can look inside it,
/// then restores the body for the handler and injects the [`User`] as an
/// extension.
pub async fn require_user(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();

    let limit = config::config().server.max_request_size_bytes;
    let bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| ApiError::bad_request("Invalid request body"))?;
    let body_json: Option<Value> = serde_json::from_slice(&bytes).ok();

    let credentials = extract_credentials(&parts.headers, body_json.as_ref(), parts.uri.query());
    let user = authenticate_request(state.store.as_ref(), &credentials, &parts.headers).await?;

    let mut request = Request::from_parts(parts, Body::from(bytes));
    request.extensions_mut().insert(user);

    Ok(next.run(request).await)
}

/// The device-binding state machine. Missing credentials and unknown tokens
/// reject; an unbound user gets bound to the presented device; a bound user
/// must present the same device id.
pub async fn authenticate_request(
    store: &dyn Store,
    credentials: &Credentials,
    headers: &HeaderMap,
) -> Result<User, ApiError> {
    let token = credentials
        .token
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("Token required"))?;
    let device_id = credentials
        .device_id
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("Device ID required"))?;

    let user = store
        .user_by_token(token, None)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid token"))?;

    match user.device_id.as_deref() {
        Some(bound) if bound == device_id => Ok(user),
        Some(_) => Err(ApiError::forbidden(
            "This token is already bound to another device",
        )),
        None => {
            let info = device_info_snapshot(headers);
            let won = store.bind_device(user.id, device_id, &info).await?;

            if won {
                tracing::info!(
                    username = %user.username,
                    device = %device_prefix(device_id),
                    "Device bound to token"
                );
                let mut user = user;
                user.device_id = Some(device_id.to_string());
                return Ok(user);
            }

            // Lost the first-use race: another request bound a device between
            // our read and the conditional update. Re-read and apply the
            // normal mismatch rule.
            let fresh = store
                .user_by_token(token, None)
                .await?
                .ok_or_else(|| ApiError::unauthorized("Invalid token"))?;

            match fresh.device_id.as_deref() {
                Some(bound) if bound == device_id => Ok(fresh),
                _ => Err(ApiError::forbidden(
                    "This token is already bound to another device",
                )),
            }
        }
    }
}

/// Coarse client metadata recorded at binding time: platform, OS family and
/// a bounded prefix of the user agent. Never consulted for authorization.
pub fn device_info_snapshot(headers: &HeaderMap) -> String {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    let platform = if user_agent.contains("Mobile") {
        "mobile"
    } else {
        "desktop"
    };

    let os = if user_agent.contains("Mac") {
        "macOS"
    } else if user_agent.contains("Windows") {
        "Windows"
    } else if user_agent.contains("Linux") {
        "Linux"
    } else if user_agent.contains("Android") {
        "Android"
    } else if user_agent.contains("iPhone") {
        "iOS"
    } else {
        "unknown"
    };

    let prefix: String = user_agent.chars().take(100).collect();

    json!({ "platform": platform, "os": os, "userAgent": prefix }).to_string()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::to_string)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn body_string(body: Option<&Value>, key: &str) -> Option<String> {
    body?.get(key)?.as_str().map(str::to_string)
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn first_non_empty<I>(candidates: I) -> Option<String>
where
    I: IntoIterator<Item = Option<String>>,
{
    candidates
        .into_iter()
        .flatten()
        .find(|value| !value.is_empty())
}

fn device_prefix(device_id: &str) -> String {
    device_id.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn header_credentials_win_over_body_and_query() {
        let headers = headers(&[
            ("authorization", "Bearer header-token"),
            ("x-device-id", "header-device"),
        ]);
        let body = json!({ "token": "body-token", "deviceId": "body-device" });

        let creds = extract_credentials(
            &headers,
            Some(&body),
            Some("token=query-token&deviceId=query-device"),
        );

        assert_eq!(creds.token.as_deref(), Some("header-token"));
        assert_eq!(creds.device_id.as_deref(), Some("header-device"));
    }

    #[test]
    fn body_beats_query() {
        let headers = HeaderMap::new();
        let body = json!({ "token": "body-token" });

        let creds = extract_credentials(&headers, Some(&body), Some("token=query-token"));

        assert_eq!(creds.token.as_deref(), Some("body-token"));
    }

    #[test]
    fn query_is_the_last_resort() {
        let creds = extract_credentials(
            &HeaderMap::new(),
            None,
            Some("token=query-token&deviceId=query-device"),
        );

        assert_eq!(creds.token.as_deref(), Some("query-token"));
        assert_eq!(creds.device_id.as_deref(), Some("query-device"));
    }

    #[test]
    fn empty_bearer_value_falls_through() {
        let headers = headers(&[("authorization", "Bearer ")]);
        let body = json!({ "token": "body-token" });

        let creds = extract_credentials(&headers, Some(&body), None);

        assert_eq!(creds.token.as_deref(), Some("body-token"));
    }

    #[test]
    fn non_bearer_authorization_is_ignored() {
        let headers = headers(&[("authorization", "Basic dXNlcjpwdw==")]);

        let creds = extract_credentials(&headers, None, Some("token=query-token"));

        assert_eq!(creds.token.as_deref(), Some("query-token"));
    }

    #[test]
    fn missing_everything_yields_none() {
        let creds = extract_credentials(&HeaderMap::new(), None, None);

        assert!(creds.token.is_none());
        assert!(creds.device_id.is_none());
    }

    #[test]
    fn non_string_body_fields_are_skipped() {
        let body = json!({ "token": 12345, "deviceId": true });

        let creds = extract_credentials(&HeaderMap::new(), Some(&body), None);

        assert!(creds.token.is_none());
        assert!(creds.device_id.is_none());
    }

    #[test]
    fn snapshot_classifies_desktop_mac() {
        let headers = headers(&[(
            "user-agent",
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15",
        )]);

        let info: Value = serde_json::from_str(&device_info_snapshot(&headers)).unwrap();

        assert_eq!(info["platform"], "desktop");
        assert_eq!(info["os"], "macOS");
    }

    #[test]
    fn snapshot_android_user_agent_is_mobile_linux() {
        let headers = headers(&[(
            "user-agent",
            "Mozilla/5.0 (Linux; Android 14; Pixel 8) Mobile Safari/537.36",
        )]);

        let info: Value = serde_json::from_str(&device_info_snapshot(&headers)).unwrap();

        assert_eq!(info["platform"], "mobile");
        // Linux outranks Android in the substring checks
        assert_eq!(info["os"], "Linux");
    }

    #[test]
    fn snapshot_handles_missing_user_agent() {
        let info: Value = serde_json::from_str(&device_info_snapshot(&HeaderMap::new())).unwrap();

        assert_eq!(info["platform"], "desktop");
        assert_eq!(info["os"], "unknown");
        assert_eq!(info["userAgent"], "unknown");
    }

    #[test]
    fn snapshot_bounds_the_user_agent() {
        let long = "X".repeat(300);
        let headers = headers(&[("user-agent", long.as_str())]);

        let info: Value = serde_json::from_str(&device_info_snapshot(&headers)).unwrap();

        assert_eq!(info["userAgent"].as_str().unwrap().len(), 100);
    }
}
