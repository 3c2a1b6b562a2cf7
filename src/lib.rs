use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::routing::{get, patch, post};
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod sanitize;
pub mod state;
pub mod storage;
pub mod sync;
pub mod vision;

use crate::state::AppState;

/// Builds the full application router. Lives in the library so integration
/// tests can drive it in-process against a disposable store.
pub fn app(state: AppState) -> Router {
    handlers::health::init_uptime();

    Router::new()
        // Public
        .merge(public_routes())
        // Device-bound token required
        .merge(coffee_routes(&state))
        .merge(preference_routes(&state))
        .merge(analyze_routes(&state))
        // General limiter covers every /api route; the 404 fallback stays outside it
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::api_rate_limit,
        ))
        .fallback(endpoint_not_found)
        // Global middleware
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(
            config::config().server.max_request_size_bytes,
        ))
        .with_state(state)
}

fn public_routes() -> Router<AppState> {
    use handlers::{auth, health};

    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/validate", get(auth::validate))
}

fn coffee_routes(state: &AppState) -> Router<AppState> {
    use handlers::{brews, coffees};

    Router::new()
        .route(
            "/api/coffees",
            get(coffees::list_coffees).post(coffees::save_coffees),
        )
        .route("/api/brews/:id", patch(brews::patch_brew))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_user,
        ))
}

fn preference_routes(state: &AppState) -> Router<AppState> {
    use handlers::preferences;

    Router::new()
        .route(
            "/api/grinder",
            get(preferences::get_grinder).post(preferences::set_grinder),
        )
        .route(
            "/api/method",
            get(preferences::get_method).post(preferences::set_method),
        )
        .route(
            "/api/water-hardness",
            get(preferences::get_water_hardness).post(preferences::set_water_hardness),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_user,
        ))
}

fn analyze_routes(state: &AppState) -> Router<AppState> {
    use handlers::analyze;

    // AI limiter sits outside auth: over-limit requests are refused before the
    // token is even looked at.
    Router::new()
        .route("/api/analyze", post(analyze::analyze_image))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_user,
        ))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::ai_rate_limit,
        ))
}

async fn endpoint_not_found() -> error::ApiError {
    error::ApiError::not_found("Endpoint not found")
}

fn cors_layer() -> CorsLayer {
    let origins: Vec<HeaderValue> = config::config()
        .security
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-device-id"),
        ])
        .allow_credentials(true)
}
