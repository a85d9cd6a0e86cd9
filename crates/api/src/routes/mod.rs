pub mod actions;
pub mod receipts;
pub mod usage;

use axum::{
    extract::DefaultBodyLimit, middleware::from_fn_with_state, routing::get, Json, Router,
};
use http::HeaderValue;
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use utoipa::ToSchema;

use crate::{middleware::AuthState, state::AppState};

/// 25 MB of audio grows by a third under base64, plus JSON framing.
const MAX_REQUEST_BODY_BYTES: usize = 48 * 1024 * 1024;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: &'static str,
    /// API version
    pub version: &'static str,
}

/// Health check endpoint
///
/// Used by load balancers and monitoring to verify service availability.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn is_origin_allowed(origin_str: &str, cors_config: &config::CorsConfig) -> bool {
    if cors_config.exact_matches.iter().any(|o| o == origin_str) {
        return true;
    }

    if let Some(remainder) = origin_str.strip_prefix("http://localhost") {
        if remainder.is_empty() || remainder.starts_with(':') {
            return true;
        }
    }

    if let Some(remainder) = origin_str.strip_prefix("http://127.0.0.1") {
        if remainder.is_empty() || remainder.starts_with(':') {
            return true;
        }
    }

    if origin_str.starts_with("https://")
        && cors_config
            .wildcard_suffixes
            .iter()
            .any(|suffix| origin_str.ends_with(suffix))
    {
        return true;
    }

    false
}

/// Create the main API router
pub fn create_router(app_state: AppState, auth_state: AuthState) -> Router {
    // Everything except /health requires a verified caller identity.
    let authed_routes = actions::create_actions_router()
        .merge(usage::create_usage_router())
        .merge(receipts::create_receipts_router())
        .layer(from_fn_with_state(
            auth_state,
            crate::middleware::auth_middleware,
        ))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES));

    Router::new()
        .route("/health", get(health_check))
        .merge(authed_routes)
        .with_state(app_state)
}

/// Create the main API router with CORS configuration
pub fn create_router_with_cors(
    app_state: AppState,
    auth_state: AuthState,
    cors_config: config::CorsConfig,
) -> Router {
    let cors_config_clone = cors_config.clone();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _request_parts: &http::request::Parts| {
                let origin_str = match origin.to_str() {
                    Ok(s) => s,
                    Err(_) => return false,
                };
                is_origin_allowed(origin_str, &cors_config_clone)
            },
        ))
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    create_router(app_state, auth_state).layer(cors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cors_config() -> config::CorsConfig {
        config::CorsConfig {
            exact_matches: vec!["https://app.example.com".to_string()],
            wildcard_suffixes: vec![".example.dev".to_string()],
        }
    }

    #[test]
    fn exact_origin_is_allowed() {
        assert!(is_origin_allowed("https://app.example.com", &cors_config()));
        assert!(!is_origin_allowed("https://evil.example.org", &cors_config()));
    }

    #[test]
    fn localhost_is_always_allowed() {
        assert!(is_origin_allowed("http://localhost:3000", &cors_config()));
        assert!(is_origin_allowed("http://127.0.0.1:8080", &cors_config()));
        assert!(!is_origin_allowed(
            "http://localhost.evil.com",
            &cors_config()
        ));
    }

    #[test]
    fn wildcard_suffix_requires_https() {
        assert!(is_origin_allowed("https://pr-42.example.dev", &cors_config()));
        assert!(!is_origin_allowed("http://pr-42.example.dev", &cors_config()));
    }
}
