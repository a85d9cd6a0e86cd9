use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use services::auth::ports::IdentityVerifier;
use services::UserId;

use crate::error::ApiError;

/// Verified caller identity inserted into request extensions by the auth
/// middleware. Extract in route handlers using
/// `Extension<AuthenticatedCaller>`.
#[derive(Debug, Clone)]
pub struct AuthenticatedCaller {
    pub user_id: UserId,
    /// Self-reported device identifier from the `x-device-id` header. An
    /// anti-abuse signal, never an authentication factor.
    pub device_id: Option<String>,
}

/// State for authentication middleware
#[derive(Clone)]
pub struct AuthState {
    pub identity_verifier: Arc<dyn IdentityVerifier>,
}

fn extract_bearer_token(request: &Request) -> Result<&str, ApiError> {
    let auth_value = request
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(ApiError::missing_auth_header)?;

    auth_value
        .strip_prefix("Bearer ")
        .ok_or_else(ApiError::invalid_auth_header)
}

pub async fn auth_middleware(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(&request)?;
    let verified = auth_state.identity_verifier.verify(token)?;

    let device_id = request
        .headers()
        .get("x-device-id")
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);

    request.extensions_mut().insert(AuthenticatedCaller {
        user_id: verified.user_id,
        device_id,
    });

    Ok(next.run(request).await)
}
