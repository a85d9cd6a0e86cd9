use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use services::auth::ports::AuthError;
use services::entitlement::ports::EntitlementError;
use services::gateway::ports::GatewayError;
use services::subscription::ports::SubscriptionError;

/// Structured error response returned to API consumers
#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct ApiErrorResponse {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional structured details (e.g. `{limit, tier}` on quota errors)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Convenient wrapper type for API errors that combines status code with error response
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub response: ApiErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            response: ApiErrorResponse {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.response.details = Some(details);
        self
    }

    /// 400 Bad Request
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    /// 401 Unauthorized
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    /// 500 Internal Server Error
    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_server_error",
            message,
        )
    }

    /// 502 Bad Gateway
    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "bad_gateway", message)
    }

    /// 503 Service Unavailable
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable",
            message,
        )
    }

    /// Missing Authorization header
    pub fn missing_auth_header() -> Self {
        Self::unauthorized("Missing Authorization header")
    }

    /// Authorization header is not a Bearer token
    pub fn invalid_auth_header() -> Self {
        Self::unauthorized("Authorization header must be a Bearer token")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.response)).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::InvalidArgument(msg) => Self::bad_request(msg),
            GatewayError::QuotaExhausted { limit, tier } => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "quota_exhausted",
                "Usage limit reached for the current period",
            )
            .with_details(serde_json::json!({"limit": limit, "tier": tier})),
            GatewayError::PayloadTooLarge {
                limit_bytes,
                actual_bytes,
            } => Self::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                "Payload exceeds the size limit",
            )
            .with_details(
                serde_json::json!({"limit_bytes": limit_bytes, "actual_bytes": actual_bytes}),
            ),
            GatewayError::UnsupportedImageType(mime) => Self::new(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "unsupported_image_type",
                format!("Image type {} is not supported", mime),
            ),
            GatewayError::ProviderMisconfigured => {
                Self::service_unavailable("Upstream provider is not configured")
            }
            GatewayError::Provider(msg) => {
                tracing::error!("Upstream provider failure: {}", msg);
                Self::bad_gateway("Upstream provider call failed")
            }
            GatewayError::Internal(msg) => {
                tracing::error!("Internal gateway error: {}", msg);
                Self::internal_server_error("Internal server error")
            }
        }
    }
}

impl From<EntitlementError> for ApiError {
    fn from(err: EntitlementError) -> Self {
        GatewayError::from(err).into()
    }
}

impl From<SubscriptionError> for ApiError {
    fn from(err: SubscriptionError) -> Self {
        match err {
            SubscriptionError::VerificationFailed(reason) => {
                tracing::warn!("Receipt verification failed: {}", reason);
                Self::new(
                    StatusCode::UNAUTHORIZED,
                    "verification_failed",
                    "Receipt could not be verified",
                )
            }
            SubscriptionError::Ledger(msg) => {
                tracing::error!("Subscription ledger error: {}", msg);
                Self::internal_server_error("Internal server error")
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let AuthError::InvalidToken(reason) = err;
        tracing::debug!("Token rejected: {}", reason);
        Self::unauthorized("Invalid or expired token")
    }
}
