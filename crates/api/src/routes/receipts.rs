use axum::{extract::State, routing::post, Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use services::entitlement::ports::SubscriptionTier;

use crate::{error::ApiError, middleware::AuthenticatedCaller, state::AppState};

#[derive(Debug, Deserialize, ToSchema)]
pub struct VerifyReceiptRequest {
    /// Compact signed receipt token (JWS).
    pub receipt: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VerifyReceiptResponse {
    /// Tier now in effect after reconciliation.
    pub tier: SubscriptionTier,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub product_id: String,
}

/// Verify a store receipt and reconcile the caller's subscription tier
///
/// Authoritative in both directions: a live receipt grants pro, an expired
/// one demotes back to free.
#[utoipa::path(
    post,
    path = "/v1/receipts/verify",
    tag = "Receipts",
    request_body = VerifyReceiptRequest,
    responses(
        (status = 200, description = "Reconciled subscription state", body = VerifyReceiptResponse),
        (status = 401, description = "Verification failed", body = crate::error::ApiErrorResponse)
    ),
    security(("bearer_token" = []))
)]
pub async fn verify_receipt(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedCaller>,
    Json(request): Json<VerifyReceiptRequest>,
) -> Result<Json<VerifyReceiptResponse>, ApiError> {
    let verified = state
        .subscription_service
        .reconcile_receipt(caller.user_id, &request.receipt, Utc::now())
        .await?;

    Ok(Json(VerifyReceiptResponse {
        active: verified.tier == SubscriptionTier::Pro,
        tier: verified.tier,
        expires_at: verified.expires_at,
        product_id: verified.product_id,
    }))
}

pub fn create_receipts_router() -> Router<AppState> {
    Router::new().route("/v1/receipts/verify", post(verify_receipt))
}
