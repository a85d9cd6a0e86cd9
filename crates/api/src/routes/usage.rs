use axum::{extract::State, routing::get, Extension, Json, Router};
use chrono::Utc;

use services::entitlement::ports::EntitlementSnapshot;

use crate::{error::ApiError, middleware::AuthenticatedCaller, state::AppState};

/// Current entitlement snapshot for the caller
///
/// Read-only and eventually consistent: counters from a previous accounting
/// period are presented as already reset even before the next action
/// request performs the actual rollover.
#[utoipa::path(
    get,
    path = "/v1/usage",
    tag = "Usage",
    responses(
        (status = 200, description = "Entitlement snapshot", body = EntitlementSnapshot),
        (status = 401, description = "Unauthenticated", body = crate::error::ApiErrorResponse)
    ),
    security(("bearer_token" = []))
)]
pub async fn get_usage(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedCaller>,
) -> Result<Json<EntitlementSnapshot>, ApiError> {
    let snapshot = state
        .entitlement_service
        .usage_summary(caller.user_id, Utc::now())
        .await?;
    Ok(Json(snapshot))
}

pub fn create_usage_router() -> Router<AppState> {
    Router::new().route("/v1/usage", get(get_usage))
}
