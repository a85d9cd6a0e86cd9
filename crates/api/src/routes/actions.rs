//! The three gated action endpoints: chat, transcription and vision.

use axum::{extract::State, routing::post, Extension, Json, Router};
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use utoipa::ToSchema;

use services::gateway::ports::{
    ChatActionResponse, ChatRequest, TranscriptionActionResponse, TranscriptionRequest,
    VisionActionResponse, VisionRequest, VisionTemplate,
};

use crate::{error::ApiError, middleware::AuthenticatedCaller, state::AppState};

/// Audio arrives base64-encoded in JSON; the gateway enforces the decoded
/// size cap.
#[derive(Debug, Deserialize, ToSchema)]
pub struct TranscriptionApiRequest {
    /// Base64-encoded audio payload.
    pub audio: String,
    /// Original filename, used for upstream format detection.
    #[serde(default)]
    pub filename: Option<String>,
    /// Optional ISO 639-1 language hint.
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct VisionApiRequest {
    /// Base64-encoded image payload.
    pub image: String,
    /// Declared image mime type, checked against the allow-list.
    pub mime_type: String,
    /// Prompt template selector.
    pub template: VisionTemplate,
    /// Overrides the template's prompt when present.
    #[serde(default)]
    pub custom_prompt: Option<String>,
}

fn decode_base64(field: &str, payload: &str) -> Result<Bytes, ApiError> {
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map(Bytes::from)
        .map_err(|_| ApiError::bad_request(format!("{} is not valid base64", field)))
}

/// Chat completion, gated by the caller's chat quota
#[utoipa::path(
    post,
    path = "/v1/chat",
    tag = "Actions",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Completion", body = ChatActionResponse),
        (status = 401, description = "Unauthenticated", body = crate::error::ApiErrorResponse),
        (status = 429, description = "Quota exhausted", body = crate::error::ApiErrorResponse),
        (status = 502, description = "Upstream failure", body = crate::error::ApiErrorResponse)
    ),
    security(("bearer_token" = []))
)]
pub async fn chat(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedCaller>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatActionResponse>, ApiError> {
    let response = state
        .gateway_service
        .chat(caller.user_id, caller.device_id.as_deref(), request)
        .await?;
    Ok(Json(response))
}

/// Audio transcription, gated by the caller's transcription quota
#[utoipa::path(
    post,
    path = "/v1/transcriptions",
    tag = "Actions",
    request_body = TranscriptionApiRequest,
    responses(
        (status = 200, description = "Transcript", body = TranscriptionActionResponse),
        (status = 413, description = "Audio too large", body = crate::error::ApiErrorResponse),
        (status = 429, description = "Quota exhausted", body = crate::error::ApiErrorResponse)
    ),
    security(("bearer_token" = []))
)]
pub async fn transcribe(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedCaller>,
    Json(request): Json<TranscriptionApiRequest>,
) -> Result<Json<TranscriptionActionResponse>, ApiError> {
    let audio = decode_base64("audio", &request.audio)?;
    let response = state
        .gateway_service
        .transcribe(
            caller.user_id,
            caller.device_id.as_deref(),
            TranscriptionRequest {
                audio,
                filename: request.filename.unwrap_or_else(|| "audio.m4a".to_string()),
                language: request.language,
            },
        )
        .await?;
    Ok(Json(response))
}

/// Image analysis, gated by the caller's vision quota
#[utoipa::path(
    post,
    path = "/v1/vision",
    tag = "Actions",
    request_body = VisionApiRequest,
    responses(
        (status = 200, description = "Analysis", body = VisionActionResponse),
        (status = 413, description = "Image too large", body = crate::error::ApiErrorResponse),
        (status = 415, description = "Unsupported image type", body = crate::error::ApiErrorResponse),
        (status = 429, description = "Quota exhausted", body = crate::error::ApiErrorResponse)
    ),
    security(("bearer_token" = []))
)]
pub async fn analyze_image(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedCaller>,
    Json(request): Json<VisionApiRequest>,
) -> Result<Json<VisionActionResponse>, ApiError> {
    let image = decode_base64("image", &request.image)?;
    let response = state
        .gateway_service
        .analyze_image(
            caller.user_id,
            caller.device_id.as_deref(),
            VisionRequest {
                image,
                mime_type: request.mime_type,
                template: request.template,
                custom_prompt: request.custom_prompt,
            },
        )
        .await?;
    Ok(Json(response))
}

pub fn create_actions_router() -> Router<AppState> {
    Router::new()
        .route("/v1/chat", post(chat))
        .route("/v1/transcriptions", post(transcribe))
        .route("/v1/vision", post(analyze_image))
}
