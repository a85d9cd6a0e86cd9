use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::entitlement::ports::{EntitlementError, SubscriptionTier};

/// Decoded audio payloads above this size are rejected before any quota is
/// charged.
pub const MAX_AUDIO_BYTES: usize = 25 * 1024 * 1024;

/// Decoded image payloads above this size are rejected before any quota is
/// charged.
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

/// Image mime types the vision action accepts.
pub const ALLOWED_IMAGE_TYPES: [&str; 4] =
    ["image/jpeg", "image/png", "image/webp", "image/gif"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct ChatMessage {
    /// "user", "assistant" or "system".
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Provider-shaped tool definitions, passed through opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl TokenUsage {
    pub fn total(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }
}

/// Provider response for a chat completion.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    pub stop_reason: Option<String>,
    pub model: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub audio: Bytes,
    pub filename: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TranscriptionOutcome {
    pub text: String,
    pub model: String,
}

/// Prompt template selecting how an image is analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub enum VisionTemplate {
    Recipe,
    Receipt,
    Note,
    BusinessCard,
    Whiteboard,
}

impl VisionTemplate {
    pub fn prompt(&self) -> &'static str {
        match self {
            VisionTemplate::Recipe => {
                "Extract the recipe from this image. Return the title, ingredient list \
                 with quantities, and numbered preparation steps."
            }
            VisionTemplate::Receipt => {
                "Extract the purchase details from this receipt image. Return the \
                 merchant, date, line items with prices, and the total amount."
            }
            VisionTemplate::Note => {
                "Transcribe the handwritten or printed note in this image into clean \
                 text, preserving its structure."
            }
            VisionTemplate::BusinessCard => {
                "Extract the contact details from this business card image. Return the \
                 name, title, company, phone numbers, email and address."
            }
            VisionTemplate::Whiteboard => {
                "Transcribe the contents of this whiteboard image, reconstructing \
                 lists, diagrams and annotations as structured text."
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub image: Bytes,
    pub mime_type: String,
    pub template: VisionTemplate,
    /// Overrides the template's prompt when present.
    pub custom_prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VisionOutcome {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
}

/// Upstream provider failure, as seen at the capability seam.
#[derive(Debug)]
pub enum ProviderError {
    /// The deployment has no usable upstream credential. Operational, never
    /// the caller's fault.
    Misconfigured(String),
    /// The upstream call failed. The message carries enough to diagnose but
    /// no credentials and no raw upstream body.
    Upstream { status: Option<u16>, message: String },
    /// Every model in the configured fallback list failed.
    ExhaustedFallbacks { attempts: usize },
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Misconfigured(msg) => write!(f, "provider misconfigured: {}", msg),
            Self::Upstream { status, message } => match status {
                Some(status) => write!(f, "upstream error (status {}): {}", status, message),
                None => write!(f, "upstream error: {}", message),
            },
            Self::ExhaustedFallbacks { attempts } => {
                write!(f, "all {} fallback models failed", attempts)
            }
        }
    }
}

impl std::error::Error for ProviderError {}

/// The opaque upstream AI capability: send a structured request, get a
/// structured response or a provider error.
#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatOutcome, ProviderError>;

    async fn transcribe(
        &self,
        request: &TranscriptionRequest,
    ) -> Result<TranscriptionOutcome, ProviderError>;

    async fn analyze_image(&self, request: &VisionRequest)
        -> Result<VisionOutcome, ProviderError>;
}

#[derive(Debug)]
pub enum GatewayError {
    InvalidArgument(String),
    QuotaExhausted {
        limit: u32,
        tier: SubscriptionTier,
    },
    PayloadTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
    },
    UnsupportedImageType(String),
    ProviderMisconfigured,
    Provider(String),
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Self::QuotaExhausted { limit, tier } => {
                write!(f, "quota exhausted: limit {} on {} tier", limit, tier)
            }
            Self::PayloadTooLarge {
                limit_bytes,
                actual_bytes,
            } => write!(
                f,
                "payload too large: {} bytes exceeds the {} byte limit",
                actual_bytes, limit_bytes
            ),
            Self::UnsupportedImageType(mime) => {
                write!(f, "unsupported image type: {}", mime)
            }
            Self::ProviderMisconfigured => write!(f, "upstream provider is not configured"),
            Self::Provider(msg) => write!(f, "provider error: {}", msg),
            Self::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<EntitlementError> for GatewayError {
    fn from(err: EntitlementError) -> Self {
        match err {
            EntitlementError::QuotaExhausted { limit, tier } => {
                Self::QuotaExhausted { limit, tier }
            }
            EntitlementError::Contention => {
                Self::Internal("entitlement contention".to_string())
            }
            EntitlementError::Ledger(msg) => Self::Internal(msg),
        }
    }
}

impl From<ProviderError> for GatewayError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Misconfigured(msg) => {
                tracing::error!("Provider misconfiguration: {}", msg);
                Self::ProviderMisconfigured
            }
            other => Self::Provider(other.to_string()),
        }
    }
}

/// Remaining-allowance telemetry attached to every successful action
/// response.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct QuotaTelemetry {
    pub tier: SubscriptionTier,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct ChatActionResponse {
    pub content: String,
    pub stop_reason: Option<String>,
    pub model: String,
    pub usage: TokenUsage,
    pub quota: QuotaTelemetry,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct TranscriptionActionResponse {
    pub text: String,
    pub model: String,
    pub quota: QuotaTelemetry,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct VisionActionResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub quota: QuotaTelemetry,
}

/// The per-action orchestrator composing quota reservation, the upstream
/// call and best-effort usage logging.
#[async_trait]
pub trait GatewayService: Send + Sync {
    async fn chat(
        &self,
        user_id: crate::UserId,
        device_id: Option<&str>,
        request: ChatRequest,
    ) -> Result<ChatActionResponse, GatewayError>;

    async fn transcribe(
        &self,
        user_id: crate::UserId,
        device_id: Option<&str>,
        request: TranscriptionRequest,
    ) -> Result<TranscriptionActionResponse, GatewayError>;

    async fn analyze_image(
        &self,
        user_id: crate::UserId,
        device_id: Option<&str>,
        request: VisionRequest,
    ) -> Result<VisionActionResponse, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_template_has_a_distinct_prompt() {
        let templates = [
            VisionTemplate::Recipe,
            VisionTemplate::Receipt,
            VisionTemplate::Note,
            VisionTemplate::BusinessCard,
            VisionTemplate::Whiteboard,
        ];
        for (i, a) in templates.iter().enumerate() {
            for b in &templates[i + 1..] {
                assert_ne!(a.prompt(), b.prompt());
            }
        }
    }

    #[test]
    fn template_selector_decodes_from_snake_case() {
        let template: VisionTemplate = serde_json::from_str(r#""business_card""#).unwrap();
        assert_eq!(template, VisionTemplate::BusinessCard);
    }
}
