use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::OpenApi;

/// OpenAPI documentation configuration
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Receipt-Gated AI Gateway",
        description = "Quota-gated access to chat, transcription and vision AI capabilities \
                       with in-app-purchase receipt verification.",
        version = "1.0.0",
        license(name = "MIT")
    ),
    paths(
        crate::routes::actions::chat,
        crate::routes::actions::transcribe,
        crate::routes::actions::analyze_image,
        crate::routes::usage::get_usage,
        crate::routes::receipts::verify_receipt,
    ),
    components(schemas(
        crate::error::ApiErrorResponse,
        crate::routes::HealthResponse,
        crate::routes::actions::TranscriptionApiRequest,
        crate::routes::actions::VisionApiRequest,
        crate::routes::receipts::VerifyReceiptRequest,
        crate::routes::receipts::VerifyReceiptResponse,
        services::entitlement::ports::ActionClass,
        services::entitlement::ports::SubscriptionTier,
        services::entitlement::ports::CounterSnapshot,
        services::entitlement::ports::EntitlementSnapshot,
        services::gateway::ports::ChatMessage,
        services::gateway::ports::ChatRequest,
        services::gateway::ports::ChatActionResponse,
        services::gateway::ports::TranscriptionActionResponse,
        services::gateway::ports::VisionActionResponse,
        services::gateway::ports::VisionTemplate,
        services::gateway::ports::TokenUsage,
        services::gateway::ports::QuotaTelemetry,
        services::subscription::ports::VerifiedSubscription,
    )),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Service health"),
        (name = "Actions", description = "Quota-gated AI actions"),
        (name = "Usage", description = "Entitlement and usage reporting"),
        (name = "Receipts", description = "Subscription receipt verification")
    )
)]
pub struct ApiDoc;

/// Security scheme addon for Bearer token authentication
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_token",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}
