use api::{create_router_with_cors, ApiDoc, AppState, AuthState};
use chrono::{DateTime, Utc};
use services::auth::JwtIdentityVerifier;
use services::entitlement::ports::{EntitlementService, QuotaPolicy, QuotaPolicyConfig};
use services::entitlement::EntitlementServiceImpl;
use services::gateway::{GatewayServiceImpl, OpenAiProvider};
use services::subscription::{JwsReceiptVerifier, SubscriptionServiceImpl};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

const DEFAULT_PROVIDER_BASE_URL: &str = "https://api.openai.com/v1";

fn quota_policy(config: &config::QuotaConfig) -> QuotaPolicyConfig {
    QuotaPolicyConfig {
        cadence: match config.cadence {
            config::ResetCadence::Daily => QuotaPolicy::Daily,
            config::ResetCadence::Monthly => QuotaPolicy::Monthly,
            config::ResetCadence::Lifetime => QuotaPolicy::Lifetime,
        },
        chat_limit: config.chat_limit,
        transcription_limit: config.transcription_limit,
        vision_limit: config.vision_limit,
    }
}

fn until_next_utc_midnight(now: DateTime<Utc>) -> std::time::Duration {
    let next = (now.date_naive() + chrono::Days::new(1)).and_hms_opt(0, 0, 0);
    match next {
        Some(naive) => (DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc) - now)
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(60)),
        None => std::time::Duration::from_secs(24 * 60 * 60),
    }
}

/// Bulk counter reset at each UTC midnight. Belt and suspenders next to the
/// lazy per-request rollover; only started for daily-cadence deployments.
fn spawn_daily_maintenance(entitlement: Arc<dyn EntitlementService>) {
    tokio::spawn(async move {
        loop {
            let wait = until_next_utc_midnight(Utc::now());
            tracing::debug!(seconds = wait.as_secs(), "Next bulk counter reset scheduled");
            tokio::time::sleep(wait).await;
            match entitlement.reset_stale_counters(Utc::now()).await {
                Ok(reset) => {
                    tracing::info!(counters_reset = reset, "Daily bulk counter reset ran")
                }
                Err(e) => tracing::error!("Daily bulk counter reset failed: {}", e),
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
        eprintln!("Continuing with environment variables...");
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,api=debug,services=debug,database=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting gateway server...");

    let config = config::Config::from_env();
    tracing::info!("Server: {}:{}", config.server.host, config.server.port);

    tracing::info!("Connecting to database...");
    let db = database::Database::from_config(&config.database).await?;

    tracing::info!("Running migrations...");
    db.run_migrations().await?;

    let ledger = db.entitlement_ledger();
    let usage_log = db.usage_log_store();

    tracing::info!("Initializing services...");
    let policy = quota_policy(&config.quota);
    let entitlement_service = Arc::new(EntitlementServiceImpl::new(ledger.clone(), policy));

    let receipt_verifier = Arc::new(JwsReceiptVerifier::new(
        config.receipt.trusted_keys.clone(),
        config.receipt.issuer.clone(),
    ));
    let subscription_service = Arc::new(SubscriptionServiceImpl::new(receipt_verifier, ledger));

    let provider = Arc::new(OpenAiProvider::new(
        config.provider.api_key.clone(),
        config
            .provider
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_PROVIDER_BASE_URL.to_string()),
        config.provider.chat_model.clone(),
        config.provider.transcription_model.clone(),
        config.provider.vision_models.clone(),
    ));
    let gateway_service = Arc::new(GatewayServiceImpl::new(
        entitlement_service.clone(),
        provider,
        usage_log,
    ));

    if config.quota.cadence == config::ResetCadence::Daily {
        spawn_daily_maintenance(entitlement_service.clone());
    }

    let app_state = AppState {
        gateway_service,
        entitlement_service,
        subscription_service,
    };
    let auth_state = AuthState {
        identity_verifier: Arc::new(JwtIdentityVerifier::new(&config.auth.jwt_secret)),
    };

    let app = create_router_with_cors(app_state, auth_state, config.cors.clone())
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("Swagger UI available at http://{}/docs", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
