#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use api::{create_router, AppState, AuthState};
use async_trait::async_trait;
use axum_test::TestServer;
use chrono::Utc;
use database::memory::MemoryLedger;
use services::auth::test_helpers::StaticIdentityVerifier;
use services::entitlement::ports::{QuotaPolicy, QuotaPolicyConfig};
use services::entitlement::EntitlementServiceImpl;
use services::gateway::ports::{
    AiProvider, ChatOutcome, ChatRequest, ProviderError, TokenUsage, TranscriptionOutcome,
    TranscriptionRequest, VisionOutcome, VisionRequest,
};
use services::gateway::GatewayServiceImpl;
use services::subscription::ports::{ReceiptClaims, ReceiptVerifier, SubscriptionError};
use services::subscription::SubscriptionServiceImpl;
use services::UserId;

pub const TEST_TOKEN: &str = "test-token";

/// Looks up receipt tokens in a fixed map; everything else fails
/// verification.
pub struct ScriptedReceiptVerifier {
    receipts: HashMap<String, ReceiptClaims>,
}

impl ReceiptVerifier for ScriptedReceiptVerifier {
    fn verify(&self, signed_receipt: &str) -> Result<ReceiptClaims, SubscriptionError> {
        self.receipts
            .get(signed_receipt)
            .cloned()
            .ok_or_else(|| SubscriptionError::VerificationFailed("unknown receipt".to_string()))
    }
}

/// Returns canned responses, optionally failing every call.
pub struct MockProvider {
    pub calls: AtomicUsize,
    fail: bool,
}

impl MockProvider {
    fn check(&self) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(ProviderError::Upstream {
                status: Some(500),
                message: "simulated upstream failure".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AiProvider for MockProvider {
    async fn chat(&self, _request: &ChatRequest) -> Result<ChatOutcome, ProviderError> {
        self.check()?;
        Ok(ChatOutcome {
            content: "mock chat response".to_string(),
            stop_reason: Some("stop".to_string()),
            model: "gpt-4o-mini".to_string(),
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
        })
    }

    async fn transcribe(
        &self,
        _request: &TranscriptionRequest,
    ) -> Result<TranscriptionOutcome, ProviderError> {
        self.check()?;
        Ok(TranscriptionOutcome {
            text: "mock transcript".to_string(),
            model: "whisper-1".to_string(),
        })
    }

    async fn analyze_image(
        &self,
        _request: &VisionRequest,
    ) -> Result<VisionOutcome, ProviderError> {
        self.check()?;
        Ok(VisionOutcome {
            content: "mock analysis".to_string(),
            model: "gpt-4o".to_string(),
            usage: TokenUsage {
                input_tokens: 200,
                output_tokens: 50,
            },
        })
    }
}

pub struct HarnessOptions {
    pub policy: QuotaPolicyConfig,
    pub provider_fails: bool,
    pub receipts: HashMap<String, ReceiptClaims>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            policy: QuotaPolicyConfig {
                cadence: QuotaPolicy::Monthly,
                chat_limit: 3,
                transcription_limit: 2,
                vision_limit: 2,
            },
            provider_fails: false,
            receipts: HashMap::new(),
        }
    }
}

pub struct TestHarness {
    pub server: TestServer,
    pub ledger: Arc<MemoryLedger>,
    pub provider: Arc<MockProvider>,
    pub user_id: UserId,
}

pub async fn create_harness() -> TestHarness {
    create_harness_with(HarnessOptions::default()).await
}

pub async fn create_harness_with(options: HarnessOptions) -> TestHarness {
    let ledger = Arc::new(MemoryLedger::new());
    let provider = Arc::new(MockProvider {
        calls: AtomicUsize::new(0),
        fail: options.provider_fails,
    });
    let user_id = UserId::new();

    let entitlement_service = Arc::new(EntitlementServiceImpl::new(
        ledger.clone(),
        options.policy,
    ));
    let subscription_service = Arc::new(SubscriptionServiceImpl::new(
        Arc::new(ScriptedReceiptVerifier {
            receipts: options.receipts,
        }),
        ledger.clone(),
    ));
    let gateway_service = Arc::new(GatewayServiceImpl::new(
        entitlement_service.clone(),
        provider.clone(),
        ledger.clone(),
    ));

    let app_state = AppState {
        gateway_service,
        entitlement_service,
        subscription_service,
    };
    let auth_state = AuthState {
        identity_verifier: Arc::new(
            StaticIdentityVerifier::new().with_token(TEST_TOKEN, user_id),
        ),
    };

    let server =
        TestServer::new(create_router(app_state, auth_state)).expect("failed to build test server");

    TestHarness {
        server,
        ledger,
        provider,
        user_id,
    }
}

/// Receipt claims for a subscription expiring `days_from_now` days from now
/// (negative for an already-lapsed receipt).
pub fn receipt_claims(days_from_now: i64) -> ReceiptClaims {
    let now = Utc::now();
    ReceiptClaims {
        product_id: "pro.monthly".to_string(),
        original_transaction_id: "1000000321".to_string(),
        expires_date: Some((now + chrono::Duration::days(days_from_now)).timestamp_millis()),
        purchase_date: now.timestamp_millis(),
        environment: Some("Production".to_string()),
    }
}

pub fn chat_body() -> serde_json::Value {
    serde_json::json!({
        "messages": [{"role": "user", "content": "hello"}]
    })
}
