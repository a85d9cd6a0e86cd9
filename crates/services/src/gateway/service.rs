use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;

use crate::entitlement::ports::{
    ActionClass, EntitlementService, Reservation, UsageLogEntry, UsageLogStore,
};
use crate::types::UsageLogId;
use crate::UserId;

use super::ports::{
    AiProvider, ChatActionResponse, ChatRequest, GatewayError, GatewayService, QuotaTelemetry,
    TokenUsage, TranscriptionActionResponse, TranscriptionRequest, VisionActionResponse,
    VisionRequest, ALLOWED_IMAGE_TYPES, MAX_AUDIO_BYTES, MAX_IMAGE_BYTES,
};
use super::pricing::estimate_cost_nano_usd;

/// Per-action orchestrator: validate, reserve quota, call the provider,
/// log usage.
///
/// Quota is charged before the upstream call and is not refunded when the
/// call fails ("pays first, serves after"). A refused request is never
/// charged: validation and quota rejection both happen before any counter
/// mutation.
pub struct GatewayServiceImpl {
    entitlement: Arc<dyn EntitlementService>,
    provider: Arc<dyn AiProvider>,
    usage_log: Arc<dyn UsageLogStore>,
}

impl GatewayServiceImpl {
    pub fn new(
        entitlement: Arc<dyn EntitlementService>,
        provider: Arc<dyn AiProvider>,
        usage_log: Arc<dyn UsageLogStore>,
    ) -> Self {
        Self {
            entitlement,
            provider,
            usage_log,
        }
    }

    fn telemetry(reservation: &Reservation) -> QuotaTelemetry {
        QuotaTelemetry {
            tier: reservation.tier,
            limit: reservation.limit,
            remaining: reservation.remaining_after,
        }
    }

    /// Fire-and-forget usage-log append. A log failure never fails the
    /// action it describes.
    fn log_usage(
        &self,
        user_id: UserId,
        device_id: Option<&str>,
        class: ActionClass,
        reservation: &Reservation,
        model: Option<String>,
        usage: Option<TokenUsage>,
        payload_bytes: Option<i64>,
        latency_ms: i64,
        outcome: &str,
    ) {
        let entry = UsageLogEntry {
            id: UsageLogId::new(),
            user_id,
            device_id: device_id.map(str::to_string),
            action_class: class,
            model: model.clone(),
            tier: reservation.tier,
            input_tokens: usage.map(|u| u.input_tokens),
            output_tokens: usage.map(|u| u.output_tokens),
            payload_bytes,
            estimated_cost_nano_usd: usage.and_then(|u| {
                model
                    .as_deref()
                    .and_then(|m| estimate_cost_nano_usd(m, u.input_tokens, u.output_tokens))
            }),
            latency_ms,
            outcome: outcome.to_string(),
            created_at: Utc::now(),
        };

        let usage_log = self.usage_log.clone();
        tokio::spawn(async move {
            if let Err(e) = usage_log.append(entry).await {
                tracing::warn!("Failed to append usage log entry: {:#}", e);
            }
        });

        if let Some(usage) = usage {
            let entitlement = self.entitlement.clone();
            let tokens = usage.total();
            tokio::spawn(async move {
                if let Err(e) = entitlement.note_token_usage(user_id, tokens).await {
                    tracing::warn!("Failed to record token usage: {}", e);
                }
            });
        }
    }
}

#[async_trait]
impl GatewayService for GatewayServiceImpl {
    async fn chat(
        &self,
        user_id: UserId,
        device_id: Option<&str>,
        request: ChatRequest,
    ) -> Result<ChatActionResponse, GatewayError> {
        if request.messages.is_empty() {
            return Err(GatewayError::InvalidArgument(
                "messages must not be empty".to_string(),
            ));
        }

        let reservation = self
            .entitlement
            .try_consume(user_id, device_id, ActionClass::Chat, Utc::now())
            .await?;

        let started = Instant::now();
        let result = self.provider.chat(&request).await;
        let latency_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(outcome) => {
                self.log_usage(
                    user_id,
                    device_id,
                    ActionClass::Chat,
                    &reservation,
                    Some(outcome.model.clone()),
                    Some(outcome.usage),
                    None,
                    latency_ms,
                    "ok",
                );
                Ok(ChatActionResponse {
                    content: outcome.content,
                    stop_reason: outcome.stop_reason,
                    model: outcome.model,
                    usage: outcome.usage,
                    quota: Self::telemetry(&reservation),
                })
            }
            Err(e) => {
                self.log_usage(
                    user_id,
                    device_id,
                    ActionClass::Chat,
                    &reservation,
                    None,
                    None,
                    None,
                    latency_ms,
                    "provider_error",
                );
                Err(e.into())
            }
        }
    }

    async fn transcribe(
        &self,
        user_id: UserId,
        device_id: Option<&str>,
        request: TranscriptionRequest,
    ) -> Result<TranscriptionActionResponse, GatewayError> {
        if request.audio.is_empty() {
            return Err(GatewayError::InvalidArgument(
                "audio payload must not be empty".to_string(),
            ));
        }
        if request.audio.len() > MAX_AUDIO_BYTES {
            return Err(GatewayError::PayloadTooLarge {
                limit_bytes: MAX_AUDIO_BYTES,
                actual_bytes: request.audio.len(),
            });
        }

        let payload_bytes = request.audio.len() as i64;
        let reservation = self
            .entitlement
            .try_consume(user_id, device_id, ActionClass::Transcription, Utc::now())
            .await?;

        let started = Instant::now();
        let result = self.provider.transcribe(&request).await;
        let latency_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(outcome) => {
                self.log_usage(
                    user_id,
                    device_id,
                    ActionClass::Transcription,
                    &reservation,
                    Some(outcome.model.clone()),
                    None,
                    Some(payload_bytes),
                    latency_ms,
                    "ok",
                );
                Ok(TranscriptionActionResponse {
                    text: outcome.text,
                    model: outcome.model,
                    quota: Self::telemetry(&reservation),
                })
            }
            Err(e) => {
                self.log_usage(
                    user_id,
                    device_id,
                    ActionClass::Transcription,
                    &reservation,
                    None,
                    None,
                    Some(payload_bytes),
                    latency_ms,
                    "provider_error",
                );
                Err(e.into())
            }
        }
    }

    async fn analyze_image(
        &self,
        user_id: UserId,
        device_id: Option<&str>,
        request: VisionRequest,
    ) -> Result<VisionActionResponse, GatewayError> {
        if request.image.is_empty() {
            return Err(GatewayError::InvalidArgument(
                "image payload must not be empty".to_string(),
            ));
        }
        if !ALLOWED_IMAGE_TYPES.contains(&request.mime_type.as_str()) {
            return Err(GatewayError::UnsupportedImageType(request.mime_type));
        }
        if request.image.len() > MAX_IMAGE_BYTES {
            return Err(GatewayError::PayloadTooLarge {
                limit_bytes: MAX_IMAGE_BYTES,
                actual_bytes: request.image.len(),
            });
        }

        let payload_bytes = request.image.len() as i64;
        let reservation = self
            .entitlement
            .try_consume(user_id, device_id, ActionClass::Vision, Utc::now())
            .await?;

        let started = Instant::now();
        let result = self.provider.analyze_image(&request).await;
        let latency_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(outcome) => {
                self.log_usage(
                    user_id,
                    device_id,
                    ActionClass::Vision,
                    &reservation,
                    Some(outcome.model.clone()),
                    Some(outcome.usage),
                    Some(payload_bytes),
                    latency_ms,
                    "ok",
                );
                Ok(VisionActionResponse {
                    content: outcome.content,
                    model: outcome.model,
                    usage: outcome.usage,
                    quota: Self::telemetry(&reservation),
                })
            }
            Err(e) => {
                self.log_usage(
                    user_id,
                    device_id,
                    ActionClass::Vision,
                    &reservation,
                    None,
                    None,
                    Some(payload_bytes),
                    latency_ms,
                    "provider_error",
                );
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlement::ports::{
        EntitlementError, EntitlementSnapshot, SubscriptionTier,
    };
    use crate::gateway::ports::{
        ChatMessage, ChatOutcome, ProviderError, TranscriptionOutcome, VisionOutcome,
        VisionTemplate,
    };
    use bytes::Bytes;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts consumptions and either grants or rejects them all.
    struct ScriptedEntitlement {
        consumed: AtomicUsize,
        grant: bool,
    }

    impl ScriptedEntitlement {
        fn granting() -> Arc<Self> {
            Arc::new(Self {
                consumed: AtomicUsize::new(0),
                grant: true,
            })
        }

        fn exhausted() -> Arc<Self> {
            Arc::new(Self {
                consumed: AtomicUsize::new(0),
                grant: false,
            })
        }
    }

    #[async_trait]
    impl EntitlementService for ScriptedEntitlement {
        async fn try_consume(
            &self,
            _user_id: UserId,
            _device_id: Option<&str>,
            _class: ActionClass,
            _now: DateTime<Utc>,
        ) -> Result<Reservation, EntitlementError> {
            if self.grant {
                self.consumed.fetch_add(1, Ordering::SeqCst);
                Ok(Reservation {
                    tier: SubscriptionTier::Free,
                    limit: Some(10),
                    remaining_after: Some(9),
                })
            } else {
                Err(EntitlementError::QuotaExhausted {
                    limit: 10,
                    tier: SubscriptionTier::Free,
                })
            }
        }

        async fn usage_summary(
            &self,
            _user_id: UserId,
            _now: DateTime<Utc>,
        ) -> Result<EntitlementSnapshot, EntitlementError> {
            unimplemented!("not used by gateway tests")
        }

        async fn note_token_usage(
            &self,
            _user_id: UserId,
            _tokens: i64,
        ) -> Result<(), EntitlementError> {
            Ok(())
        }

        async fn reset_stale_counters(
            &self,
            _now: DateTime<Utc>,
        ) -> Result<u64, EntitlementError> {
            Ok(0)
        }
    }

    /// Counts calls and either succeeds or fails every one of them.
    struct ScriptedProvider {
        calls: AtomicUsize,
        fail: bool,
    }

    impl ScriptedProvider {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: true,
            })
        }

        fn check(&self) -> Result<(), ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ProviderError::Upstream {
                    status: Some(500),
                    message: "simulated failure".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl AiProvider for ScriptedProvider {
        async fn chat(&self, _request: &ChatRequest) -> Result<ChatOutcome, ProviderError> {
            self.check()?;
            Ok(ChatOutcome {
                content: "hello".to_string(),
                stop_reason: Some("stop".to_string()),
                model: "gpt-4o-mini".to_string(),
                usage: TokenUsage {
                    input_tokens: 12,
                    output_tokens: 7,
                },
            })
        }

        async fn transcribe(
            &self,
            _request: &TranscriptionRequest,
        ) -> Result<TranscriptionOutcome, ProviderError> {
            self.check()?;
            Ok(TranscriptionOutcome {
                text: "transcript".to_string(),
                model: "whisper-1".to_string(),
            })
        }

        async fn analyze_image(
            &self,
            _request: &VisionRequest,
        ) -> Result<VisionOutcome, ProviderError> {
            self.check()?;
            Ok(VisionOutcome {
                content: "analysis".to_string(),
                model: "gpt-4o".to_string(),
                usage: TokenUsage::default(),
            })
        }
    }

    struct NoopLog;

    #[async_trait]
    impl UsageLogStore for NoopLog {
        async fn append(&self, _entry: UsageLogEntry) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn gateway(
        entitlement: Arc<ScriptedEntitlement>,
        provider: Arc<ScriptedProvider>,
    ) -> GatewayServiceImpl {
        GatewayServiceImpl::new(entitlement, provider, Arc::new(NoopLog))
    }

    fn chat_request() -> ChatRequest {
        ChatRequest {
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
            system_prompt: None,
            tools: None,
        }
    }

    fn vision_request(image_len: usize, mime: &str) -> VisionRequest {
        VisionRequest {
            image: Bytes::from(vec![0u8; image_len]),
            mime_type: mime.to_string(),
            template: VisionTemplate::Note,
            custom_prompt: None,
        }
    }

    #[tokio::test]
    async fn chat_returns_payload_with_quota_telemetry() {
        let entitlement = ScriptedEntitlement::granting();
        let provider = ScriptedProvider::ok();
        let response = gateway(entitlement, provider)
            .chat(UserId::new(), None, chat_request())
            .await
            .unwrap();

        assert_eq!(response.content, "hello");
        assert_eq!(response.quota.remaining, Some(9));
        assert_eq!(response.usage.total(), 19);
    }

    #[tokio::test]
    async fn exhausted_quota_never_reaches_the_provider() {
        let entitlement = ScriptedEntitlement::exhausted();
        let provider = ScriptedProvider::ok();
        let err = gateway(entitlement, provider.clone())
            .chat(UserId::new(), None, chat_request())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::QuotaExhausted { limit: 10, .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn charged_quota_is_kept_when_provider_fails() {
        // Pays first, serves after: a failed upstream call still consumed a
        // unit. Changing this to reserve/release semantics must flip this
        // test deliberately.
        let entitlement = ScriptedEntitlement::granting();
        let provider = ScriptedProvider::failing();
        let err = gateway(entitlement.clone(), provider)
            .chat(UserId::new(), None, chat_request())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Provider(_)));
        assert_eq!(entitlement.consumed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_message_list_fails_before_any_charge() {
        let entitlement = ScriptedEntitlement::granting();
        let provider = ScriptedProvider::ok();
        let err = gateway(entitlement.clone(), provider)
            .chat(
                UserId::new(),
                None,
                ChatRequest {
                    messages: vec![],
                    system_prompt: None,
                    tools: None,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::InvalidArgument(_)));
        assert_eq!(entitlement.consumed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversized_audio_fails_before_any_charge() {
        let entitlement = ScriptedEntitlement::granting();
        let provider = ScriptedProvider::ok();
        let err = gateway(entitlement.clone(), provider.clone())
            .transcribe(
                UserId::new(),
                None,
                TranscriptionRequest {
                    audio: Bytes::from(vec![0u8; MAX_AUDIO_BYTES + 1]),
                    filename: "memo.m4a".to_string(),
                    language: None,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::PayloadTooLarge { .. }));
        assert_eq!(entitlement.consumed.load(Ordering::SeqCst), 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disallowed_image_type_fails_before_any_charge() {
        let entitlement = ScriptedEntitlement::granting();
        let provider = ScriptedProvider::ok();
        let err = gateway(entitlement.clone(), provider)
            .analyze_image(UserId::new(), None, vision_request(128, "image/tiff"))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::UnsupportedImageType(_)));
        assert_eq!(entitlement.consumed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversized_image_fails_before_any_charge() {
        let entitlement = ScriptedEntitlement::granting();
        let provider = ScriptedProvider::ok();
        let err = gateway(entitlement.clone(), provider)
            .analyze_image(
                UserId::new(),
                None,
                vision_request(MAX_IMAGE_BYTES + 1, "image/png"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::PayloadTooLarge { .. }));
        assert_eq!(entitlement.consumed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn allowed_image_passes_validation() {
        let entitlement = ScriptedEntitlement::granting();
        let provider = ScriptedProvider::ok();
        let response = gateway(entitlement, provider)
            .analyze_image(UserId::new(), None, vision_request(1024, "image/jpeg"))
            .await
            .unwrap();
        assert_eq!(response.content, "analysis");
    }
}
