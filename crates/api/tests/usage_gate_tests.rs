mod common;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use serde_json::Value;
use services::entitlement::ports::ActionClass;

use common::{chat_body, create_harness, create_harness_with, HarnessOptions, TEST_TOKEN};

#[tokio::test]
async fn free_quota_runs_down_and_then_rejects() {
    let harness = create_harness().await;

    for expected_remaining in [2, 1, 0] {
        let response = harness
            .server
            .post("/v1/chat")
            .authorization_bearer(TEST_TOKEN)
            .json(&chat_body())
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["quota"]["tier"], "free");
        assert_eq!(body["quota"]["limit"], 3);
        assert_eq!(body["quota"]["remaining"], expected_remaining);
    }

    let response = harness
        .server
        .post("/v1/chat")
        .authorization_bearer(TEST_TOKEN)
        .json(&chat_body())
        .await;
    assert_eq!(response.status_code(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = response.json();
    assert_eq!(body["code"], "quota_exhausted");
    assert_eq!(body["details"]["limit"], 3);
    assert_eq!(body["details"]["tier"], "free");
}

#[tokio::test]
async fn exhausted_quota_never_reaches_the_provider() {
    let harness = create_harness().await;

    for _ in 0..3 {
        harness
            .server
            .post("/v1/chat")
            .authorization_bearer(TEST_TOKEN)
            .json(&chat_body())
            .await
            .assert_status(StatusCode::OK);
    }
    let calls_before = harness
        .provider
        .calls
        .load(std::sync::atomic::Ordering::SeqCst);

    harness
        .server
        .post("/v1/chat")
        .authorization_bearer(TEST_TOKEN)
        .json(&chat_body())
        .await
        .assert_status(StatusCode::TOO_MANY_REQUESTS);

    let calls_after = harness
        .provider
        .calls
        .load(std::sync::atomic::Ordering::SeqCst);
    assert_eq!(calls_before, calls_after);
}

#[tokio::test]
async fn quota_is_kept_when_the_provider_fails() {
    let harness = create_harness_with(HarnessOptions {
        provider_fails: true,
        ..HarnessOptions::default()
    })
    .await;

    let response = harness
        .server
        .post("/v1/chat")
        .authorization_bearer(TEST_TOKEN)
        .json(&chat_body())
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_GATEWAY);
    let body: Value = response.json();
    assert_eq!(body["code"], "bad_gateway");
    // No raw upstream detail crosses the API boundary.
    assert!(!body["message"]
        .as_str()
        .unwrap()
        .contains("simulated upstream failure"));

    let record = harness
        .ledger
        .record(harness.user_id)
        .expect("record should exist after a charged attempt");
    assert_eq!(record.counters[&ActionClass::Chat].used, 1);
}

#[tokio::test]
async fn action_classes_have_independent_quotas() {
    let harness = create_harness().await;

    for _ in 0..3 {
        harness
            .server
            .post("/v1/chat")
            .authorization_bearer(TEST_TOKEN)
            .json(&chat_body())
            .await
            .assert_status(StatusCode::OK);
    }
    harness
        .server
        .post("/v1/chat")
        .authorization_bearer(TEST_TOKEN)
        .json(&chat_body())
        .await
        .assert_status(StatusCode::TOO_MANY_REQUESTS);

    // Transcription still has allowance of its own.
    let audio = base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        b"tiny audio payload",
    );
    let response = harness
        .server
        .post("/v1/transcriptions")
        .authorization_bearer(TEST_TOKEN)
        .json(&serde_json::json!({ "audio": audio }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn usage_summary_reflects_consumption_without_charging() {
    let harness = create_harness().await;

    harness
        .server
        .post("/v1/chat")
        .authorization_bearer(TEST_TOKEN)
        .json(&chat_body())
        .await
        .assert_status(StatusCode::OK);

    for _ in 0..2 {
        let response = harness
            .server
            .get("/v1/usage")
            .authorization_bearer(TEST_TOKEN)
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["tier"], "free");
        assert_eq!(body["chat"]["used"], 1);
        assert_eq!(body["chat"]["limit"], 3);
        assert_eq!(body["chat"]["remaining"], 2);
        assert_eq!(body["transcription"]["used"], 0);
        assert_eq!(body["vision"]["used"], 0);
    }
}

#[tokio::test]
async fn usage_summary_for_a_fresh_user_reports_full_allowance() {
    let harness = create_harness().await;

    let response = harness
        .server
        .get("/v1/usage")
        .authorization_bearer(TEST_TOKEN)
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["tier"], "free");
    assert_eq!(body["chat"]["used"], 0);
    assert_eq!(body["chat"]["remaining"], 3);
    assert_eq!(body["lifetime_request_count"], 0);

    // Reading usage never materializes a record.
    assert!(harness.ledger.record(harness.user_id).is_none());
}

#[tokio::test]
async fn device_header_rebinds_without_blocking() {
    let harness = create_harness().await;

    for device in ["device-a", "device-b"] {
        let response = harness
            .server
            .post("/v1/chat")
            .authorization_bearer(TEST_TOKEN)
            .add_header(
                HeaderName::from_static("x-device-id"),
                HeaderValue::from_str(device).unwrap(),
            )
            .json(&chat_body())
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
    }

    let record = harness.ledger.record(harness.user_id).unwrap();
    assert_eq!(record.device_id.as_deref(), Some("device-b"));
}
