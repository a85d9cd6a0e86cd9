mod common;

use std::collections::HashMap;

use axum::http::StatusCode;
use serde_json::{json, Value};
use services::entitlement::ports::SubscriptionTier;

use common::{
    chat_body, create_harness_with, receipt_claims, HarnessOptions, TestHarness, TEST_TOKEN,
};

async fn harness_with_receipts() -> TestHarness {
    let mut receipts = HashMap::new();
    receipts.insert("live-receipt".to_string(), receipt_claims(30));
    receipts.insert("lapsed-receipt".to_string(), receipt_claims(-5));
    create_harness_with(HarnessOptions {
        receipts,
        ..HarnessOptions::default()
    })
    .await
}

#[tokio::test]
async fn live_receipt_grants_pro() {
    let harness = harness_with_receipts().await;

    let response = harness
        .server
        .post("/v1/receipts/verify")
        .authorization_bearer(TEST_TOKEN)
        .json(&json!({ "receipt": "live-receipt" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["tier"], "pro");
    assert_eq!(body["active"], true);
    assert_eq!(body["product_id"], "pro.monthly");

    let record = harness.ledger.record(harness.user_id).unwrap();
    assert_eq!(record.tier, SubscriptionTier::Pro);
    assert!(record.subscription_expires_at.is_some());
}

#[tokio::test]
async fn pro_tier_is_not_limited_by_the_free_quota() {
    let harness = harness_with_receipts().await;

    harness
        .server
        .post("/v1/receipts/verify")
        .authorization_bearer(TEST_TOKEN)
        .json(&json!({ "receipt": "live-receipt" }))
        .await
        .assert_status(StatusCode::OK);

    // Well past the free chat limit of 3.
    for _ in 0..6 {
        let response = harness
            .server
            .post("/v1/chat")
            .authorization_bearer(TEST_TOKEN)
            .json(&chat_body())
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["quota"]["tier"], "pro");
        assert!(body["quota"]["limit"].is_null());
        assert!(body["quota"]["remaining"].is_null());
    }
}

#[tokio::test]
async fn lapsed_receipt_demotes_back_to_free() {
    let harness = harness_with_receipts().await;

    harness
        .server
        .post("/v1/receipts/verify")
        .authorization_bearer(TEST_TOKEN)
        .json(&json!({ "receipt": "live-receipt" }))
        .await
        .assert_status(StatusCode::OK);

    let response = harness
        .server
        .post("/v1/receipts/verify")
        .authorization_bearer(TEST_TOKEN)
        .json(&json!({ "receipt": "lapsed-receipt" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["tier"], "free");
    assert_eq!(body["active"], false);

    let record = harness.ledger.record(harness.user_id).unwrap();
    assert_eq!(record.tier, SubscriptionTier::Free);
}

#[tokio::test]
async fn unverifiable_receipt_is_rejected_and_changes_nothing() {
    let harness = harness_with_receipts().await;

    let response = harness
        .server
        .post("/v1/receipts/verify")
        .authorization_bearer(TEST_TOKEN)
        .json(&json!({ "receipt": "forged-receipt" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json();
    assert_eq!(body["code"], "verification_failed");
    // The rejection reason stays in the logs.
    assert!(!body["message"].as_str().unwrap().contains("unknown receipt"));

    assert!(harness.ledger.record(harness.user_id).is_none());
}

#[tokio::test]
async fn receipt_before_first_action_still_creates_usable_state() {
    let harness = harness_with_receipts().await;

    harness
        .server
        .post("/v1/receipts/verify")
        .authorization_bearer(TEST_TOKEN)
        .json(&json!({ "receipt": "lapsed-receipt" }))
        .await
        .assert_status(StatusCode::OK);

    // Free tier with healed counters works normally afterwards.
    let response = harness
        .server
        .post("/v1/chat")
        .authorization_bearer(TEST_TOKEN)
        .json(&chat_body())
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["quota"]["tier"], "free");
    assert_eq!(body["quota"]["remaining"], 2);
}
