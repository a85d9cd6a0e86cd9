//! Embedded schema, applied idempotently at startup.

use crate::pool::DbPool;
use anyhow::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entitlements (
    user_id UUID PRIMARY KEY,
    device_id TEXT,
    tier TEXT NOT NULL DEFAULT 'free',
    subscription_expires_at TIMESTAMPTZ,
    product_id TEXT,
    receipt_verified_at TIMESTAMPTZ,
    lifetime_request_count BIGINT NOT NULL DEFAULT 0,
    monthly_token_count BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    last_request_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS quota_counters (
    user_id UUID NOT NULL REFERENCES entitlements(user_id) ON DELETE CASCADE,
    action_class TEXT NOT NULL,
    used INTEGER NOT NULL DEFAULT 0 CHECK (used >= 0),
    "limit" INTEGER NOT NULL CHECK ("limit" >= 0),
    period_key TEXT,
    PRIMARY KEY (user_id, action_class)
);

CREATE TABLE IF NOT EXISTS usage_log (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL,
    device_id TEXT,
    action_class TEXT NOT NULL,
    model TEXT,
    tier TEXT NOT NULL,
    input_tokens BIGINT,
    output_tokens BIGINT,
    payload_bytes BIGINT,
    estimated_cost_nano_usd BIGINT,
    latency_ms BIGINT NOT NULL,
    outcome TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_usage_log_user_created
    ON usage_log (user_id, created_at DESC);

CREATE INDEX IF NOT EXISTS idx_quota_counters_period
    ON quota_counters (action_class, period_key);
"#;

pub async fn run(pool: &DbPool) -> Result<()> {
    let client = pool.get().await?;
    client.batch_execute(SCHEMA).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}
