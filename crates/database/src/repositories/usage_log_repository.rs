//! Append-only PostgreSQL usage log.

use async_trait::async_trait;

use services::entitlement::ports::{UsageLogEntry, UsageLogStore};

use crate::pool::DbPool;

pub struct PostgresUsageLogStore {
    pool: DbPool,
}

impl PostgresUsageLogStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageLogStore for PostgresUsageLogStore {
    async fn append(&self, entry: UsageLogEntry) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                INSERT INTO usage_log
                    (id, user_id, device_id, action_class, model, tier, input_tokens,
                     output_tokens, payload_bytes, estimated_cost_nano_usd, latency_ms,
                     outcome, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
                &[
                    &entry.id,
                    &entry.user_id,
                    &entry.device_id,
                    &entry.action_class.as_str(),
                    &entry.model,
                    &entry.tier.as_str(),
                    &entry.input_tokens,
                    &entry.output_tokens,
                    &entry.payload_bytes,
                    &entry.estimated_cost_nano_usd,
                    &entry.latency_ms,
                    &entry.outcome,
                    &entry.created_at,
                ],
            )
            .await?;
        Ok(())
    }
}
