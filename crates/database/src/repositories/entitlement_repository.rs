//! PostgreSQL implementation of the entitlement ledger.
//!
//! Every mutation is a dedicated conditional statement against specific
//! columns. Whole-row rewrites are never used: a cached snapshot written
//! back would lose concurrent increments from other requests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::Row;

use services::entitlement::ports::{
    ActionClass, ConsumeOutcome, EntitlementLedger, EntitlementRecord, QuotaCounter,
    SubscriptionTier,
};
use services::UserId;

use crate::pool::DbPool;

pub struct PostgresEntitlementLedger {
    pool: DbPool,
}

impl PostgresEntitlementLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn record_from_rows(entitlement: &Row, counters: &[Row]) -> anyhow::Result<EntitlementRecord> {
        let tier: SubscriptionTier = entitlement
            .get::<_, String>("tier")
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;

        let mut counter_map = HashMap::new();
        for row in counters {
            let class: ActionClass = row
                .get::<_, String>("action_class")
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            counter_map.insert(
                class,
                QuotaCounter {
                    used: row.get::<_, i32>("used") as u32,
                    limit: row.get::<_, i32>("limit") as u32,
                    period_key: row.get("period_key"),
                },
            );
        }

        Ok(EntitlementRecord {
            user_id: entitlement.get("user_id"),
            device_id: entitlement.get("device_id"),
            tier,
            subscription_expires_at: entitlement.get("subscription_expires_at"),
            product_id: entitlement.get("product_id"),
            receipt_verified_at: entitlement.get("receipt_verified_at"),
            counters: counter_map,
            lifetime_request_count: entitlement.get("lifetime_request_count"),
            monthly_token_count: entitlement.get("monthly_token_count"),
            created_at: entitlement.get("created_at"),
            last_request_at: entitlement.get("last_request_at"),
        })
    }
}

#[async_trait]
impl EntitlementLedger for PostgresEntitlementLedger {
    async fn load(&self, user_id: UserId) -> anyhow::Result<Option<EntitlementRecord>> {
        let client = self.pool.get().await?;

        let Some(entitlement) = client
            .query_opt("SELECT * FROM entitlements WHERE user_id = $1", &[&user_id])
            .await?
        else {
            return Ok(None);
        };

        let counters = client
            .query(
                "SELECT * FROM quota_counters WHERE user_id = $1",
                &[&user_id],
            )
            .await?;

        Ok(Some(Self::record_from_rows(&entitlement, &counters)?))
    }

    async fn create_if_absent(
        &self,
        record: EntitlementRecord,
    ) -> anyhow::Result<EntitlementRecord> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;

        txn.execute(
            r#"
            INSERT INTO entitlements
                (user_id, device_id, tier, subscription_expires_at, product_id,
                 receipt_verified_at, lifetime_request_count, monthly_token_count,
                 created_at, last_request_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (user_id) DO NOTHING
            "#,
            &[
                &record.user_id,
                &record.device_id,
                &record.tier.as_str(),
                &record.subscription_expires_at,
                &record.product_id,
                &record.receipt_verified_at,
                &record.lifetime_request_count,
                &record.monthly_token_count,
                &record.created_at,
                &record.last_request_at,
            ],
        )
        .await?;

        for (class, counter) in &record.counters {
            txn.execute(
                r#"
                INSERT INTO quota_counters (user_id, action_class, used, "limit", period_key)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (user_id, action_class) DO NOTHING
                "#,
                &[
                    &record.user_id,
                    &class.as_str(),
                    &(counter.used as i32),
                    &(counter.limit as i32),
                    &counter.period_key,
                ],
            )
            .await?;
        }

        txn.commit().await?;

        // First writer wins; return what is actually stored.
        self.load(record.user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("entitlement record vanished after insert"))
    }

    async fn ensure_counter(
        &self,
        user_id: UserId,
        class: ActionClass,
        counter: QuotaCounter,
    ) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                INSERT INTO quota_counters (user_id, action_class, used, "limit", period_key)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (user_id, action_class) DO NOTHING
                "#,
                &[
                    &user_id,
                    &class.as_str(),
                    &(counter.used as i32),
                    &(counter.limit as i32),
                    &counter.period_key,
                ],
            )
            .await?;
        Ok(())
    }

    async fn reset_counter(
        &self,
        user_id: UserId,
        class: ActionClass,
        expected_period: Option<&str>,
        new_period: Option<&str>,
    ) -> anyhow::Result<bool> {
        let client = self.pool.get().await?;
        // used and period_key move together in one statement; the period
        // predicate makes concurrent rollovers settle to exactly one winner.
        let updated = client
            .execute(
                r#"
                UPDATE quota_counters
                SET used = 0, period_key = $4
                WHERE user_id = $1 AND action_class = $2
                  AND period_key IS NOT DISTINCT FROM $3
                "#,
                &[&user_id, &class.as_str(), &expected_period, &new_period],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn migrate_limit(
        &self,
        user_id: UserId,
        class: ActionClass,
        limit: u32,
    ) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"UPDATE quota_counters SET "limit" = $3 WHERE user_id = $1 AND action_class = $2"#,
                &[&user_id, &class.as_str(), &(limit as i32)],
            )
            .await?;
        Ok(())
    }

    async fn try_consume_unit(
        &self,
        user_id: UserId,
        class: ActionClass,
        expected_period: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ConsumeOutcome> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;

        // The check and the increment are one conditional statement: two
        // racing requests can never both pass on the same last unit.
        let consumed = txn
            .query_opt(
                r#"
                UPDATE quota_counters qc
                SET used = qc.used + 1
                FROM entitlements e
                WHERE e.user_id = qc.user_id
                  AND qc.user_id = $1 AND qc.action_class = $2
                  AND qc.period_key IS NOT DISTINCT FROM $3
                  AND (e.tier = 'pro' OR qc.used < qc."limit")
                RETURNING qc.used, qc."limit"
                "#,
                &[&user_id, &class.as_str(), &expected_period],
            )
            .await?;

        let Some(row) = consumed else {
            txn.commit().await?;
            // Distinguish why the conditional update matched nothing.
            let client = self.pool.get().await?;
            let current = client
                .query_opt(
                    r#"
                    SELECT used, "limit", period_key FROM quota_counters
                    WHERE user_id = $1 AND action_class = $2
                    "#,
                    &[&user_id, &class.as_str()],
                )
                .await?;
            return Ok(match current {
                None => ConsumeOutcome::CounterMissing,
                Some(row) if row.get::<_, Option<String>>("period_key").as_deref()
                    != expected_period =>
                {
                    ConsumeOutcome::PeriodMoved
                }
                Some(row) => ConsumeOutcome::Exhausted {
                    used: row.get::<_, i32>("used") as u32,
                    limit: row.get::<_, i32>("limit") as u32,
                },
            });
        };

        txn.execute(
            r#"
            UPDATE entitlements
            SET lifetime_request_count = lifetime_request_count + 1, last_request_at = $2
            WHERE user_id = $1
            "#,
            &[&user_id, &now],
        )
        .await?;
        txn.commit().await?;

        Ok(ConsumeOutcome::Consumed {
            used: row.get::<_, i32>("used") as u32,
            limit: row.get::<_, i32>("limit") as u32,
        })
    }

    async fn bind_device(&self, user_id: UserId, device_id: &str) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE entitlements SET device_id = $2 WHERE user_id = $1",
                &[&user_id, &device_id],
            )
            .await?;
        Ok(())
    }

    async fn apply_receipt(
        &self,
        user_id: UserId,
        tier: SubscriptionTier,
        expires_at: Option<DateTime<Utc>>,
        product_id: &str,
        verified_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        // A receipt may arrive before the user's first gated action; the
        // upsert creates the record in that case.
        client
            .execute(
                r#"
                INSERT INTO entitlements
                    (user_id, tier, subscription_expires_at, product_id, receipt_verified_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (user_id) DO UPDATE SET
                    tier = EXCLUDED.tier,
                    subscription_expires_at = EXCLUDED.subscription_expires_at,
                    product_id = EXCLUDED.product_id,
                    receipt_verified_at = EXCLUDED.receipt_verified_at
                "#,
                &[
                    &user_id,
                    &tier.as_str(),
                    &expires_at,
                    &product_id,
                    &verified_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn add_token_usage(&self, user_id: UserId, tokens: i64) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                UPDATE entitlements
                SET monthly_token_count = monthly_token_count + $2
                WHERE user_id = $1
                "#,
                &[&user_id, &tokens],
            )
            .await?;
        Ok(())
    }

    async fn reset_stale_free_counters(
        &self,
        class: ActionClass,
        current_period: &str,
    ) -> anyhow::Result<u64> {
        let client = self.pool.get().await?;
        let reset = client
            .execute(
                r#"
                UPDATE quota_counters qc
                SET used = 0, period_key = $2
                FROM entitlements e
                WHERE e.user_id = qc.user_id
                  AND qc.action_class = $1
                  AND e.tier = 'free'
                  AND qc.period_key IS DISTINCT FROM $2
                "#,
                &[&class.as_str(), &current_period],
            )
            .await?;
        Ok(reset)
    }
}
