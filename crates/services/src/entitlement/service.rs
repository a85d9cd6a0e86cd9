use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::UserId;

use super::policy::{
    current_period_key, evaluate, needs_limit_migration, needs_rollover, QuotaStanding,
};
use super::ports::{
    ActionClass, ConsumeOutcome, CounterSnapshot, EntitlementError, EntitlementLedger,
    EntitlementRecord, EntitlementService, EntitlementSnapshot, QuotaCounter, QuotaPolicy,
    QuotaPolicyConfig, Reservation, SubscriptionTier,
};

/// Bounded optimistic retry when the ledger reports contention (a concurrent
/// request rolled the period over, or created the record first).
const MAX_CONSUME_ATTEMPTS: usize = 4;

/// Default implementation of `EntitlementService` backed by an
/// `EntitlementLedger`.
///
/// There is no in-process lock coordinating requests for the same user;
/// correctness against concurrent double-consumption comes entirely from the
/// ledger's atomic conditional primitives.
pub struct EntitlementServiceImpl {
    ledger: Arc<dyn EntitlementLedger>,
    policy: QuotaPolicyConfig,
}

impl EntitlementServiceImpl {
    pub fn new(ledger: Arc<dyn EntitlementLedger>, policy: QuotaPolicyConfig) -> Self {
        Self { ledger, policy }
    }

    /// Load the record, creating a zeroed free-tier one for a first-seen
    /// user. First writer wins; the stored record is returned either way.
    async fn load_or_create(
        &self,
        user_id: UserId,
        device_id: Option<&str>,
        period_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<EntitlementRecord> {
        if let Some(record) = self.ledger.load(user_id).await? {
            return Ok(record);
        }
        tracing::info!(user_id = %user_id, "Creating entitlement record for first-seen user");
        self.ledger
            .create_if_absent(EntitlementRecord::new_free(
                user_id,
                device_id.map(str::to_string),
                &self.policy,
                period_key.map(str::to_string),
                now,
            ))
            .await
    }

    /// Device-binding guard: on mismatch, overwrite and warn. Never blocks
    /// the request; the device id is an anti-abuse signal, not a security
    /// boundary.
    async fn reconcile_device(
        &self,
        record: &EntitlementRecord,
        presented: Option<&str>,
    ) -> anyhow::Result<()> {
        let Some(presented) = presented else {
            return Ok(());
        };
        match record.device_id.as_deref() {
            Some(stored) if stored != presented => {
                tracing::warn!(
                    user_id = %record.user_id,
                    stored_device = stored,
                    presented_device = presented,
                    "Device binding mismatch; rebinding to presented device"
                );
                self.ledger.bind_device(record.user_id, presented).await
            }
            None => self.ledger.bind_device(record.user_id, presented).await,
            Some(_) => Ok(()),
        }
    }

    /// Normalize one counter for `now`: create it if the record predates the
    /// action class, apply a due period rollover, and correct a stale
    /// free-tier limit. Returns the counter as it stands after
    /// normalization, or None when a concurrent writer moved it first and
    /// the caller should re-read.
    async fn normalize_counter(
        &self,
        record: &EntitlementRecord,
        class: ActionClass,
        expected_period: Option<&str>,
    ) -> anyhow::Result<Option<QuotaCounter>> {
        let default_limit = self.policy.default_limit(class);

        let mut counter = match record.counters.get(&class) {
            Some(counter) => counter.clone(),
            None => {
                let fresh =
                    QuotaCounter::fresh(default_limit, expected_period.map(str::to_string));
                self.ledger
                    .ensure_counter(record.user_id, class, fresh.clone())
                    .await?;
                fresh
            }
        };

        if needs_rollover(&counter, expected_period) {
            let reset = self
                .ledger
                .reset_counter(
                    record.user_id,
                    class,
                    counter.period_key.as_deref(),
                    expected_period,
                )
                .await?;
            if !reset {
                // Lost the compare-and-set to a concurrent rollover.
                return Ok(None);
            }
            tracing::debug!(
                user_id = %record.user_id,
                class = %class,
                old_period = ?counter.period_key,
                new_period = ?expected_period,
                "Counter period rolled over"
            );
            counter.used = 0;
            counter.period_key = expected_period.map(str::to_string);
        }

        if needs_limit_migration(record.tier, &counter, default_limit) {
            tracing::info!(
                user_id = %record.user_id,
                class = %class,
                stored_limit = counter.limit,
                default_limit,
                "Migrating counter limit to current deployment default"
            );
            self.ledger
                .migrate_limit(record.user_id, class, default_limit)
                .await?;
            counter.limit = default_limit;
        }

        Ok(Some(counter))
    }

    fn snapshot_counter(
        &self,
        record: &EntitlementRecord,
        class: ActionClass,
        expected_period: Option<&str>,
    ) -> CounterSnapshot {
        let default_limit = self.policy.default_limit(class);
        let mut counter = record
            .counters
            .get(&class)
            .cloned()
            .unwrap_or_else(|| QuotaCounter::fresh(default_limit, None));

        // Present a stale-period counter as already rolled over; the write
        // itself stays lazy (next action request performs it).
        if needs_rollover(&counter, expected_period) {
            counter.used = 0;
        }
        if needs_limit_migration(record.tier, &counter, default_limit) {
            counter.limit = default_limit;
        }

        let QuotaStanding {
            limit,
            used,
            remaining,
        } = evaluate(record.tier, &counter);
        CounterSnapshot {
            used,
            limit,
            remaining,
        }
    }
}

#[async_trait]
impl EntitlementService for EntitlementServiceImpl {
    async fn try_consume(
        &self,
        user_id: UserId,
        device_id: Option<&str>,
        class: ActionClass,
        now: DateTime<Utc>,
    ) -> Result<Reservation, EntitlementError> {
        let expected_period = current_period_key(self.policy.cadence, now);
        let expected_period = expected_period.as_deref();

        for _ in 0..MAX_CONSUME_ATTEMPTS {
            let record = self
                .load_or_create(user_id, device_id, expected_period, now)
                .await?;

            self.reconcile_device(&record, device_id).await?;

            let Some(counter) = self
                .normalize_counter(&record, class, expected_period)
                .await?
            else {
                continue;
            };

            // Pre-check on the normalized snapshot: a refused request must
            // not be charged, so reject before any counter mutation.
            let standing = evaluate(record.tier, &counter);
            if record.tier == SubscriptionTier::Free && standing.is_exhausted() {
                return Err(EntitlementError::QuotaExhausted {
                    limit: counter.limit,
                    tier: record.tier,
                });
            }

            // The authoritative decision: check and increment in one atomic
            // ledger step, so concurrent requests cannot both pass on the
            // same last unit.
            match self
                .ledger
                .try_consume_unit(user_id, class, expected_period, now)
                .await?
            {
                ConsumeOutcome::Consumed { used, limit } => {
                    let (limit, remaining_after) = match record.tier {
                        SubscriptionTier::Pro => (None, None),
                        SubscriptionTier::Free => {
                            (Some(limit), Some(limit.saturating_sub(used)))
                        }
                    };
                    return Ok(Reservation {
                        tier: record.tier,
                        limit,
                        remaining_after,
                    });
                }
                ConsumeOutcome::Exhausted { limit, .. } => {
                    return Err(EntitlementError::QuotaExhausted {
                        limit,
                        tier: record.tier,
                    });
                }
                ConsumeOutcome::PeriodMoved | ConsumeOutcome::CounterMissing => continue,
            }
        }

        tracing::error!(
            user_id = %user_id,
            class = %class,
            "Consume did not settle within {} attempts",
            MAX_CONSUME_ATTEMPTS
        );
        Err(EntitlementError::Contention)
    }

    async fn usage_summary(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<EntitlementSnapshot, EntitlementError> {
        let expected_period = current_period_key(self.policy.cadence, now);
        let expected_period = expected_period.as_deref();

        // Status reads are side-effect-free: an unknown user gets the
        // default snapshot without a record being created.
        let record = match self.ledger.load(user_id).await? {
            Some(record) => record,
            None => EntitlementRecord::new_free(
                user_id,
                None,
                &self.policy,
                expected_period.map(str::to_string),
                now,
            ),
        };

        Ok(EntitlementSnapshot {
            tier: record.tier,
            subscription_expires_at: record.subscription_expires_at,
            chat: self.snapshot_counter(&record, ActionClass::Chat, expected_period),
            transcription: self.snapshot_counter(
                &record,
                ActionClass::Transcription,
                expected_period,
            ),
            vision: self.snapshot_counter(&record, ActionClass::Vision, expected_period),
            lifetime_request_count: record.lifetime_request_count,
            monthly_token_count: record.monthly_token_count,
        })
    }

    async fn note_token_usage(
        &self,
        user_id: UserId,
        tokens: i64,
    ) -> Result<(), EntitlementError> {
        self.ledger.add_token_usage(user_id, tokens).await?;
        Ok(())
    }

    async fn reset_stale_counters(&self, now: DateTime<Utc>) -> Result<u64, EntitlementError> {
        let Some(period) = current_period_key(self.policy.cadence, now) else {
            // A lifetime policy has nothing to reset.
            return Ok(0);
        };

        let mut total = 0;
        for class in ActionClass::ALL {
            total += self
                .ledger
                .reset_stale_free_counters(class, &period)
                .await?;
        }
        if total > 0 {
            tracing::info!(period = %period, counters_reset = total, "Bulk counter reset complete");
        }
        Ok(total)
    }
}

/// Whether the deployment cadence has periodic resets at all (drives whether
/// the scheduled maintenance loop is started).
pub fn cadence_is_periodic(cadence: QuotaPolicy) -> bool {
    !matches!(cadence, QuotaPolicy::Lifetime)
}
