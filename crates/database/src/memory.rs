//! In-memory ledger for mock mode and hermetic tests.
//!
//! Holds one mutex over all records, so every mutation is a single atomic
//! step and the check-and-increment contract matches the PostgreSQL
//! implementation exactly.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use services::entitlement::ports::{
    ActionClass, ConsumeOutcome, EntitlementLedger, EntitlementRecord, QuotaCounter,
    SubscriptionTier, UsageLogEntry, UsageLogStore,
};
use services::UserId;

#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<HashMap<UserId, EntitlementRecord>>,
    log: Mutex<Vec<UsageLogEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: read a stored record directly.
    pub fn record(&self, user_id: UserId) -> Option<EntitlementRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).get(&user_id).cloned()
    }

    /// Test hook: seed a record directly.
    pub fn insert_record(&self, record: EntitlementRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.user_id, record);
    }

    /// Test hook: all appended usage-log entries.
    pub fn log_entries(&self) -> Vec<UsageLogEntry> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, EntitlementRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EntitlementLedger for MemoryLedger {
    async fn load(&self, user_id: UserId) -> anyhow::Result<Option<EntitlementRecord>> {
        Ok(self.lock().get(&user_id).cloned())
    }

    async fn create_if_absent(
        &self,
        record: EntitlementRecord,
    ) -> anyhow::Result<EntitlementRecord> {
        let mut records = self.lock();
        Ok(records.entry(record.user_id).or_insert(record).clone())
    }

    async fn ensure_counter(
        &self,
        user_id: UserId,
        class: ActionClass,
        counter: QuotaCounter,
    ) -> anyhow::Result<()> {
        let mut records = self.lock();
        if let Some(record) = records.get_mut(&user_id) {
            record.counters.entry(class).or_insert(counter);
        }
        Ok(())
    }

    async fn reset_counter(
        &self,
        user_id: UserId,
        class: ActionClass,
        expected_period: Option<&str>,
        new_period: Option<&str>,
    ) -> anyhow::Result<bool> {
        let mut records = self.lock();
        let Some(counter) = records
            .get_mut(&user_id)
            .and_then(|r| r.counters.get_mut(&class))
        else {
            return Ok(false);
        };
        if counter.period_key.as_deref() != expected_period {
            return Ok(false);
        }
        counter.used = 0;
        counter.period_key = new_period.map(str::to_string);
        Ok(true)
    }

    async fn migrate_limit(
        &self,
        user_id: UserId,
        class: ActionClass,
        limit: u32,
    ) -> anyhow::Result<()> {
        let mut records = self.lock();
        if let Some(counter) = records
            .get_mut(&user_id)
            .and_then(|r| r.counters.get_mut(&class))
        {
            counter.limit = limit;
        }
        Ok(())
    }

    async fn try_consume_unit(
        &self,
        user_id: UserId,
        class: ActionClass,
        expected_period: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ConsumeOutcome> {
        let mut records = self.lock();
        let Some(record) = records.get_mut(&user_id) else {
            return Ok(ConsumeOutcome::CounterMissing);
        };
        let tier = record.tier;
        let Some(counter) = record.counters.get_mut(&class) else {
            return Ok(ConsumeOutcome::CounterMissing);
        };
        if counter.period_key.as_deref() != expected_period {
            return Ok(ConsumeOutcome::PeriodMoved);
        }
        if tier == SubscriptionTier::Free && counter.used >= counter.limit {
            return Ok(ConsumeOutcome::Exhausted {
                used: counter.used,
                limit: counter.limit,
            });
        }
        counter.used += 1;
        let outcome = ConsumeOutcome::Consumed {
            used: counter.used,
            limit: counter.limit,
        };
        record.lifetime_request_count += 1;
        record.last_request_at = Some(now);
        Ok(outcome)
    }

    async fn bind_device(&self, user_id: UserId, device_id: &str) -> anyhow::Result<()> {
        let mut records = self.lock();
        if let Some(record) = records.get_mut(&user_id) {
            record.device_id = Some(device_id.to_string());
        }
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
        let mut records = self.lock();
        // A receipt may arrive before the user's first gated action.
        let record = records.entry(user_id).or_insert_with(|| EntitlementRecord {
            user_id,
            device_id: None,
            tier: SubscriptionTier::Free,
            subscription_expires_at: None,
            product_id: None,
            receipt_verified_at: None,
            counters: HashMap::new(),
            lifetime_request_count: 0,
            monthly_token_count: 0,
            created_at: verified_at,
            last_request_at: None,
        });
        record.tier = tier;
        record.subscription_expires_at = expires_at;
        record.product_id = Some(product_id.to_string());
        record.receipt_verified_at = Some(verified_at);
        Ok(())
    }

    async fn add_token_usage(&self, user_id: UserId, tokens: i64) -> anyhow::Result<()> {
        let mut records = self.lock();
        if let Some(record) = records.get_mut(&user_id) {
            record.monthly_token_count += tokens;
        }
        Ok(())
    }

    async fn reset_stale_free_counters(
        &self,
        class: ActionClass,
        current_period: &str,
    ) -> anyhow::Result<u64> {
        let mut records = self.lock();
        let mut count = 0;
        for record in records.values_mut() {
            if record.tier != SubscriptionTier::Free {
                continue;
            }
            if let Some(counter) = record.counters.get_mut(&class) {
                if counter.period_key.as_deref() != Some(current_period) {
                    counter.used = 0;
                    counter.period_key = Some(current_period.to_string());
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl UsageLogStore for MemoryLedger {
    async fn append(&self, entry: UsageLogEntry) -> anyhow::Result<()> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).push(entry);
        Ok(())
    }
}
