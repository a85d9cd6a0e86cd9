use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::types::{UsageLogId, UserId};

/// The three gated upstream capabilities. Each has its own quota counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub enum ActionClass {
    Chat,
    Transcription,
    Vision,
}

impl ActionClass {
    pub const ALL: [ActionClass; 3] = [
        ActionClass::Chat,
        ActionClass::Transcription,
        ActionClass::Vision,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionClass::Chat => "chat",
            ActionClass::Transcription => "transcription",
            ActionClass::Vision => "vision",
        }
    }
}

impl fmt::Display for ActionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(ActionClass::Chat),
            "transcription" => Ok(ActionClass::Transcription),
            "vision" => Ok(ActionClass::Vision),
            other => Err(format!("unknown action class: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub enum SubscriptionTier {
    Free,
    Pro,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Pro => "pro",
        }
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(SubscriptionTier::Free),
            "pro" => Ok(SubscriptionTier::Pro),
            other => Err(format!("unknown subscription tier: {}", other)),
        }
    }
}

/// Reset cadence governing every counter in a deployment. This is a
/// deployment-wide policy choice carried in configuration, never stored
/// per user, so the gate's logic cannot come to depend on the shape of
/// individual records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaPolicy {
    Daily,
    Monthly,
    Lifetime,
}

/// Deployment quota policy: one cadence plus the current free-tier default
/// limit per action class.
#[derive(Debug, Clone)]
pub struct QuotaPolicyConfig {
    pub cadence: QuotaPolicy,
    pub chat_limit: u32,
    pub transcription_limit: u32,
    pub vision_limit: u32,
}

impl QuotaPolicyConfig {
    pub fn default_limit(&self, class: ActionClass) -> u32 {
        match class {
            ActionClass::Chat => self.chat_limit,
            ActionClass::Transcription => self.transcription_limit,
            ActionClass::Vision => self.vision_limit,
        }
    }
}

/// One per-action-class counter on an entitlement record.
///
/// Records written by earlier deployments used different field names; the
/// serde aliases below map every historical shape onto the current one at
/// read time so business logic never branches on which fields exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaCounter {
    #[serde(alias = "count", alias = "requests_used")]
    pub used: u32,
    #[serde(alias = "max_requests", alias = "cap")]
    pub limit: u32,
    /// Identifies the accounting period the counter belongs to
    /// (`YYYY-MM-DD` or `YYYY-MM`). Absent under a lifetime policy.
    #[serde(default, alias = "month_stamp", alias = "reset_period")]
    pub period_key: Option<String>,
}

impl QuotaCounter {
    pub fn fresh(limit: u32, period_key: Option<String>) -> Self {
        Self {
            used: 0,
            limit,
            period_key,
        }
    }
}

/// Durable per-user entitlement state: quota counters, tier, device binding
/// and reporting-only statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementRecord {
    pub user_id: UserId,
    /// Last device seen for this user. An anti-abuse signal only, never a
    /// security boundary.
    pub device_id: Option<String>,
    pub tier: SubscriptionTier,
    pub subscription_expires_at: Option<DateTime<Utc>>,
    pub product_id: Option<String>,
    pub receipt_verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub counters: HashMap<ActionClass, QuotaCounter>,
    /// Monotonic request statistic. Never gates access.
    #[serde(default, alias = "total_requests")]
    pub lifetime_request_count: i64,
    /// Aggregate token statistic. Tracked and reported, never enforced.
    #[serde(default, alias = "monthly_tokens")]
    pub monthly_token_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_request_at: Option<DateTime<Utc>>,
}

impl EntitlementRecord {
    /// Zeroed free-tier record for a first-seen user.
    pub fn new_free(
        user_id: UserId,
        device_id: Option<String>,
        policy: &QuotaPolicyConfig,
        period_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let counters = ActionClass::ALL
            .into_iter()
            .map(|class| {
                (
                    class,
                    QuotaCounter::fresh(policy.default_limit(class), period_key.clone()),
                )
            })
            .collect();

        Self {
            user_id,
            device_id,
            tier: SubscriptionTier::Free,
            subscription_expires_at: None,
            product_id: None,
            receipt_verified_at: None,
            counters,
            lifetime_request_count: 0,
            monthly_token_count: 0,
            created_at: now,
            last_request_at: None,
        }
    }
}

/// Result of the ledger's atomic check-and-increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// One unit reserved. `used` is the post-increment value.
    Consumed { used: u32, limit: u32 },
    /// The counter is at its limit; nothing was written.
    Exhausted { used: u32, limit: u32 },
    /// The stored period key no longer matches the expected one; the caller
    /// must re-normalize and retry.
    PeriodMoved,
    /// No counter row exists for this user and class.
    CounterMissing,
}

/// A successful quota reservation, returned to the gateway before the
/// upstream call is attempted.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub tier: SubscriptionTier,
    /// None for pro (unbounded).
    pub limit: Option<u32>,
    /// Remaining allowance after this reservation. None for pro.
    pub remaining_after: Option<u32>,
}

/// Per-class standing as reported by the usage summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct CounterSnapshot {
    pub used: u32,
    /// None for pro (unbounded).
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
}

/// Stable current-shape entitlement snapshot, regardless of which legacy
/// fields exist on the stored record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct EntitlementSnapshot {
    pub tier: SubscriptionTier,
    pub subscription_expires_at: Option<DateTime<Utc>>,
    pub chat: CounterSnapshot,
    pub transcription: CounterSnapshot,
    pub vision: CounterSnapshot,
    pub lifetime_request_count: i64,
    pub monthly_token_count: i64,
}

/// Append-only record of one attempted or completed action. Written
/// best-effort after the action's outcome is determined; a failed write
/// never fails the action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub id: UsageLogId,
    pub user_id: UserId,
    pub device_id: Option<String>,
    pub action_class: ActionClass,
    pub model: Option<String>,
    pub tier: SubscriptionTier,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub payload_bytes: Option<i64>,
    pub estimated_cost_nano_usd: Option<i64>,
    pub latency_ms: i64,
    /// "ok" or a stable error code.
    pub outcome: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum EntitlementError {
    /// Free-tier allowance for the action class is used up. Carries the
    /// limit and tier so clients can render an upgrade prompt.
    QuotaExhausted {
        limit: u32,
        tier: SubscriptionTier,
    },
    /// Ledger contention did not settle within the retry budget.
    Contention,
    /// Underlying store failure.
    Ledger(String),
}

impl fmt::Display for EntitlementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuotaExhausted { limit, tier } => {
                write!(f, "quota exhausted: limit {} on {} tier", limit, tier)
            }
            Self::Contention => write!(f, "ledger contention exceeded retry budget"),
            Self::Ledger(msg) => write!(f, "ledger error: {}", msg),
        }
    }
}

impl std::error::Error for EntitlementError {}

impl From<anyhow::Error> for EntitlementError {
    fn from(err: anyhow::Error) -> Self {
        Self::Ledger(format!("{:#}", err))
    }
}

/// Durable store for entitlement records.
///
/// Every mutation is a dedicated atomic primitive against specific fields;
/// implementations must never rewrite whole records from a cached snapshot,
/// which would lose concurrent increments from other actors.
#[async_trait]
pub trait EntitlementLedger: Send + Sync {
    async fn load(&self, user_id: UserId) -> anyhow::Result<Option<EntitlementRecord>>;

    /// Insert the record unless one already exists; returns the stored
    /// record either way (first writer wins).
    async fn create_if_absent(
        &self,
        record: EntitlementRecord,
    ) -> anyhow::Result<EntitlementRecord>;

    /// Insert a counter for a class the stored record predates. No-op when
    /// the counter already exists.
    async fn ensure_counter(
        &self,
        user_id: UserId,
        class: ActionClass,
        counter: QuotaCounter,
    ) -> anyhow::Result<()>;

    /// Atomically reset `used` to zero and stamp `new_period`, but only if
    /// the stored period key still equals `expected_period` (compare-and-set
    /// so concurrent rollovers are idempotent). Returns whether a row was
    /// updated.
    async fn reset_counter(
        &self,
        user_id: UserId,
        class: ActionClass,
        expected_period: Option<&str>,
        new_period: Option<&str>,
    ) -> anyhow::Result<bool>;

    /// One-time limit correction when the deployment default has moved.
    async fn migrate_limit(
        &self,
        user_id: UserId,
        class: ActionClass,
        limit: u32,
    ) -> anyhow::Result<()>;

    /// The concurrency-critical primitive: in one atomic step, increment
    /// `used` iff the tier is pro or `used < limit`, and only while the
    /// stored period key equals `expected_period`. Also bumps
    /// `lifetime_request_count` and `last_request_at` on success.
    async fn try_consume_unit(
        &self,
        user_id: UserId,
        class: ActionClass,
        expected_period: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ConsumeOutcome>;

    /// Overwrite the stored device binding.
    async fn bind_device(&self, user_id: UserId, device_id: &str) -> anyhow::Result<()>;

    /// Authoritative tier update from a verified receipt. Overwrites prior
    /// tier state unconditionally.
    async fn apply_receipt(
        &self,
        user_id: UserId,
        tier: SubscriptionTier,
        expires_at: Option<DateTime<Utc>>,
        product_id: &str,
        verified_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Add to the reporting-only monthly token statistic.
    async fn add_token_usage(&self, user_id: UserId, tokens: i64) -> anyhow::Result<()>;

    /// Bulk maintenance reset: zero every free-tier counter for `class`
    /// whose period key differs from `current_period`. Returns the number
    /// of counters reset.
    async fn reset_stale_free_counters(
        &self,
        class: ActionClass,
        current_period: &str,
    ) -> anyhow::Result<u64>;
}

/// Append-only usage log.
#[async_trait]
pub trait UsageLogStore: Send + Sync {
    async fn append(&self, entry: UsageLogEntry) -> anyhow::Result<()>;
}

/// Request-time entitlement decisions.
#[async_trait]
pub trait EntitlementService: Send + Sync {
    /// Atomically check-and-consume one unit of quota for the action class,
    /// or reject with `QuotaExhausted` without mutating anything. Also
    /// reconciles the device binding (non-blocking) and normalizes the
    /// counter for `now` (period rollover, limit migration) first.
    async fn try_consume(
        &self,
        user_id: UserId,
        device_id: Option<&str>,
        class: ActionClass,
        now: DateTime<Utc>,
    ) -> Result<Reservation, EntitlementError>;

    /// Eventually-consistent entitlement snapshot. Performs no writes; a
    /// counter from a previous period is presented as zeroed.
    async fn usage_summary(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<EntitlementSnapshot, EntitlementError>;

    /// Reporting-only token statistic.
    async fn note_token_usage(&self, user_id: UserId, tokens: i64)
        -> Result<(), EntitlementError>;

    /// Scheduled maintenance bulk reset for periodic-cadence deployments.
    /// Belt-and-suspenders next to the lazy per-request rollover. Returns
    /// the number of counters reset (0 under a lifetime policy).
    async fn reset_stale_counters(&self, now: DateTime<Utc>) -> Result<u64, EntitlementError>;
}
