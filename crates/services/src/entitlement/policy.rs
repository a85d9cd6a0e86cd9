//! Pure quota-policy evaluation and period arithmetic. No side effects;
//! callable repeatedly.

use chrono::{DateTime, Datelike, Utc};

use super::ports::{QuotaCounter, QuotaPolicy, SubscriptionTier};

/// The applicable limit and remaining allowance for one counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaStanding {
    /// None when the tier is pro (unbounded).
    pub limit: Option<u32>,
    pub used: u32,
    pub remaining: Option<u32>,
}

impl QuotaStanding {
    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }
}

/// Period key for `now` at the policy's granularity, UTC. `None` under a
/// lifetime policy, which has no period concept at all.
pub fn current_period_key(cadence: QuotaPolicy, now: DateTime<Utc>) -> Option<String> {
    match cadence {
        QuotaPolicy::Daily => Some(format!(
            "{:04}-{:02}-{:02}",
            now.year(),
            now.month(),
            now.day()
        )),
        QuotaPolicy::Monthly => Some(format!("{:04}-{:02}", now.year(), now.month())),
        QuotaPolicy::Lifetime => None,
    }
}

/// Whether the counter belongs to a stale period and must be reset before
/// any quota decision is made with it. A lifetime counter (expected period
/// `None`) never rolls over; a periodic counter missing its period key is
/// treated as stale.
pub fn needs_rollover(counter: &QuotaCounter, expected_period: Option<&str>) -> bool {
    match expected_period {
        None => false,
        Some(expected) => counter.period_key.as_deref() != Some(expected),
    }
}

/// Whether the stored free-tier limit predates the current deployment
/// default and should be corrected opportunistically.
pub fn needs_limit_migration(
    tier: SubscriptionTier,
    counter: &QuotaCounter,
    default_limit: u32,
) -> bool {
    tier == SubscriptionTier::Free && counter.limit != default_limit
}

/// Compute standing for a counter that has already been normalized for
/// `now`. Pro is exempt from counter enforcement entirely.
pub fn evaluate(tier: SubscriptionTier, counter: &QuotaCounter) -> QuotaStanding {
    match tier {
        SubscriptionTier::Pro => QuotaStanding {
            limit: None,
            used: counter.used,
            remaining: None,
        },
        SubscriptionTier::Free => QuotaStanding {
            limit: Some(counter.limit),
            used: counter.used,
            remaining: Some(counter.limit.saturating_sub(counter.used)),
        },
    }
}
