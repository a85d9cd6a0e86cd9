use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::entitlement::ports::SubscriptionTier;
use crate::UserId;

/// Claims carried inside a signed store receipt (App Store JWS transaction
/// format). Field names follow the store's payload, not ours.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptClaims {
    pub product_id: String,
    pub original_transaction_id: String,
    /// Expiry in milliseconds since the Unix epoch. Absent for
    /// non-expiring products.
    #[serde(default)]
    pub expires_date: Option<i64>,
    /// Purchase time in milliseconds since the Unix epoch.
    pub purchase_date: i64,
    #[serde(default)]
    pub environment: Option<String>,
}

impl ReceiptClaims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_date.and_then(DateTime::from_timestamp_millis)
    }
}

/// The reconciled subscription state after a receipt has been verified and
/// applied. Mirrors what is now stored on the entitlement record.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub struct VerifiedSubscription {
    pub tier: SubscriptionTier,
    pub product_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub enum SubscriptionError {
    /// The receipt's signature, structure or claims could not be verified.
    /// The reason is logged server-side and never surfaced to clients.
    VerificationFailed(String),
    /// Underlying store failure while applying the verified state.
    Ledger(String),
}

impl fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VerificationFailed(msg) => write!(f, "receipt verification failed: {}", msg),
            Self::Ledger(msg) => write!(f, "ledger error: {}", msg),
        }
    }
}

impl std::error::Error for SubscriptionError {}

impl From<anyhow::Error> for SubscriptionError {
    fn from(err: anyhow::Error) -> Self {
        Self::Ledger(format!("{:#}", err))
    }
}

/// Cryptographic verification of a signed store receipt. Implementations
/// must reject anything whose signature does not chain to a trusted key;
/// claims from an unverified payload are never trusted.
pub trait ReceiptVerifier: Send + Sync {
    fn verify(&self, signed_receipt: &str) -> Result<ReceiptClaims, SubscriptionError>;
}

/// Receipt-driven subscription reconciliation.
#[async_trait]
pub trait SubscriptionService: Send + Sync {
    /// Verify the signed receipt and overwrite the user's stored tier state
    /// with what the receipt proves, in both directions: a live receipt
    /// grants pro, an expired one demotes to free.
    async fn reconcile_receipt(
        &self,
        user_id: UserId,
        signed_receipt: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifiedSubscription, SubscriptionError>;
}
