use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entitlement::ports::{EntitlementLedger, SubscriptionTier};
use crate::UserId;

use super::ports::{ReceiptVerifier, SubscriptionError, SubscriptionService, VerifiedSubscription};

/// Reconciles entitlement tier state from verified store receipts.
///
/// The receipt is the single source of truth: whatever tier it proves is
/// written over the stored state, including demotion back to free when the
/// client submits an expired receipt.
pub struct SubscriptionServiceImpl {
    verifier: Arc<dyn ReceiptVerifier>,
    ledger: Arc<dyn EntitlementLedger>,
}

impl SubscriptionServiceImpl {
    pub fn new(verifier: Arc<dyn ReceiptVerifier>, ledger: Arc<dyn EntitlementLedger>) -> Self {
        Self { verifier, ledger }
    }
}

#[async_trait]
impl SubscriptionService for SubscriptionServiceImpl {
    async fn reconcile_receipt(
        &self,
        user_id: UserId,
        signed_receipt: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifiedSubscription, SubscriptionError> {
        let claims = self.verifier.verify(signed_receipt)?;

        let expires_at = claims.expires_at();
        // Strictly greater than now: a receipt expiring at this instant is
        // already lapsed. A missing expiry means a non-subscription product
        // and grants nothing.
        let tier = match expires_at {
            Some(expiry) if expiry > now => SubscriptionTier::Pro,
            _ => SubscriptionTier::Free,
        };

        self.ledger
            .apply_receipt(user_id, tier, expires_at, &claims.product_id, now)
            .await?;

        tracing::info!(
            user_id = %user_id,
            tier = %tier,
            product_id = %claims.product_id,
            expires_at = ?expires_at,
            "Receipt reconciled"
        );

        Ok(VerifiedSubscription {
            tier,
            product_id: claims.product_id,
            expires_at,
        })
    }
}
