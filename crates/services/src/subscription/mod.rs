pub mod ports;
pub mod service;
pub mod verifier;

pub use ports::{ReceiptClaims, ReceiptVerifier, SubscriptionError, VerifiedSubscription};
pub use service::SubscriptionServiceImpl;
pub use verifier::JwsReceiptVerifier;
