pub mod entitlement_repository;
pub mod usage_log_repository;

pub use entitlement_repository::PostgresEntitlementLedger;
pub use usage_log_repository::PostgresUsageLogStore;
