pub mod auth;
pub mod entitlement;
pub mod gateway;
pub mod subscription;
pub mod types;

pub use types::UserId;
