pub mod ports;
pub mod service;
pub mod test_helpers;

pub use ports::{AuthError, AuthenticatedUser, IdentityVerifier};
pub use service::JwtIdentityVerifier;
