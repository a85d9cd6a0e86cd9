use std::fmt;

use crate::UserId;

/// The caller's verified identity, as established from the request's bearer
/// token before any handler runs.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: UserId,
}

#[derive(Debug)]
pub enum AuthError {
    /// Token missing, malformed, expired, or signed with the wrong key. The
    /// detail is logged server-side; clients see one opaque 401.
    InvalidToken(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidToken(msg) => write!(f, "invalid token: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}

/// Verifies a bearer token and yields the caller's identity.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<AuthenticatedUser, AuthError>;
}
