//! Test doubles for the identity seam, shared by integration tests.

use std::collections::HashMap;

use crate::UserId;

use super::ports::{AuthError, AuthenticatedUser, IdentityVerifier};

/// Maps literal bearer tokens to user ids; anything else is rejected.
#[derive(Default)]
pub struct StaticIdentityVerifier {
    tokens: HashMap<String, UserId>,
}

impl StaticIdentityVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: &str, user_id: UserId) -> Self {
        self.tokens.insert(token.to_string(), user_id);
        self
    }
}

impl IdentityVerifier for StaticIdentityVerifier {
    fn verify(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        self.tokens
            .get(token)
            .map(|user_id| AuthenticatedUser { user_id: *user_id })
            .ok_or_else(|| AuthError::InvalidToken("unknown static token".to_string()))
    }
}
