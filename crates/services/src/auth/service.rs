use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::UserId;

use super::ports::{AuthError, AuthenticatedUser, IdentityVerifier};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// User id as a UUID string.
    sub: String,
    exp: i64,
}

/// HS256 bearer token verification against the deployment's shared secret.
pub struct JwtIdentityVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl IdentityVerifier for JwtIdentityVerifier {
    fn verify(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let user_id = data
            .claims
            .sub
            .parse::<Uuid>()
            .map(UserId::from)
            .map_err(|e| AuthError::InvalidToken(format!("sub is not a uuid: {}", e)))?;

        Ok(AuthenticatedUser { user_id })
    }
}
