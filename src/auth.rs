//! Bearer credential verification

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Missing credential")]
    MissingCredential,

    #[error("Invalid credential")]
    InvalidCredential,

    #[error("Credential expired")]
    Expired,
}

/// The authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
}

/// Validates a bearer credential and yields the principal it belongs to.
#[async_trait]
pub trait AuthGate: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Principal, AuthError>;
}

/// An authenticated client session.
///
/// Created once the auth gate has accepted a credential and handed to the
/// components that act on the user's behalf.
#[derive(Clone)]
pub struct Session {
    pub principal: Principal,
    credential: String,
}

impl Session {
    pub fn new(principal: Principal, credential: impl Into<String>) -> Self {
        Self {
            principal,
            credential: credential.into(),
        }
    }

    /// Verify `credential` against `gate` and open a session for it
    pub async fn open(gate: &dyn AuthGate, credential: &str) -> Result<Self, AuthError> {
        let principal = gate.verify(credential).await?;
        Ok(Self::new(principal, credential))
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.credential)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("principal", &self.principal)
            .field("credential", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// HS256 JWT auth gate
pub struct JwtAuthGate {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthGate {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

#[async_trait]
impl AuthGate for JwtAuthGate {
    async fn verify(&self, credential: &str) -> Result<Principal, AuthError> {
        if credential.trim().is_empty() {
            return Err(AuthError::MissingCredential);
        }

        let data = decode::<Claims>(credential, &self.key, &self.validation).map_err(|e| {
            debug!("JWT validation failed: {:?}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidCredential,
            }
        })?;

        if data.claims.sub.is_empty() {
            return Err(AuthError::InvalidCredential);
        }

        Ok(Principal {
            user_id: data.claims.sub,
        })
    }
}
