//! Connection credential verification.
//!
//! Every namespace runs the same check at handshake time: the client
//! presents `Bearer <jwt>`, the relay verifies the HS256 signature against
//! the shared secret and extracts the identity. Internally the failure
//! modes stay distinct for logging; the client-visible reason collapses
//! them so a rejection does not leak which check failed.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use thiserror::Error;

/// Claims the relay understands. `sub` is required; `email` and `role`
/// ride along for diagnostics and future routing decisions.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[allow(dead_code)]
    exp: u64,
}

/// Authenticated identity attached to a connection for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub email: Option<String>,
    pub role: Option<String>,
}

impl Identity {
    /// Key of the personal room every connection is auto-joined to.
    pub fn personal_room(&self) -> String {
        format!("user:{}", self.subject)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("no credential supplied")]
    MissingCredential,

    #[error("credential is not a Bearer token")]
    InvalidScheme,

    #[error("token expired")]
    Expired,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token rejected: {0}")]
    Invalid(String),
}

impl AuthError {
    /// Reason sent to the client before the connection closes. Everything
    /// except a missing credential collapses to one message.
    pub fn client_reason(&self) -> &'static str {
        match self {
            AuthError::MissingCredential => "authentication required",
            _ => "invalid or expired credential",
        }
    }
}

/// Verifies handshake credentials against the shared signing secret.
pub struct Authenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl Authenticator {
    pub fn new(secret: &str) -> Self {
        // HS256 only; a token signed with any other algorithm fails
        // validation rather than being downgraded.
        let validation = Validation::new(Algorithm::HS256);
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify the credential presented at connect time.
    ///
    /// `credential` is the raw value the client supplied, conventionally
    /// `"Bearer <jwt>"`. Absence fails before any token parsing runs.
    pub fn verify(&self, credential: Option<&str>) -> Result<Identity, AuthError> {
        let credential = credential.ok_or(AuthError::MissingCredential)?;
        let token = extract_bearer_token(credential)?;

        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                _ => AuthError::Invalid(e.to_string()),
            }
        })?;

        if data.claims.sub.is_empty() {
            return Err(AuthError::Invalid("empty subject claim".to_string()));
        }

        Ok(Identity {
            subject: data.claims.sub,
            email: data.claims.email,
            role: data.claims.role,
        })
    }
}

/// Strip the `Bearer ` scheme from a credential string.
fn extract_bearer_token(credential: &str) -> Result<&str, AuthError> {
    let token = credential
        .strip_prefix("Bearer ")
        .ok_or(AuthError::InvalidScheme)?;
    if token.is_empty() {
        return Err(AuthError::InvalidScheme);
    }
    Ok(token)
}
