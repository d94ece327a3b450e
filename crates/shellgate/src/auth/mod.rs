//! Credential validation.
//!
//! Validation is deliberately asymmetric: only structurally-JWT-shaped
//! tokens are run through signature/expiry checks. Opaque API keys pass
//! structural validation only; their real validity is proven downstream
//! by whether the provisioned environment can use them.

mod claims;

pub use claims::Claims;

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use log::warn;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::ws::protocol::Credentials;

/// Maximum accepted length for any single credential string.
const MAX_CREDENTIAL_LEN: usize = 8192;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credentials provided")]
    MissingCredentials,

    #[error("token expired")]
    TokenExpired,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("credential exceeds maximum length")]
    CredentialTooLong,

    #[error("credentials do not match prior session")]
    CredentialMismatch,

    #[error("internal auth error: {0}")]
    Internal(String),
}

/// Validator configuration, loaded from the `[auth]` config table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret for access-token validation. `env:VAR` resolves
    /// from the environment at startup.
    pub jwt_secret: Option<String>,
}

impl AuthConfig {
    /// Resolve `env:VAR_NAME` syntax in `jwt_secret`.
    pub fn resolve_jwt_secret(&self) -> Option<String> {
        let secret = self.jwt_secret.as_ref()?;
        if let Some(var) = secret.strip_prefix("env:") {
            std::env::var(var).ok()
        } else {
            Some(secret.clone())
        }
    }
}

/// Stateless credential validator.
#[derive(Clone)]
pub struct CredentialValidator {
    decoding_key: Option<DecodingKey>,
}

impl CredentialValidator {
    pub fn new(config: &AuthConfig) -> Self {
        let decoding_key = config
            .resolve_jwt_secret()
            .map(|s| DecodingKey::from_secret(s.as_bytes()));
        Self { decoding_key }
    }

    /// Validate the presented credentials for a fresh session.
    ///
    /// At least one credential form must be present. A JWT-shaped
    /// access token is validated for signature and expiry; everything
    /// else only has to be structurally sane.
    pub fn validate(&self, credentials: &Credentials) -> Result<(), AuthError> {
        if credentials.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        if let Some(ref key) = credentials.api_key {
            if key.is_empty() {
                return Err(AuthError::InvalidToken("empty api key".to_string()));
            }
            if key.len() > MAX_CREDENTIAL_LEN {
                return Err(AuthError::CredentialTooLong);
            }
        }

        if let Some(ref token) = credentials.access_token {
            if token.len() > MAX_CREDENTIAL_LEN {
                return Err(AuthError::CredentialTooLong);
            }
            if is_jwt_shaped(token) {
                self.validate_token(token)?;
            }
        }

        Ok(())
    }

    /// Validate a JWT access token against the configured secret.
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let decoding_key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear(); // Allow missing iss/aud

        let token_data = decode::<Claims>(token, decoding_key, &validation).map_err(|e| {
            warn!("JWT validation failed: {:?}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        Ok(token_data.claims)
    }
}

/// Whether a credential looks like a JWT: exactly three non-empty
/// dot-separated segments.
pub fn is_jwt_shaped(token: &str) -> bool {
    let mut segments = token.split('.');
    let shaped = segments.by_ref().take(3).filter(|s| !s.is_empty()).count() == 3;
    shaped && segments.next().is_none()
}

/// Deterministic digest of the credential material.
///
/// Used as the sole gate authorizing resume of an existing session, so
/// it must be stable across connections presenting the same material.
pub fn credential_hash(credentials: &Credentials) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credentials.api_key.as_deref().unwrap_or(""));
    hasher.update(b"\n");
    hasher.update(credentials.access_token.as_deref().unwrap_or(""));
    hex::encode(hasher.finalize())
}

/// Constant-time string comparison.
///
/// The credential hash works as a shared secret on the resume path, so
/// the comparison must not leak a timing oracle.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
