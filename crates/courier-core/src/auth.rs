//! Socket admission control.
//!
//! The gate verifies an HS256 bearer credential and checks its unique token
//! identifier against a revocation set. Unlike the rate limiter, the
//! revocation check fails closed: if the set is unreachable the credential is
//! rejected, because correctness of access control outweighs availability.
//! Every failure collapses into [`RelayError::Unauthorized`] so no internal
//! detail ever reaches the peer.

use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::RelayError;

/// Purpose a credential must declare to be admitted.
const ACCESS_PURPOSE: &str = "access";

/// Claims carried by a Courier credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject identity.
    pub sub: String,
    /// Declared purpose (`access` or `refresh`).
    #[serde(rename = "type")]
    pub purpose: String,
    /// Unique token identifier, checked against the revocation set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    /// Issued-at, seconds since epoch.
    pub iat: i64,
    /// Expiry, seconds since epoch.
    pub exp: i64,
}

/// The set of token identifiers explicitly invalidated before expiry.
#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Whether a token identifier has been revoked (e.g. by logout).
    async fn is_revoked(&self, token_id: &str) -> Result<bool, RelayError>;
}

/// Verifies credentials and gates socket admission.
pub struct TokenGate {
    decoding_key: DecodingKey,
    revocations: Arc<dyn RevocationStore>,
}

impl TokenGate {
    /// Create a gate over an HS256 secret and a revocation set.
    #[must_use]
    pub fn new(secret: &[u8], revocations: Arc<dyn RevocationStore>) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            revocations,
        }
    }

    /// Authenticate a credential, returning the subject identity.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Unauthorized`] for a bad signature, expired
    /// token, non-`access` purpose, revoked identifier, or a failing
    /// revocation check.
    pub async fn authenticate(&self, credential: &str) -> Result<String, RelayError> {
        let validation = Validation::new(Algorithm::HS256);
        let claims = jsonwebtoken::decode::<Claims>(credential, &self.decoding_key, &validation)
            .map_err(|e| {
                warn!(error = %e, "Credential verification failed");
                RelayError::Unauthorized
            })?
            .claims;

        // A refresh credential is rejected even if otherwise valid.
        if claims.purpose != ACCESS_PURPOSE {
            warn!(purpose = %claims.purpose, "Credential has wrong purpose");
            return Err(RelayError::Unauthorized);
        }

        if let Some(jti) = &claims.jti {
            match self.revocations.is_revoked(jti).await {
                Ok(false) => {}
                Ok(true) => {
                    warn!("Credential is revoked");
                    return Err(RelayError::Unauthorized);
                }
                Err(e) => {
                    // Fail closed on revocation infra faults.
                    warn!(error = %e, "Revocation check failed");
                    return Err(RelayError::Unauthorized);
                }
            }
        }

        if claims.sub.is_empty() {
            return Err(RelayError::Unauthorized);
        }

        Ok(claims.sub)
    }
}

/// Sign claims into a credential.
///
/// Issuance belongs to the auth collaborator; this helper exists so the test
/// suite can mint credentials against a known secret.
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn sign(claims: &Claims, secret: &[u8]) -> Result<String, RelayError> {
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        claims,
        &jsonwebtoken::EncodingKey::from_secret(secret),
    )
    .map_err(|_| RelayError::Unauthorized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRevocationStore;
    use chrono::Utc;

    const SECRET: &[u8] = b"test-secret";

    fn claims(purpose: &str, jti: Option<&str>) -> Claims {
        let now = Utc::now().timestamp();
        Claims {
            sub: "u1".to_string(),
            purpose: purpose.to_string(),
            jti: jti.map(str::to_string),
            iat: now,
            exp: now + 900,
        }
    }

    fn gate(revocations: Arc<MemoryRevocationStore>) -> TokenGate {
        TokenGate::new(SECRET, revocations)
    }

    #[tokio::test]
    async fn test_valid_access_token() {
        let gate = gate(Arc::new(MemoryRevocationStore::new()));
        let token = sign(&claims("access", Some("t1")), SECRET).unwrap();
        assert_eq!(gate.authenticate(&token).await.unwrap(), "u1");
    }

    #[tokio::test]
    async fn test_refresh_purpose_rejected() {
        let gate = gate(Arc::new(MemoryRevocationStore::new()));
        // Valid and unexpired, but declared purpose is refresh.
        let token = sign(&claims("refresh", None), SECRET).unwrap();
        assert!(matches!(
            gate.authenticate(&token).await,
            Err(RelayError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_revoked_token_rejected() {
        let revocations = Arc::new(MemoryRevocationStore::new());
        revocations.revoke("t1");
        let gate = gate(revocations);
        let token = sign(&claims("access", Some("t1")), SECRET).unwrap();
        assert!(matches!(
            gate.authenticate(&token).await,
            Err(RelayError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_revocation_check_fails_closed() {
        struct BrokenStore;

        #[async_trait]
        impl RevocationStore for BrokenStore {
            async fn is_revoked(&self, _token_id: &str) -> Result<bool, RelayError> {
                Err(RelayError::Store("connection refused".to_string()))
            }
        }

        let gate = TokenGate::new(SECRET, Arc::new(BrokenStore));
        let token = sign(&claims("access", Some("t1")), SECRET).unwrap();
        assert!(matches!(
            gate.authenticate(&token).await,
            Err(RelayError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let gate = gate(Arc::new(MemoryRevocationStore::new()));
        let now = Utc::now().timestamp();
        let expired = Claims {
            exp: now - 3600,
            iat: now - 4500,
            ..claims("access", None)
        };
        let token = sign(&expired, SECRET).unwrap();
        assert!(matches!(
            gate.authenticate(&token).await,
            Err(RelayError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let gate = gate(Arc::new(MemoryRevocationStore::new()));
        let token = sign(&claims("access", None), b"other-secret").unwrap();
        assert!(matches!(
            gate.authenticate(&token).await,
            Err(RelayError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_token_without_jti_skips_revocation() {
        // No identifier to check; signature and purpose alone decide.
        let gate = gate(Arc::new(MemoryRevocationStore::new()));
        let token = sign(&claims("access", None), SECRET).unwrap();
        assert_eq!(gate.authenticate(&token).await.unwrap(), "u1");
    }
}
