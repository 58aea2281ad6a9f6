//! Credential verification
//!
//! Validates the bearer JWT presented on a stream upgrade and extracts the
//! caller's identity. Verification is pure: the only state is the signing
//! key material supplied at construction. The internal failure taxonomy
//! (malformed, expired, bad signature, missing claim) is logged for
//! diagnostics but collapses to one opaque failure at the call boundary so
//! nothing about why a credential failed leaks to the remote peer.

use crate::config::AuthConfig;
use crate::error::{Error, Result};
use crate::protocol::Identity;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// JWT claims carried by a stream credential
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user identity
    pub sub: String,
    /// Issued-at timestamp
    pub iat: i64,
    /// Expiration timestamp
    pub exp: i64,
    /// Audience, when the deployment scopes tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// Opaque verification failure
///
/// Carries no detail by design; the peer only ever observes the
/// `unauthorized` closure code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationFailure;

impl std::fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "credential verification failed")
    }
}

impl std::error::Error for VerificationFailure {}

/// Verifies stream credentials against configured key material
pub struct TokenVerifier {
    algorithm: Algorithm,
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
    audience: Option<String>,
}

impl TokenVerifier {
    /// Create a verifier from configuration
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let secret = config.secret.resolve()?;
        let algorithm: Algorithm = config
            .algorithm
            .parse()
            .map_err(|_| Error::Config(format!("unknown JWT algorithm: {}", config.algorithm)))?;

        let mut validation = Validation::new(algorithm);
        validation.leeway = config.leeway_secs;
        validation.set_required_spec_claims(&["exp"]);
        if let Some(audience) = &config.audience {
            validation.set_audience(&[audience]);
        }

        Ok(Self {
            algorithm,
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation,
            audience: config.audience.clone(),
        })
    }

    /// Create an HS256 verifier from a raw secret
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        Self {
            algorithm: Algorithm::HS256,
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation,
            audience: None,
        }
    }

    /// Verify a credential and extract the identity it claims
    pub fn verify(&self, credential: &str) -> std::result::Result<Identity, VerificationFailure> {
        // Tolerate clients passing the header value verbatim
        let token = credential.strip_prefix("Bearer ").unwrap_or(credential);

        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            tracing::warn!(reason = classify(&e), "Credential rejected");
            VerificationFailure
        })?;

        if data.claims.sub.is_empty() {
            tracing::warn!(reason = "missing subject claim", "Credential rejected");
            return Err(VerificationFailure);
        }

        Ok(Identity::new(data.claims.sub))
    }

    /// Mint a signed credential for an identity
    ///
    /// Used by the `token` CLI subcommand for local development; issuance
    /// proper lives outside the gateway.
    pub fn mint(&self, identity: &Identity, ttl_secs: i64) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: identity.as_str().to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(ttl_secs)).timestamp(),
            aud: self.audience.clone(),
        };

        encode(&Header::new(self.algorithm), &claims, &self.encoding)
            .map_err(|e| Error::Auth(format!("failed to sign token: {}", e)))
    }
}

/// Map a decode error onto the diagnostic taxonomy
fn classify(error: &jsonwebtoken::errors::Error) -> &'static str {
    use jsonwebtoken::errors::ErrorKind;

    match error.kind() {
        ErrorKind::ExpiredSignature => "expired",
        ErrorKind::InvalidSignature => "bad signature",
        ErrorKind::InvalidAudience => "wrong audience",
        ErrorKind::MissingRequiredClaim(_) => "missing claim",
        ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
            "malformed"
        }
        _ => "invalid",
    }
}
