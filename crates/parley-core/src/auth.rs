//! Connection authentication.
//!
//! Credentials are compact HS256 JSON Web Tokens signed with a shared
//! secret. The gate checks the algorithm, signature, and expiry, then
//! yields the subject as the connection's [`UserId`].

use crate::ids::UserId;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Reason reported when no credential was presented.
pub const REASON_MISSING: &str = "auth token missing";

/// Reason reported for every other credential failure.
pub const REASON_INVALID: &str = "auth error";

/// Authentication errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No credential was presented.
    #[error("auth token missing")]
    Missing,

    /// Token is not a well-formed JWT.
    #[error("Malformed token: {0}")]
    Malformed(&'static str),

    /// Token header names an algorithm other than HS256.
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Signature does not match.
    #[error("Bad signature")]
    BadSignature,

    /// Token expired.
    #[error("Token expired")]
    Expired,

    /// Subject claim is empty.
    #[error("Invalid subject")]
    InvalidSubject,

    /// The gate was configured with an unusable secret.
    #[error("Invalid secret: {0}")]
    InvalidSecret(&'static str),
}

impl AuthError {
    /// The reason reported to the rejected client.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::Missing => REASON_MISSING,
            _ => REASON_INVALID,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

/// Claims carried by a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User identity.
    #[serde(alias = "userId", alias = "id")]
    pub sub: String,
    /// Expiry, seconds since the Unix epoch.
    pub exp: u64,
    /// Issued-at, seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Verifies credentials presented at connection time.
#[derive(Clone)]
pub struct AuthGate {
    mac: HmacSha256,
    leeway: u64,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("leeway", &self.leeway)
            .finish_non_exhaustive()
    }
}

impl AuthGate {
    /// Create a gate for the given shared secret.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidSecret`] if the secret is empty.
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, AuthError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(AuthError::InvalidSecret("secret must not be empty"));
        }
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|_| AuthError::InvalidSecret("rejected by HMAC"))?;
        Ok(Self { mac, leeway: 0 })
    }

    /// Accept tokens up to `leeway` past their expiry.
    #[must_use]
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway.as_secs();
        self
    }

    /// Authenticate a presented credential.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Missing`] if no token was presented, and
    /// another variant if it fails verification.
    pub fn authenticate(&self, token: Option<&str>) -> Result<UserId, AuthError> {
        let token = token.map(str::trim).filter(|t| !t.is_empty());
        let Some(token) = token else {
            return Err(AuthError::Missing);
        };

        let claims = self.verify(token)?;
        debug!(user = %claims.sub, "Credential accepted");
        Ok(UserId::new(claims.sub))
    }

    /// Verify a token and return its claims.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is malformed, signed with another key
    /// or algorithm, expired, or has an empty subject.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(claims_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed("expected three segments"));
        };

        let header: Header = decode_segment(header_b64)?;
        if header.alg != "HS256" {
            return Err(AuthError::UnsupportedAlgorithm(header.alg));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AuthError::Malformed("signature is not base64url"))?;
        let signing_input = &token[..header_b64.len() + 1 + claims_b64.len()];
        let mut mac = self.mac.clone();
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let claims: Claims = decode_segment(claims_b64)?;
        if claims.exp.saturating_add(self.leeway) <= now_secs() {
            return Err(AuthError::Expired);
        }
        if claims.sub.trim().is_empty() {
            return Err(AuthError::InvalidSubject);
        }

        Ok(claims)
    }

    /// Mint a credential for `user_id` valid for `ttl`.
    #[must_use]
    pub fn issue(&self, user_id: &UserId, ttl: Duration) -> String {
        let now = now_secs();
        self.sign(&Claims {
            sub: user_id.to_string(),
            exp: now.saturating_add(ttl.as_secs()),
            iat: Some(now),
        })
    }

    /// Sign arbitrary claims.
    #[must_use]
    pub fn sign(&self, claims: &Claims) -> String {
        let header = Header {
            alg: "HS256".into(),
            typ: Some("JWT".into()),
        };
        let mut token = format!("{}.{}", encode_segment(&header), encode_segment(claims));
        let mut mac = self.mac.clone();
        mac.update(token.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        token.push('.');
        token.push_str(&signature);
        token
    }
}

fn encode_segment<T: Serialize>(value: &T) -> String {
    // Header and claims are plain structs; serialization cannot fail.
    let json = serde_json::to_vec(value).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

fn decode_segment<T: for<'de> Deserialize<'de>>(segment: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| AuthError::Malformed("segment is not base64url"))?;
    serde_json::from_slice(&bytes).map_err(|_| AuthError::Malformed("segment is not valid JSON"))
}
