//! ID token verification — offline validation of provider-signed assertions.
//!
//! # Verification flow
//!
//! 1. Split the compact token; exactly three base64url segments.
//! 2. Decode the header; `alg` must be in the RSA-SHA2 allow-list (`none`
//!    and the HMAC family are rejected before any key lookup).
//! 3. Resolve the signing key by `kid` through the [`KeySetCache`] (which
//!    forces one refresh on an unknown `kid`).
//! 4. Verify the signature over the first two segments exactly as received;
//!    the signing input is never re-encoded.
//! 5. Enforce every claim: issuer, audience (string or array form), expiry,
//!    issue time, hosted domain, `email_verified`, and a non-empty email.
//!
//! A token whose `iat` lies in the future yields the dedicated
//! [`Error::ClockSkew`] so callers can retry after the clock catches up —
//! the condition is detected structurally, never by matching error text.
//! Every other failure is terminal for the request.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use tracing::debug;

use super::keyset::KeySetCache;
use crate::{Error, Result};

/// Issuer values the provider is known to publish.
const ACCEPTED_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];

/// Pause between clock-skew retries.
const CLOCK_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Identity extracted from a fully validated ID token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    /// Email address, lowercased and trimmed
    pub email: String,
    /// Hosted domain that vouched for the subject
    pub hosted_domain: String,
}

/// Compact token header.
#[derive(Debug, Deserialize)]
struct TokenHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

/// Claims the verifier enforces. Everything else in the payload is ignored.
#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    aud: serde_json::Value,
    #[serde(default)]
    exp: Option<u64>,
    #[serde(default)]
    iat: Option<u64>,
    #[serde(default)]
    hd: Option<String>,
    #[serde(default)]
    email_verified: serde_json::Value,
    #[serde(default)]
    email: Option<String>,
}

/// The ID token verifier. Holds only a handle to the key-set cache.
pub struct TokenVerifier {
    keys: Arc<KeySetCache>,
}

impl TokenVerifier {
    /// Create a verifier backed by `keys`.
    #[must_use]
    pub fn new(keys: Arc<KeySetCache>) -> Self {
        Self { keys }
    }

    /// Verify `token` and return the normalized identity.
    ///
    /// # Errors
    ///
    /// [`Error::ClockSkew`] when the only problem is an `iat` in the future;
    /// [`Error::KeySetUnavailable`] / [`Error::UnknownKeyId`] from the key
    /// lookup; [`Error::TokenInvalid`] for every other validation failure.
    pub async fn verify(
        &self,
        token: &str,
        expected_audience: &str,
        expected_hosted_domain: &str,
    ) -> Result<VerifiedIdentity> {
        let segments: Vec<&str> = token.split('.').collect();
        let [header_b64, payload_b64, signature_b64] = segments.as_slice() else {
            return Err(Error::TokenInvalid(
                "expected exactly three token segments".to_string(),
            ));
        };

        let header: TokenHeader = decode_segment(header_b64, "header")?;
        let algorithm = approved_algorithm(&header.alg)?;
        let kid = header
            .kid
            .ok_or_else(|| Error::TokenInvalid("missing kid in token header".to_string()))?;

        let provider_key = self.keys.lookup(&kid).await?;
        if let Some(ref key_alg) = provider_key.alg {
            if key_alg != &header.alg {
                return Err(Error::TokenInvalid(format!(
                    "token alg {} does not match signing key alg {key_alg}",
                    header.alg
                )));
            }
        }

        let decoding_key =
            DecodingKey::from_rsa_components(&provider_key.n, &provider_key.e).map_err(|e| {
                Error::KeySetUnavailable(format!("provider key {kid} unusable: {e}"))
            })?;

        // The signing input is the first two segments exactly as received.
        let signing_input_len = header_b64.len() + 1 + payload_b64.len();
        let signing_input = &token[..signing_input_len];
        let valid =
            jsonwebtoken::crypto::verify(signature_b64, signing_input.as_bytes(), &decoding_key, algorithm)
                .map_err(|e| Error::TokenInvalid(format!("signature check failed: {e}")))?;
        if !valid {
            return Err(Error::TokenInvalid("signature mismatch".to_string()));
        }

        let claims: TokenClaims = decode_segment(payload_b64, "payload")?;
        let identity = enforce_claims(&claims, expected_audience, expected_hosted_domain)?;

        debug!(email = %identity.email, "ID token verified");
        Ok(identity)
    }

    /// Verify with a bounded retry for clock skew.
    ///
    /// Retries up to `retries` times with one-second pauses, when and only
    /// when the failure is [`Error::ClockSkew`]. All other errors return
    /// immediately.
    pub async fn verify_with_clock_retry(
        &self,
        token: &str,
        expected_audience: &str,
        expected_hosted_domain: &str,
        retries: u32,
    ) -> Result<VerifiedIdentity> {
        let mut attempts = 0;
        loop {
            match self
                .verify(token, expected_audience, expected_hosted_domain)
                .await
            {
                Err(e) if e.is_clock_skew() && attempts < retries => {
                    attempts += 1;
                    debug!(attempt = attempts, "Token from the future; pausing before retry");
                    tokio::time::sleep(CLOCK_RETRY_PAUSE).await;
                }
                other => return other,
            }
        }
    }
}

/// Base64url-decode and deserialize one token segment.
fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str, what: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| Error::TokenInvalid(format!("{what} is not base64url")))?;
    serde_json::from_slice(&bytes)
        .map_err(|_| Error::TokenInvalid(format!("{what} is not valid JSON")))
}

/// Map the header `alg` onto the approved RSA-SHA2 set.
fn approved_algorithm(alg: &str) -> Result<Algorithm> {
    match alg {
        "RS256" => Ok(Algorithm::RS256),
        "RS384" => Ok(Algorithm::RS384),
        "RS512" => Ok(Algorithm::RS512),
        other => Err(Error::TokenInvalid(format!(
            "algorithm {other:?} is not allowed"
        ))),
    }
}

/// Enforce every payload claim and return the normalized identity.
fn enforce_claims(
    claims: &TokenClaims,
    expected_audience: &str,
    expected_hosted_domain: &str,
) -> Result<VerifiedIdentity> {
    let iss = claims
        .iss
        .as_deref()
        .ok_or_else(|| Error::TokenInvalid("missing iss claim".to_string()))?;
    if !ACCEPTED_ISSUERS.contains(&iss) {
        return Err(Error::TokenInvalid(format!("unexpected issuer {iss:?}")));
    }

    if !audience_matches(&claims.aud, expected_audience) {
        return Err(Error::TokenInvalid("audience mismatch".to_string()));
    }

    let now = unix_now();

    let exp = claims
        .exp
        .ok_or_else(|| Error::TokenInvalid("missing exp claim".to_string()))?;
    if exp <= now {
        return Err(Error::TokenInvalid("token expired".to_string()));
    }

    let iat = claims
        .iat
        .ok_or_else(|| Error::TokenInvalid("missing iat claim".to_string()))?;
    if iat > now {
        // Not invalid as such: the provider's clock is ahead of ours. The
        // caller decides whether to wait it out.
        return Err(Error::ClockSkew(iat - now));
    }

    let hd = claims.hd.as_deref().unwrap_or_default();
    if hd != expected_hosted_domain {
        return Err(Error::TokenInvalid(format!("hosted domain {hd:?} not accepted")));
    }

    if !verified_flag_is_true(&claims.email_verified) {
        return Err(Error::TokenInvalid("email not verified".to_string()));
    }

    let email = claims.email.as_deref().unwrap_or_default().trim();
    if email.is_empty() {
        return Err(Error::TokenInvalid("missing email claim".to_string()));
    }

    Ok(VerifiedIdentity {
        email: email.to_lowercase(),
        hosted_domain: hd.to_string(),
    })
}

/// `aud` may be a single string or an array containing the expected value.
fn audience_matches(aud: &serde_json::Value, expected: &str) -> bool {
    match aud {
        serde_json::Value::String(s) => s == expected,
        serde_json::Value::Array(entries) => entries
            .iter()
            .any(|v| v.as_str().is_some_and(|s| s == expected)),
        _ => false,
    }
}

/// The provider encodes `email_verified` as a boolean or as `"true"`.
fn verified_flag_is_true(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => s == "true",
        _ => false,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
