//! Provider key-set cache — published-snapshot JWKS caching.
//!
//! # Design
//!
//! The identity provider's signing keys are fetched once and published as an
//! immutable [`KeySetSnapshot`] behind a `parking_lot::RwLock<Arc<_>>`. Hot
//! lookups clone the `Arc` and never touch the network. A lookup that misses
//! (unknown `kid`, or snapshot past its expiry) triggers a refresh through a
//! `tokio::sync::Mutex` gate, so concurrent misses coalesce onto a single
//! in-flight fetch and re-check the snapshot once the first fetch lands.
//!
//! A failed refresh leaves the previous snapshot in place; the error is
//! returned only to the callers that needed the refresh.
//!
//! Snapshot lifetime derives from the provider's `Cache-Control: max-age`
//! response directive, clamped to [10 minutes, 24 hours].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Floor for snapshot lifetime, whatever the provider's cache headers say.
const MIN_KEYSET_TTL: Duration = Duration::from_secs(10 * 60);
/// Ceiling for snapshot lifetime.
const MAX_KEYSET_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Lifetime used when the provider sends no usable cache directive.
const DEFAULT_KEYSET_TTL: Duration = Duration::from_secs(60 * 60);

/// One RSA signing key published by the identity provider.
#[derive(Debug, Clone)]
pub struct ProviderKey {
    /// Key id (`kid`), unique within a snapshot
    pub kid: String,
    /// Declared algorithm, when the provider publishes one
    pub alg: Option<String>,
    /// RSA modulus, base64url without padding
    pub n: String,
    /// RSA public exponent, base64url without padding
    pub e: String,
}

/// An immutable published key-set snapshot.
#[derive(Debug)]
pub struct KeySetSnapshot {
    keys: HashMap<String, ProviderKey>,
    expires_at: Instant,
}

impl KeySetSnapshot {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    fn get(&self, kid: &str) -> Option<&ProviderKey> {
        self.keys.get(kid)
    }
}

/// JWKS wire document.
#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

/// One JWKS entry. Non-RSA or incomplete entries are skipped on ingest.
#[derive(Debug, Deserialize)]
struct Jwk {
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    alg: Option<String>,
    #[serde(rename = "use", default)]
    use_field: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

/// The provider key-set cache.
pub struct KeySetCache {
    url: String,
    http: reqwest::Client,
    snapshot: RwLock<Arc<KeySetSnapshot>>,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl KeySetCache {
    /// Create a cache fetching from `url` with the given per-fetch timeout.
    ///
    /// The initial snapshot is empty and already expired, so the first
    /// lookup fetches.
    pub fn new(url: impl Into<String>, fetch_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build key-set HTTP client: {e}")))?;

        Ok(Self {
            url: url.into(),
            http,
            snapshot: RwLock::new(Arc::new(KeySetSnapshot {
                keys: HashMap::new(),
                expires_at: Instant::now(),
            })),
            refresh_gate: tokio::sync::Mutex::new(()),
        })
    }

    /// Create a cache pre-populated with `keys` and no fetch URL.
    ///
    /// The snapshot never expires; any miss will fail rather than fetch.
    /// Used by tests and by offline tooling.
    #[must_use]
    pub fn preloaded(keys: impl IntoIterator<Item = ProviderKey>) -> Self {
        let keys: HashMap<String, ProviderKey> =
            keys.into_iter().map(|k| (k.kid.clone(), k)).collect();
        Self {
            url: String::new(),
            http: reqwest::Client::new(),
            snapshot: RwLock::new(Arc::new(KeySetSnapshot {
                keys,
                expires_at: Instant::now() + MAX_KEYSET_TTL,
            })),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Look up the provider key for `kid`.
    ///
    /// Serves from the published snapshot when possible. On an unknown `kid`
    /// or an expired snapshot, forces one refresh and retries the lookup
    /// against the new snapshot.
    ///
    /// # Errors
    ///
    /// [`Error::KeySetUnavailable`] when the refresh fails;
    /// [`Error::UnknownKeyId`] when the key is absent from a fresh snapshot.
    pub async fn lookup(&self, kid: &str) -> Result<ProviderKey> {
        let current = Arc::clone(&self.snapshot.read());
        if !current.is_expired() {
            if let Some(key) = current.get(kid) {
                return Ok(key.clone());
            }
        }

        // Miss or stale: refresh behind the single-flight gate.
        let _flight = self.refresh_gate.lock().await;

        // Another caller may have refreshed while we waited.
        let current = Arc::clone(&self.snapshot.read());
        if !current.is_expired() {
            if let Some(key) = current.get(kid) {
                return Ok(key.clone());
            }
            if !self.url.is_empty() {
                // Fresh snapshot without the kid still warrants one forced
                // fetch: the provider may have rotated since we cached.
                let fresh = self.fetch().await?;
                return self.publish_and_get(fresh, kid);
            }
            return Err(Error::UnknownKeyId(kid.to_string()));
        }

        if self.url.is_empty() {
            return Err(Error::KeySetUnavailable(
                "no key-set URL configured".to_string(),
            ));
        }

        let fresh = self.fetch().await?;
        self.publish_and_get(fresh, kid)
    }

    fn publish_and_get(&self, fresh: KeySetSnapshot, kid: &str) -> Result<ProviderKey> {
        let fresh = Arc::new(fresh);
        *self.snapshot.write() = Arc::clone(&fresh);
        fresh
            .get(kid)
            .cloned()
            .ok_or_else(|| Error::UnknownKeyId(kid.to_string()))
    }

    /// Fetch and parse one key-set document. The previous snapshot is left
    /// untouched on failure.
    async fn fetch(&self) -> Result<KeySetSnapshot> {
        debug!(url = %self.url, "Fetching provider key set");

        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::KeySetUnavailable(format!("fetch failed: {e}")))?
            .error_for_status()
            .map_err(|e| Error::KeySetUnavailable(format!("provider returned error: {e}")))?;

        let ttl = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_max_age)
            .map_or(DEFAULT_KEYSET_TTL, |secs| {
                Duration::from_secs(secs).clamp(MIN_KEYSET_TTL, MAX_KEYSET_TTL)
            });

        let document: JwksDocument = response
            .json()
            .await
            .map_err(|e| Error::KeySetUnavailable(format!("malformed key set: {e}")))?;

        let mut keys = HashMap::new();
        for jwk in document.keys {
            if jwk.kty != "RSA" {
                continue;
            }
            if jwk.use_field.as_deref().is_some_and(|u| u != "sig") {
                continue;
            }
            let (Some(kid), Some(n), Some(e)) = (jwk.kid, jwk.n, jwk.e) else {
                warn!("Skipping incomplete JWKS entry");
                continue;
            };
            keys.insert(
                kid.clone(),
                ProviderKey {
                    kid,
                    alg: jwk.alg,
                    n,
                    e,
                },
            );
        }

        if keys.is_empty() {
            return Err(Error::KeySetUnavailable(
                "key set contains no usable RSA signing keys".to_string(),
            ));
        }

        debug!(count = keys.len(), ttl_secs = ttl.as_secs(), "Published key-set snapshot");
        Ok(KeySetSnapshot {
            keys,
            expires_at: Instant::now() + ttl,
        })
    }
}

/// Extract `max-age` seconds from a `Cache-Control` header value.
fn parse_max_age(value: &str) -> Option<u64> {
    value.split(',').find_map(|directive| {
        directive
            .trim()
            .strip_prefix("max-age=")
            .and_then(|secs| secs.parse().ok())
    })
}
