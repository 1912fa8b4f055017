//! Tiered signing-key cache.
//!
//! Lookups go process memo, in-flight fetch, platform cache, network, in that
//! order. The platform cache is optional in every sense: read failures are
//! misses and write failures are logged.

use futures::future::{BoxFuture, FutureExt, Shared};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use url::Url;

use crate::cache::{CacheExpiry, PlatformCache, safe_get, safe_set};
use crate::error::{JwksError, VerifyError};
use crate::helpers::{issuer_host, now_millis};

pub const DEFAULT_JWKS_TTL: Duration = Duration::from_secs(600);
pub const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const JWKS_PATH: &str = ".well-known/jwks.json";
const LOG_TARGET: &str = "jwks";

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    kty: String,
    #[serde(default)]
    alg: Option<String>,
    #[serde(default, rename = "use")]
    key_use: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Clone)]
struct ResolvedKey {
    kid: Option<String>,
    alg: Option<String>,
    key: DecodingKey,
}

impl ResolvedKey {
    fn matches(&self, kid: Option<&str>, alg: Algorithm) -> bool {
        if let Some(kid) = kid
            && self.kid.as_deref() != Some(kid)
        {
            return false;
        }

        match self.alg.as_deref() {
            Some(declared) => Algorithm::from_str(declared).is_ok_and(|a| a == alg),
            None => true,
        }
    }
}

/// Verification keys of one issuer, ready for signature checks.
#[derive(Clone)]
pub struct KeyResolver {
    keys: Vec<ResolvedKey>,
    updated_at: u64,
}

impl KeyResolver {
    /// Builds a resolver from a JWKS document. Only RSA signing keys are kept.
    pub fn from_jwks(document: &Value, updated_at: u64) -> Result<Self, JwksError> {
        let entries = document
            .get("keys")
            .and_then(Value::as_array)
            .ok_or_else(|| JwksError::Malformed("missing keys array".to_string()))?;

        let mut keys = Vec::with_capacity(entries.len());
        for entry in entries {
            let Ok(jwk) = serde_json::from_value::<Jwk>(entry.clone()) else {
                continue;
            };
            if jwk.kty != "RSA" {
                continue;
            }
            if let Some(u) = jwk.key_use.as_deref()
                && u != "sig"
            {
                continue;
            }
            let (Some(n), Some(e)) = (jwk.n.as_deref(), jwk.e.as_deref()) else {
                continue;
            };
            match DecodingKey::from_rsa_components(n, e) {
                Ok(key) => keys.push(ResolvedKey {
                    kid: jwk.kid,
                    alg: jwk.alg,
                    key,
                }),
                Err(err) => {
                    tracing::debug!(target: LOG_TARGET, kid = ?jwk.kid, error = %err, "skipping unusable jwk");
                }
            }
        }

        Ok(Self { keys, updated_at })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn updated_at(&self) -> u64 {
        self.updated_at
    }

    /// Picks the single key matching a token header.
    pub fn select(&self, kid: Option<&str>, alg: Algorithm) -> Result<&DecodingKey, VerifyError> {
        let mut candidates = self.keys.iter().filter(|k| k.matches(kid, alg));
        let owned_kid = || kid.map(str::to_string);

        match (candidates.next(), candidates.next()) {
            (Some(key), None) => Ok(&key.key),
            (None, _) => Err(VerifyError::KeyNotFound { kid: owned_kid() }),
            (Some(_), Some(_)) => Err(VerifyError::KeyAmbiguous { kid: owned_kid() }),
        }
    }
}

impl fmt::Debug for KeyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyResolver")
            .field("kids", &self.keys.iter().map(|k| &k.kid).collect::<Vec<_>>())
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// What the platform cache holds for one issuer.
#[derive(Debug, Serialize, Deserialize)]
struct CachedKeySet {
    jwks: Value,
    updated_at: u64,
}

struct MemoEntry {
    resolver: Arc<KeyResolver>,
    expires_at: u64,
}

#[derive(Clone)]
struct FetchedKeySet {
    resolver: Arc<KeyResolver>,
    record: String,
}

type KeyFetch = Shared<BoxFuture<'static, Result<FetchedKeySet, JwksError>>>;

#[derive(Default)]
struct Tiers {
    memo: Mutex<HashMap<String, MemoEntry>>,
    in_flight: Mutex<HashMap<String, KeyFetch>>,
    marker: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Tiers {
    fn memoized(&self, host: &str) -> Option<Arc<KeyResolver>> {
        let now = now_millis();
        let mut memo = lock(&self.memo);
        match memo.get(host) {
            Some(entry) if entry.expires_at > now => Some(entry.resolver.clone()),
            Some(_) => {
                memo.remove(host);
                None
            }
            None => None,
        }
    }

    fn remember(&self, host: &str, resolver: Arc<KeyResolver>, ttl_ms: u64) {
        lock(&self.memo).insert(
            host.to_string(),
            MemoEntry {
                resolver,
                expires_at: now_millis().saturating_add(ttl_ms),
            },
        );
    }

    fn forget(&self, host: &str) {
        lock(&self.memo).remove(host);
    }

    fn pending(&self, host: &str) -> Option<KeyFetch> {
        lock(&self.in_flight).get(host).cloned()
    }

    /// Strictly increasing per process, never behind wall clock.
    fn next_marker(&self) -> u64 {
        let now = now_millis();
        let prev = self
            .marker
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev.saturating_add(1)))
            })
            .unwrap_or(now);
        now.max(prev.saturating_add(1))
    }

    fn observe_marker(&self, seen: u64) {
        self.marker.fetch_max(seen, Ordering::SeqCst);
    }
}

/// Process-wide JWKS cache, shared by every invocation on a warm instance.
pub struct JwksCacheManager {
    http: reqwest::Client,
    ttl: Duration,
    tiers: Arc<Tiers>,
}

impl JwksCacheManager {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_ttl(http, DEFAULT_JWKS_TTL)
    }

    pub fn with_ttl(http: reqwest::Client, ttl: Duration) -> Self {
        Self {
            http,
            ttl,
            tiers: Arc::new(Tiers::default()),
        }
    }

    pub fn cache_key(issuer: &Url) -> String {
        format!("jwksset:{}", issuer_host(issuer))
    }

    fn ttl_ms(&self) -> u64 {
        u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX)
    }

    /// Resolves the issuer's signing keys. `force_refresh` skips the memo and
    /// platform tiers but still joins a fetch already running for the host.
    pub async fn get_verification_keys(
        &self,
        issuer: &Url,
        cache: &dyn PlatformCache,
        force_refresh: bool,
    ) -> Result<Arc<KeyResolver>, JwksError> {
        let host = issuer_host(issuer);
        let cache_key = Self::cache_key(issuer);

        if force_refresh {
            self.tiers.forget(&host);
        } else {
            if let Some(resolver) = self.tiers.memoized(&host) {
                return Ok(resolver);
            }
            if let Some(pending) = self.tiers.pending(&host) {
                tracing::debug!(target: LOG_TARGET, host = %host, "joining in-flight jwks fetch");
                return pending.await.map(|fetched| fetched.resolver);
            }
            if let Some(resolver) = self.promote_from_platform(&host, &cache_key, cache) {
                return Ok(resolver);
            }
        }

        let (fetch, leader) = self.join_or_start(&host, issuer)?;
        let fetched = fetch.await?;
        if leader {
            safe_set(cache, &cache_key, &fetched.record, CacheExpiry::Ttl(self.ttl));
        }
        Ok(fetched.resolver)
    }

    fn promote_from_platform(
        &self,
        host: &str,
        cache_key: &str,
        cache: &dyn PlatformCache,
    ) -> Option<Arc<KeyResolver>> {
        let record = safe_get(cache, cache_key)?;

        let parsed = serde_json::from_str::<CachedKeySet>(&record.value)
            .map_err(|e| JwksError::Malformed(e.to_string()))
            .and_then(|cached| KeyResolver::from_jwks(&cached.jwks, cached.updated_at));
        let resolver = match parsed {
            Ok(resolver) => Arc::new(resolver),
            Err(err) => {
                tracing::debug!(target: LOG_TARGET, host, error = %err, "discarding unreadable cached jwks");
                return None;
            }
        };

        let hint = record
            .expires_at
            .map(|at| at.saturating_sub(now_millis()))
            .filter(|remaining| *remaining > 0);
        let local_ttl = hint.map_or(self.ttl_ms(), |h| h.min(self.ttl_ms()));

        self.tiers.observe_marker(resolver.updated_at());
        self.tiers.remember(host, resolver.clone(), local_ttl);
        tracing::debug!(target: LOG_TARGET, host, ttl_ms = local_ttl, "promoted jwks from platform cache");
        Some(resolver)
    }

    fn join_or_start(&self, host: &str, issuer: &Url) -> Result<(KeyFetch, bool), JwksError> {
        let mut in_flight = lock(&self.tiers.in_flight);
        if let Some(existing) = in_flight.get(host) {
            return Ok((existing.clone(), false));
        }

        let url = issuer
            .join(JWKS_PATH)
            .map_err(|e| JwksError::Fetch(format!("invalid jwks url: {e}")))?;
        let fetch = fetch_and_memoize(
            self.http.clone(),
            url,
            host.to_string(),
            self.ttl_ms(),
            self.tiers.clone(),
        )
        .boxed()
        .shared();

        in_flight.insert(host.to_string(), fetch.clone());
        Ok((fetch, true))
    }
}

async fn fetch_and_memoize(
    http: reqwest::Client,
    url: Url,
    host: String,
    ttl_ms: u64,
    tiers: Arc<Tiers>,
) -> Result<FetchedKeySet, JwksError> {
    let result = fetch_key_set(&http, url).await.and_then(|document| {
        let updated_at = tiers.next_marker();
        let resolver = Arc::new(KeyResolver::from_jwks(&document, updated_at)?);
        let record = serde_json::to_string(&CachedKeySet {
            jwks: document,
            updated_at,
        })
        .map_err(|e| JwksError::Malformed(e.to_string()))?;
        Ok(FetchedKeySet { resolver, record })
    });

    if let Ok(fetched) = &result {
        tiers.remember(&host, fetched.resolver.clone(), ttl_ms);
        tracing::info!(target: LOG_TARGET, host = %host, keys = fetched.resolver.len(), "fetched jwks");
    }
    lock(&tiers.in_flight).remove(&host);
    result
}

async fn fetch_key_set(http: &reqwest::Client, url: Url) -> Result<Value, JwksError> {
    let response = http
        .get(url)
        .timeout(JWKS_FETCH_TIMEOUT)
        .send()
        .await
        .map_err(|e| JwksError::Fetch(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(JwksError::Status(status.as_u16()));
    }

    let document: Value = response
        .json()
        .await
        .map_err(|e| JwksError::Malformed(e.to_string()))?;
    if !document.get("keys").is_some_and(Value::is_array) {
        return Err(JwksError::Malformed("missing keys array".to_string()));
    }

    Ok(document)
}
