//! The platform key-value cache and the wrappers that keep its failures out of
//! the verification path.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::CacheError;
use crate::helpers::now_millis;

/// A value read back from the platform cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub value: String,
    /// Unix milliseconds.
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheExpiry {
    Ttl(Duration),
    /// Unix milliseconds.
    ExpiresAt(u64),
}

/// Key-value cache provided by the host. Both calls may fail at any time and
/// entries may disappear early.
pub trait PlatformCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<CacheRecord>, CacheError>;

    fn set(&self, key: &str, value: &str, expiry: CacheExpiry) -> Result<(), CacheError>;
}

/// Reads a key; errors and records past their expiry are reported as a miss.
pub(crate) fn safe_get(cache: &dyn PlatformCache, key: &str) -> Option<CacheRecord> {
    match cache.get(key) {
        Ok(Some(record)) => {
            if record.expires_at.is_some_and(|at| at <= now_millis()) {
                tracing::debug!(target: "jwks", key, "ignoring expired cache record");
                None
            } else {
                Some(record)
            }
        }
        Ok(None) => None,
        Err(err) => {
            tracing::debug!(target: "jwks", key, error = %err, "cache read failed");
            None
        }
    }
}

/// Writes a key; a failure is logged and otherwise ignored.
pub(crate) fn safe_set(cache: &dyn PlatformCache, key: &str, value: &str, expiry: CacheExpiry) {
    if let Err(err) = cache.set(key, value, expiry) {
        tracing::info!(target: "jwks", key, error = %err, "cache write failed");
    }
}

/// In-process cache, for hosts without a cache of their own and for tests.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheRecord>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PlatformCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<CacheRecord>, CacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CacheError::Unavailable("cache mutex poisoned".to_string()))?;

        let expired = entries
            .get(key)
            .and_then(|record| record.expires_at)
            .is_some_and(|at| at <= now_millis());
        if expired {
            entries.remove(key);
            return Ok(None);
        }

        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str, expiry: CacheExpiry) -> Result<(), CacheError> {
        let expires_at = match expiry {
            CacheExpiry::Ttl(ttl) => {
                now_millis().saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
            }
            CacheExpiry::ExpiresAt(at) => at,
        };

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CacheError::Unavailable("cache mutex poisoned".to_string()))?;
        entries.insert(
            key.to_string(),
            CacheRecord {
                value: value.to_string(),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }
}
