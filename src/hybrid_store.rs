//! Two-tier key/value store: a TTL cache in front of a [`DurableStore`].
//!
//! The durable store is the source of truth. Writes go to it first and
//! only then to the cache, so a failed durable write never leaves a value
//! that exists only in memory. Reads check the cache, fall through to the
//! durable store on a miss or expiry, and repopulate the cache with the
//! default TTL.
//!
//! Provider responses use a separate envelope under `cache:{sha256(key)}`
//! whose expiry is persisted with the value, so a restart does not revive
//! stale responses. [`HybridStore::sweep_expired_cached`] deletes the
//! envelopes nobody reads again.
//!
//! [`HybridStore::remember`] / [`HybridStore::recall`] use the in-memory
//! tier alone, for values that must not outlive the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use research_harness_core::index::DurableStore;

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub durable_reads: u64,
    pub entries: usize,
}

#[derive(Serialize, Deserialize)]
struct CachedEnvelope {
    value: String,
    /// Unix epoch milliseconds.
    expires_at: i64,
}

pub struct HybridStore {
    durable: Arc<dyn DurableStore>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    default_ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    durable_reads: AtomicU64,
}

impl HybridStore {
    pub fn new(durable: Arc<dyn DurableStore>, default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            durable,
            cache: RwLock::new(HashMap::new()),
            default_ttl,
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            durable_reads: AtomicU64::new(0),
        }
    }

    pub fn durable(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(value) = self.cache_lookup(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(value));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        self.durable_reads.fetch_add(1, Ordering::Relaxed);
        let value = self
            .durable
            .read(key)
            .await
            .with_context(|| format!("durable read failed for {}", key))?;
        if let Some(v) = &value {
            self.cache_insert(key, v.clone(), self.default_ttl);
        }
        Ok(value)
    }

    /// Write through to durable storage, then cache for `ttl` (default TTL
    /// when `None`).
    pub async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.durable
            .write(key, value)
            .await
            .with_context(|| format!("durable write failed for {}", key))?;
        self.cache_insert(key, value.to_string(), ttl.unwrap_or(self.default_ttl));
        Ok(())
    }

    pub async fn invalidate(&self, key: &str) -> Result<()> {
        self.cache_remove(key);
        self.durable
            .delete(key)
            .await
            .with_context(|| format!("durable delete failed for {}", key))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).with_context(|| format!("corrupt value at {}", key))?,
            )),
            None => Ok(None),
        }
    }

    pub async fn put_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.put(key, &raw, ttl).await
    }

    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.durable.keys(prefix).await
    }

    /// Read an expiring value stored with [`HybridStore::put_cached`].
    pub async fn get_cached(&self, key: &str) -> Result<Option<String>> {
        let envelope_key = cached_key(key);
        if let Some(raw) = self.cache_lookup(&envelope_key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(raw));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        self.durable_reads.fetch_add(1, Ordering::Relaxed);
        let Some(raw) = self.durable.read(&envelope_key).await? else {
            return Ok(None);
        };
        let envelope: CachedEnvelope = match serde_json::from_str(&raw) {
            Ok(e) => e,
            Err(_) => {
                self.durable.delete(&envelope_key).await?;
                return Ok(None);
            }
        };
        let remaining_ms = envelope.expires_at - chrono::Utc::now().timestamp_millis();
        if remaining_ms <= 0 {
            self.durable.delete(&envelope_key).await?;
            return Ok(None);
        }
        self.cache_insert(
            &envelope_key,
            envelope.value.clone(),
            Duration::from_millis(remaining_ms as u64),
        );
        Ok(Some(envelope.value))
    }

    pub async fn put_cached(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let envelope_key = cached_key(key);
        let expires_at = chrono::Utc::now().timestamp_millis()
            + i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2);
        let envelope = CachedEnvelope {
            value: value.to_string(),
            expires_at,
        };
        self.durable
            .write(&envelope_key, &serde_json::to_string(&envelope)?)
            .await?;
        self.cache_insert(&envelope_key, value.to_string(), ttl);
        Ok(())
    }

    /// Delete expired or unreadable `cache:` envelopes from both tiers.
    /// Returns how many durable entries were removed.
    pub async fn sweep_expired_cached(&self) -> Result<usize> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut removed = 0;
        for key in self.durable.keys(CACHED_PREFIX).await? {
            let Some(raw) = self.durable.read(&key).await? else {
                continue;
            };
            let expired = serde_json::from_str::<CachedEnvelope>(&raw)
                .map_or(true, |envelope| envelope.expires_at <= now);
            if expired {
                self.cache_remove(&key);
                self.durable.delete(&key).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "swept expired cache envelopes");
        }
        Ok(removed)
    }

    /// Cache `value` in memory only for `ttl`.
    pub fn remember(&self, key: &str, value: String, ttl: Duration) {
        self.cache_insert(key, value, ttl);
    }

    /// Read a value stored with [`HybridStore::remember`].
    pub fn recall(&self, key: &str) -> Option<String> {
        let value = self.cache_lookup(key);
        let counter = if value.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }

    /// Drop expired cache entries. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let before = cache.len();
        cache.retain(|_, e| e.expires_at > now);
        before - cache.len()
    }

    /// Empty the in-memory tier. Durable data is untouched.
    pub fn clear_cache(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Whether `key` has a live cache entry.
    pub fn cache_contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|e| e.expires_at > now)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            durable_reads: self.durable_reads.load(Ordering::Relaxed),
            entries: self
                .cache
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    fn cache_lookup(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            match cache.get(key) {
                Some(e) if e.expires_at > now => return Some(e.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.cache_remove(key);
        None
    }

    fn cache_insert(&self, key: &str, value: String, ttl: Duration) {
        if ttl.is_zero() {
            self.cache_remove(key);
            return;
        }
        let now = Instant::now();
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if !cache.contains_key(key) && cache.len() >= self.max_entries {
            cache.retain(|_, e| e.expires_at > now);
            if cache.len() >= self.max_entries {
                let oldest = cache
                    .iter()
                    .min_by_key(|(_, e)| e.expires_at)
                    .map(|(k, _)| k.clone());
                if let Some(k) = oldest {
                    cache.remove(&k);
                }
            }
        }
        cache.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    fn cache_remove(&self, key: &str) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

const CACHED_PREFIX: &str = "cache:";

/// `cache:{hex sha256(key)}`.
pub fn cached_key(key: &str) -> String {
    format!("{}{}", CACHED_PREFIX, hex::encode(Sha256::digest(key.as_bytes())))
}
