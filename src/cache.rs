//! Response cache: request fingerprint to reply payload with TTL expiry.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::request::now_ms;

/// Cache fingerprint for a request: the service name followed by the hex
/// SHA-256 digest of the request body.
pub fn fingerprint(service: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("{}{}", service, hex::encode(hasher.finalize()))
}

/// Reply cache capability.
///
/// TTL semantics are expire-at-absolute-time; a negative TTL stores the
/// entry without expiry. Implementations may be backed by anything that can
/// answer a lookup asynchronously.
#[async_trait]
pub trait ResponseCache: Send {
    /// Fetch an unexpired payload for the fingerprint.
    async fn get(&mut self, hash: &str) -> Option<Vec<Bytes>>;

    /// Store a payload under the fingerprint with the given TTL in ms.
    async fn set(&mut self, hash: &str, payload: Vec<Bytes>, ttl_ms: i64);
}

struct Entry {
    payload: Vec<Bytes>,
    /// Epoch ms after which the entry is dead; -1 means never.
    expire_at: i64,
}

/// Process-local response cache with lazy expiry on lookup.
#[derive(Default)]
pub struct MemoryCache {
    entries: HashMap<String, Entry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&mut self, hash: &str) -> Option<Vec<Bytes>> {
        let expired = match self.entries.get(hash) {
            Some(entry) => entry.expire_at >= 0 && now_ms() as i64 >= entry.expire_at,
            None => return None,
        };
        if expired {
            self.entries.remove(hash);
            debug!(hash = %hash, "Cache entry expired");
            return None;
        }
        self.entries.get(hash).map(|e| e.payload.clone())
    }

    async fn set(&mut self, hash: &str, payload: Vec<Bytes>, ttl_ms: i64) {
        let expire_at = if ttl_ms < 0 {
            -1
        } else {
            now_ms() as i64 + ttl_ms
        };
        debug!(hash = %hash, ttl_ms, "Caching reply");
        self.entries.insert(hash.to_string(), Entry { payload, expire_at });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(s: &str) -> Vec<Bytes> {
        vec![Bytes::copy_from_slice(s.as_bytes())]
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let a = fingerprint("sum", b"[1,2]");
        let b = fingerprint("sum", b"[1,2]");
        assert_eq!(a, b);
        assert!(a.starts_with("sum"));
    }

    #[test]
    fn test_fingerprint_varies_by_service_and_body() {
        assert_ne!(fingerprint("sum", b"[1,2]"), fingerprint("mul", b"[1,2]"));
        assert_ne!(fingerprint("sum", b"[1,2]"), fingerprint("sum", b"[1,3]"));
    }

    #[tokio::test]
    async fn test_cache_set_get() {
        let mut cache = MemoryCache::new();
        cache.set("h1", payload("3"), 60_000).await;
        assert_eq!(cache.get("h1").await, Some(payload("3")));
        assert_eq!(cache.get("missing").await, None);
    }

    #[tokio::test]
    async fn test_cache_overwrite_returns_latest() {
        let mut cache = MemoryCache::new();
        cache.set("h1", payload("old"), 60_000).await;
        cache.set("h1", payload("new"), 60_000).await;
        assert_eq!(cache.get("h1").await, Some(payload("new")));
    }

    #[tokio::test]
    async fn test_cache_expired_entry_removed_lazily() {
        let mut cache = MemoryCache::new();
        cache.set("h1", payload("3"), 0).await;
        assert_eq!(cache.get("h1").await, None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_cache_negative_ttl_never_expires() {
        let mut cache = MemoryCache::new();
        cache.set("h1", payload("3"), -1).await;
        assert_eq!(cache.get("h1").await, Some(payload("3")));
    }
}
