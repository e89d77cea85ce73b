use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use mall_types::{FabricError, MethodDescriptor};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// `mall:{service}:{method}:{sha256(request)}`. Equal requests to the same
/// method always produce the same key.
pub fn cache_key(desc: &MethodDescriptor, request: &[u8]) -> String {
    let digest = Sha256::digest(request);
    format!("mall:{}:{}:{}", desc.service, desc.method, hex::encode(digest))
}

/// Shared store of encoded responses.
///
/// Implementations must never return an entry past its ttl.
pub trait ResponseCache: Send + Sync + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Bytes>, FabricError>> + Send;

    fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), FabricError>> + Send;

    /// `false` skips both lookup and store.
    fn enabled(&self) -> bool {
        true
    }
}

/// Caching switched off.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl ResponseCache for NoCache {
    async fn get(&self, _key: &str) -> Result<Option<Bytes>, FabricError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<(), FabricError> {
        Ok(())
    }

    fn enabled(&self) -> bool {
        false
    }
}

/// In-process cache for a single node.
///
/// When full, expired entries are dropped first, then the entry closest to
/// expiry.
pub struct MemCache {
    capacity: usize,
    entries: Mutex<HashMap<String, (Bytes, Instant)>>,
}

impl MemCache {
    pub fn new(capacity: usize) -> Self {
        MemCache { capacity: capacity.max(1), entries: Mutex::new(HashMap::new()) }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl ResponseCache for MemCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, FabricError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), FabricError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity && !entries.contains_key(key) {
            entries.retain(|_, (_, expires_at)| *expires_at > now);
            if entries.len() >= self.capacity {
                let victim = entries
                    .iter()
                    .min_by_key(|(_, (_, expires_at))| *expires_at)
                    .map(|(k, _)| k.clone());
                if let Some(victim) = victim {
                    entries.remove(&victim);
                }
            }
        }
        entries.insert(key.to_string(), (value, now + ttl));
        Ok(())
    }
}

/// Redis-backed cache shared by every gateway replica. Entries expire
/// server-side via `SET .. PX`.
#[derive(Clone)]
pub struct RedisCache {
    conn: redis::aio::ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, FabricError> {
        let client = redis::Client::open(url)
            .map_err(|e| FabricError::Cache(format!("invalid redis url: {e}")))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| FabricError::Cache(format!("connect to redis: {e}")))?;
        tracing::info!(%url, "redis cache connected");
        Ok(RedisCache { conn })
    }
}

impl ResponseCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, FabricError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| FabricError::Cache(e.to_string()))?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), FabricError> {
        let mut conn = self.conn.clone();
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value.as_ref())
            .arg("PX")
            .arg(millis)
            .query_async(&mut conn)
            .await
            .map_err(|e| FabricError::Cache(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic_per_method_and_request() {
        let place = MethodDescriptor::new("order", "PlaceOrder");
        let list = MethodDescriptor::new("order", "ListOrder");

        let a = cache_key(&place, b"\x08\x07");
        assert_eq!(a, cache_key(&place, b"\x08\x07"));
        assert!(a.starts_with("mall:order:PlaceOrder:"));
        assert_eq!(a.len(), "mall:order:PlaceOrder:".len() + 64);

        assert_ne!(a, cache_key(&place, b"\x08\x08"));
        assert_ne!(a, cache_key(&list, b"\x08\x07"));
    }

    #[tokio::test(start_paused = true)]
    async fn mem_cache_never_serves_expired_entries() {
        let cache = MemCache::default();
        cache.set("k", Bytes::from_static(b"v"), Duration::from_secs(300)).await.unwrap();

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn mem_cache_evicts_when_full() {
        let cache = MemCache::new(2);
        cache.set("a", Bytes::from_static(b"1"), Duration::from_secs(10)).await.unwrap();
        cache.set("b", Bytes::from_static(b"2"), Duration::from_secs(60)).await.unwrap();
        cache.set("c", Bytes::from_static(b"3"), Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").await.unwrap(), None);
        assert!(cache.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn no_cache_is_disabled_and_empty() {
        let cache = NoCache;
        assert!(!cache.enabled());
        cache.set("k", Bytes::from_static(b"v"), DEFAULT_CACHE_TTL).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
