use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use mall_types::{FabricError, LeaseId};

use crate::traits::RegistryStore;

struct LeaseRecord {
    ttl: Duration,
    expires_at: Instant,
}

struct MemInner {
    next_lease: LeaseId,
    leases: HashMap<LeaseId, LeaseRecord>,
    /// key → (value, owning lease)
    data: BTreeMap<String, (String, LeaseId)>,
}

impl MemInner {
    fn lease_live(&self, lease: LeaseId, now: Instant) -> bool {
        self.leases.get(&lease).map(|l| l.expires_at > now).unwrap_or(false)
    }

    fn drop_lease(&mut self, lease: LeaseId) -> usize {
        self.leases.remove(&lease);
        let before = self.data.len();
        self.data.retain(|_, (_, owner)| *owner != lease);
        before - self.data.len()
    }
}

/// In-memory `RegistryStore` with lease expiry on the tokio clock.
///
/// Expired registrations are never returned, even before the
/// [`LeaseReaper`](crate::LeaseReaper) has swept them.
pub struct MemRegistryStore {
    inner: Arc<RwLock<MemInner>>,
}

impl MemRegistryStore {
    pub fn new() -> Self {
        MemRegistryStore {
            inner: Arc::new(RwLock::new(MemInner {
                next_lease: 1,
                leases: HashMap::new(),
                data: BTreeMap::new(),
            })),
        }
    }

    /// Remove every expired lease and the keys bound to it. Returns the number
    /// of keys removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut g = self.inner.write().await;
        let expired: Vec<LeaseId> = g
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.into_iter().map(|id| g.drop_lease(id)).sum()
    }

    /// Number of leases currently held, expired or not.
    pub async fn lease_count(&self) -> usize {
        self.inner.read().await.leases.len()
    }
}

impl Default for MemRegistryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryStore for MemRegistryStore {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, FabricError> {
        let mut g = self.inner.write().await;
        let id = g.next_lease;
        g.next_lease += 1;
        g.leases.insert(id, LeaseRecord { ttl, expires_at: Instant::now() + ttl });
        Ok(id)
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<(), FabricError> {
        let mut g = self.inner.write().await;
        if !g.lease_live(lease, Instant::now()) {
            return Err(FabricError::NotFound(format!("lease {lease}")));
        }
        g.data.insert(key.to_string(), (value.to_string(), lease));
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration, FabricError> {
        let now = Instant::now();
        let mut g = self.inner.write().await;
        match g.leases.get_mut(&lease) {
            Some(record) if record.expires_at > now => {
                record.expires_at = now + record.ttl;
                Ok(record.ttl)
            }
            Some(_) => {
                g.drop_lease(lease);
                Err(FabricError::NotFound(format!("lease {lease} expired")))
            }
            None => Err(FabricError::NotFound(format!("lease {lease}"))),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, FabricError> {
        let now = Instant::now();
        let g = self.inner.read().await;
        Ok(g.data
            .get(key)
            .filter(|(_, lease)| g.lease_live(*lease, now))
            .map(|(value, _)| value.clone()))
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), FabricError> {
        let mut g = self.inner.write().await;
        if !g.leases.contains_key(&lease) {
            return Err(FabricError::NotFound(format!("lease {lease}")));
        }
        g.drop_lease(lease);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn put_and_get_under_live_lease() {
        let store = MemRegistryStore::new();
        let lease = store.grant(Duration::from_secs(10)).await.unwrap();
        store.put("/services/orders", "10.0.0.5:7001", lease).await.unwrap();

        let addr = store.get("/services/orders").await.unwrap();
        assert_eq!(addr.as_deref(), Some("10.0.0.5:7001"));
    }

    #[tokio::test(start_paused = true)]
    async fn key_vanishes_when_lease_lapses() {
        let store = MemRegistryStore::new();
        let lease = store.grant(Duration::from_secs(10)).await.unwrap();
        store.put("/services/orders", "10.0.0.5:7001", lease).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(store.get("/services/orders").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_extends_expiry() {
        let store = MemRegistryStore::new();
        let lease = store.grant(Duration::from_secs(10)).await.unwrap();
        store.put("/services/cart", "cart:50051", lease).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.keep_alive(lease).await.unwrap(), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.get("/services/cart").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_on_expired_lease_fails() {
        let store = MemRegistryStore::new();
        let lease = store.grant(Duration::from_secs(2)).await.unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        let err = store.keep_alive(lease).await.unwrap_err();
        assert!(matches!(err, FabricError::NotFound(_)));
        assert_eq!(store.lease_count().await, 0);
    }

    #[tokio::test]
    async fn put_requires_existing_lease() {
        let store = MemRegistryStore::new();
        let err = store.put("/services/x", "x:1", 42).await.unwrap_err();
        assert!(matches!(err, FabricError::NotFound(_)));
    }

    #[tokio::test]
    async fn revoke_removes_bound_keys_only() {
        let store = MemRegistryStore::new();
        let a = store.grant(Duration::from_secs(30)).await.unwrap();
        let b = store.grant(Duration::from_secs(30)).await.unwrap();
        store.put("/services/a", "a:1", a).await.unwrap();
        store.put("/services/b", "b:1", b).await.unwrap();

        store.revoke(a).await.unwrap();
        assert!(store.get("/services/a").await.unwrap().is_none());
        assert!(store.get("/services/b").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_sweeps_only_expired_leases() {
        let store = MemRegistryStore::new();
        let short = store.grant(Duration::from_secs(1)).await.unwrap();
        let long = store.grant(Duration::from_secs(60)).await.unwrap();
        store.put("/services/short", "s:1", short).await.unwrap();
        store.put("/services/long", "l:1", long).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.lease_count().await, 1);
    }
}
