use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use mall_types::{FabricError, LeaseId};

use crate::keys::service_key;
use crate::traits::RegistryStore;

/// A live registration. Owns the single renewal task spawned for it.
#[derive(Debug)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl: Duration,
    service: String,
    cancel: CancellationToken,
    renewal: JoinHandle<()>,
}

impl Lease {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// `false` once the renewal loop has stopped, either deliberately or
    /// because a renewal failed.
    pub fn is_renewing(&self) -> bool {
        !self.renewal.is_finished()
    }
}

/// Registers this process under `/services/{name}` and resolves peers.
pub struct RegistryClient<S> {
    store: Arc<S>,
}

impl<S> Clone for RegistryClient<S> {
    fn clone(&self) -> Self {
        RegistryClient { store: self.store.clone() }
    }
}

impl<S: RegistryStore> RegistryClient<S> {
    pub fn new(store: Arc<S>) -> Self {
        RegistryClient { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Grant a lease, bind `name → address` to it, and start renewing every
    /// `ttl / 2`.
    pub async fn register(
        &self,
        name: &str,
        address: &str,
        ttl: Duration,
    ) -> Result<Lease, FabricError> {
        if ttl.is_zero() {
            return Err(FabricError::Registration("lease ttl must be positive".into()));
        }
        let id = self
            .store
            .grant(ttl)
            .await
            .map_err(|e| FabricError::Registration(format!("grant for {name}: {e}")))?;
        self.store
            .put(&service_key(name), address, id)
            .await
            .map_err(|e| FabricError::Registration(format!("put for {name}: {e}")))?;

        let cancel = CancellationToken::new();
        let renewal = tokio::spawn(renew(
            self.store.clone(),
            name.to_string(),
            id,
            ttl,
            cancel.clone(),
        ));
        tracing::info!(
            service = name,
            %address,
            lease = id,
            ttl_ms = ttl.as_millis() as u64,
            "service registered"
        );

        Ok(Lease { id, ttl, service: name.to_string(), cancel, renewal })
    }

    /// Stop renewing and revoke the lease so the address disappears now
    /// rather than at expiry.
    pub async fn deregister(&self, lease: Lease) -> Result<(), FabricError> {
        lease.cancel.cancel();
        let _ = lease.renewal.await;
        match self.store.revoke(lease.id).await {
            Ok(()) | Err(FabricError::NotFound(_)) => {
                tracing::info!(service = %lease.service, lease = lease.id, "service deregistered");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// One-shot lookup of a live registration. Not cached.
    pub async fn resolve(&self, name: &str) -> Result<String, FabricError> {
        self.store
            .get(&service_key(name))
            .await?
            .ok_or_else(|| FabricError::NotFound(format!("no live registration for {name}")))
    }
}

/// Renewal loop for one lease. Exits on the first failed renewal and lets the
/// registration lapse at expiry.
async fn renew<S: RegistryStore>(
    store: Arc<S>,
    service: String,
    lease: LeaseId,
    ttl: Duration,
    cancel: CancellationToken,
) {
    let period = (ttl / 2).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(%service, lease, "lease renewal stopped");
                return;
            }
            _ = ticker.tick() => {}
        }
        match store.keep_alive(lease).await {
            Ok(granted) => {
                let ttl_ms = granted.as_millis() as u64;
                tracing::trace!(%service, lease, ttl_ms, "lease renewed");
            }
            Err(e) => {
                tracing::warn!(
                    %service,
                    lease,
                    error = %e,
                    "lease renewal failed; registration will lapse"
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::mem::MemRegistryStore;

    /// Wraps the in-memory store, counting renewals and failing them on demand.
    struct FlakyStore {
        inner: MemRegistryStore,
        renewals: AtomicUsize,
        fail_renewals: AtomicBool,
        unreachable: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            FlakyStore {
                inner: MemRegistryStore::new(),
                renewals: AtomicUsize::new(0),
                fail_renewals: AtomicBool::new(false),
                unreachable: AtomicBool::new(false),
            }
        }

        fn check_reachable(&self) -> Result<(), FabricError> {
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(FabricError::Connection {
                    service: "registry".into(),
                    reason: "connection refused".into(),
                });
            }
            Ok(())
        }
    }

    impl RegistryStore for FlakyStore {
        async fn grant(&self, ttl: Duration) -> Result<LeaseId, FabricError> {
            self.check_reachable()?;
            self.inner.grant(ttl).await
        }

        async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<(), FabricError> {
            self.check_reachable()?;
            self.inner.put(key, value, lease).await
        }

        async fn keep_alive(&self, lease: LeaseId) -> Result<Duration, FabricError> {
            self.renewals.fetch_add(1, Ordering::SeqCst);
            if self.fail_renewals.load(Ordering::SeqCst) {
                return Err(FabricError::Connection {
                    service: "registry".into(),
                    reason: "deadline exceeded".into(),
                });
            }
            self.inner.keep_alive(lease).await
        }

        async fn get(&self, key: &str) -> Result<Option<String>, FabricError> {
            self.check_reachable()?;
            self.inner.get(key).await
        }

        async fn revoke(&self, lease: LeaseId) -> Result<(), FabricError> {
            self.inner.revoke(lease).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn register_then_resolve() {
        let client = RegistryClient::new(Arc::new(MemRegistryStore::new()));
        let lease =
            client.register("orders", "10.0.0.5:7001", Duration::from_secs(10)).await.unwrap();
        assert_eq!(lease.service(), "orders");
        assert_eq!(client.resolve("orders").await.unwrap(), "10.0.0.5:7001");
    }

    #[tokio::test]
    async fn resolve_unknown_is_not_found() {
        let client = RegistryClient::new(Arc::new(MemRegistryStore::new()));
        let err = client.resolve("nobody").await.unwrap_err();
        assert!(matches!(err, FabricError::NotFound(_)));
    }

    #[tokio::test]
    async fn register_against_unreachable_store_fails() {
        let store = Arc::new(FlakyStore::new());
        store.unreachable.store(true, Ordering::SeqCst);
        let client = RegistryClient::new(store);

        let err = client.register("cart", "cart:1", Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, FabricError::Registration(_)));
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let client = RegistryClient::new(Arc::new(MemRegistryStore::new()));
        let err = client.register("cart", "cart:1", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, FabricError::Registration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_happens_by_half_ttl_and_keeps_registration_alive() {
        let store = Arc::new(FlakyStore::new());
        let client = RegistryClient::new(store.clone());
        let lease =
            client.register("orders", "10.0.0.5:7001", Duration::from_secs(10)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5_001)).await;
        assert!(store.renewals.load(Ordering::SeqCst) >= 1);

        // Well past the original ttl; renewals keep it discoverable.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(client.resolve("orders").await.unwrap(), "10.0.0.5:7001");
        assert!(lease.is_renewing());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_renewal_stops_loop_and_registration_lapses() {
        let store = Arc::new(FlakyStore::new());
        store.fail_renewals.store(true, Ordering::SeqCst);
        let client = RegistryClient::new(store.clone());
        let lease =
            client.register("orders", "10.0.0.5:7001", Duration::from_secs(10)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(store.renewals.load(Ordering::SeqCst), 1);
        assert!(!lease.is_renewing());

        // No retry storm: nothing further is attempted.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(store.renewals.load(Ordering::SeqCst), 1);

        let err = client.resolve("orders").await.unwrap_err();
        assert!(matches!(err, FabricError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn deregister_stops_renewal_and_removes_key() {
        let store = Arc::new(FlakyStore::new());
        let client = RegistryClient::new(store.clone());
        let lease = client.register("cart", "cart:50051", Duration::from_secs(10)).await.unwrap();

        client.deregister(lease).await.unwrap();
        assert!(client.resolve("cart").await.is_err());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.renewals.load(Ordering::SeqCst), 0);
    }
}
