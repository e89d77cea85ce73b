use std::future::Future;
use std::time::Duration;

use mall_types::{FabricError, LeaseId};

/// A key/value store with lease semantics.
///
/// Methods use RPITIT (`-> impl Future + Send`) so generic callers can
/// `.await` across thread boundaries without an `async-trait` dependency.
///
/// An unreachable store reports `FabricError::Connection`; an unknown or
/// expired lease reports `FabricError::NotFound`.
pub trait RegistryStore: Send + Sync + 'static {
    /// Create a lease that expires `ttl` after the last renewal.
    fn grant(&self, ttl: Duration)
        -> impl Future<Output = Result<LeaseId, FabricError>> + Send;

    /// Write `key → value`, bound to `lease`. The pair disappears with the lease.
    fn put(&self, key: &str, value: &str, lease: LeaseId)
        -> impl Future<Output = Result<(), FabricError>> + Send;

    /// Renew `lease` once. Returns the TTL the store granted.
    fn keep_alive(&self, lease: LeaseId)
        -> impl Future<Output = Result<Duration, FabricError>> + Send;

    /// Current value of `key`, `None` if absent or its lease has lapsed.
    fn get(&self, key: &str)
        -> impl Future<Output = Result<Option<String>, FabricError>> + Send;

    /// Drop `lease` and every key bound to it.
    fn revoke(&self, lease: LeaseId)
        -> impl Future<Output = Result<(), FabricError>> + Send;
}
