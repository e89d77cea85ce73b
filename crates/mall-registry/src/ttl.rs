use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::mem::MemRegistryStore;

/// Sweep interval used when none is configured.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Removes lapsed leases and their registrations from a [`MemRegistryStore`].
///
/// Reads already hide expired keys; the reaper only bounds memory held by
/// instances that died without revoking their lease.
pub struct LeaseReaper {
    store: Arc<MemRegistryStore>,
    interval: Duration,
}

impl LeaseReaper {
    pub fn new(store: Arc<MemRegistryStore>) -> Self {
        LeaseReaper { store, interval: DEFAULT_SWEEP_INTERVAL }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            let removed = self.store.purge_expired().await;
            if removed > 0 {
                tracing::debug!(removed, "reaped expired registrations");
            }
        }
    }
}
