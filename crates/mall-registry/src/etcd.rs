use std::time::Duration;

use etcd_client::{Client, ConnectOptions, PutOptions};

use mall_types::{FabricError, LeaseId};

use crate::traits::RegistryStore;

fn etcd_err(e: etcd_client::Error) -> FabricError {
    FabricError::Connection { service: "etcd".into(), reason: e.to_string() }
}

/// `RegistryStore` backed by etcd v3 leases.
///
/// `etcd_client::Client` is a cheap handle over one gRPC channel; each call
/// works on its own clone because the client API takes `&mut self`.
#[derive(Clone)]
pub struct EtcdRegistryStore {
    client: Client,
}

impl EtcdRegistryStore {
    pub async fn connect(
        endpoints: &[String],
        dial_timeout: Duration,
    ) -> Result<Self, FabricError> {
        let options = ConnectOptions::new()
            .with_connect_timeout(dial_timeout)
            .with_timeout(dial_timeout);
        let client = Client::connect(endpoints, Some(options)).await.map_err(etcd_err)?;
        Ok(EtcdRegistryStore { client })
    }
}

impl RegistryStore for EtcdRegistryStore {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, FabricError> {
        // etcd leases have whole-second granularity.
        let secs = ttl.as_secs_f64().ceil().max(1.0) as i64;
        let resp = self.client.clone().lease_grant(secs, None).await.map_err(etcd_err)?;
        Ok(resp.id())
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<(), FabricError> {
        self.client
            .clone()
            .put(key, value, Some(PutOptions::new().with_lease(lease)))
            .await
            .map_err(etcd_err)?;
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration, FabricError> {
        let (mut keeper, mut stream) =
            self.client.clone().lease_keep_alive(lease).await.map_err(etcd_err)?;
        keeper.keep_alive().await.map_err(etcd_err)?;
        match stream.message().await.map_err(etcd_err)? {
            Some(resp) if resp.ttl() > 0 => Ok(Duration::from_secs(resp.ttl() as u64)),
            _ => Err(FabricError::NotFound(format!("lease {lease} expired"))),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, FabricError> {
        let resp = self.client.clone().get(key, None).await.map_err(etcd_err)?;
        match resp.kvs().first() {
            None => Ok(None),
            Some(kv) => kv.value_str().map(|v| Some(v.to_string())).map_err(etcd_err),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), FabricError> {
        self.client.clone().lease_revoke(lease).await.map_err(etcd_err)?;
        Ok(())
    }
}
