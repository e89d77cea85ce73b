use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OnceCell, RwLock};
use tonic::transport::{Channel, Endpoint};

use mall_registry::{RegistryClient, RegistryStore};
use mall_types::{FabricError, ServiceEndpoint};

use crate::dispatch::BoxFuture;

/// Dials a downstream endpoint.
///
/// `Conn` is a cheap, clonable handle to one long-lived connection; every
/// caller asking for the same service gets a clone of the same handle.
pub trait Connector: Send + Sync + 'static {
    type Conn: Clone + Send + Sync + 'static;

    fn connect(&self, endpoint: &ServiceEndpoint)
        -> impl Future<Output = Result<Self::Conn, FabricError>> + Send;
}

/// Opens tonic channels over plain HTTP/2.
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    connect_timeout: Duration,
}

impl GrpcConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        GrpcConnector { connect_timeout }
    }
}

impl Default for GrpcConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl Connector for GrpcConnector {
    type Conn = Channel;

    async fn connect(&self, endpoint: &ServiceEndpoint) -> Result<Channel, FabricError> {
        let uri = if endpoint.address.contains("://") {
            endpoint.address.clone()
        } else {
            format!("http://{}", endpoint.address)
        };
        let conn_err = |reason: String| FabricError::Connection {
            service: endpoint.name.clone(),
            reason,
        };
        Endpoint::from_shared(uri)
            .map_err(|e| conn_err(e.to_string()))?
            .connect_timeout(self.connect_timeout)
            .tcp_nodelay(true)
            .connect()
            .await
            .map_err(|e| conn_err(e.to_string()))
    }
}

/// Resolves a service name to `host:port` for services that are not in the
/// static endpoint table.
pub trait AddressResolver: Send + Sync + 'static {
    fn resolve<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<String, FabricError>>;
}

impl<S: RegistryStore> AddressResolver for RegistryClient<S> {
    fn resolve<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<String, FabricError>> {
        Box::pin(RegistryClient::resolve(self, name))
    }
}

/// One reusable connection per downstream service name.
///
/// The table maps each name to a once-cell. Lookups of established
/// connections take only the read lock. The write lock is held just long
/// enough to insert an empty cell; dialing happens inside the cell, so
/// concurrent first callers share a single dial and dials for unrelated
/// services never wait on each other.
pub struct ConnectionManager<K: Connector> {
    connector: K,
    endpoints: HashMap<String, ServiceEndpoint>,
    discovery: Option<Arc<dyn AddressResolver>>,
    conns: RwLock<HashMap<String, Arc<OnceCell<K::Conn>>>>,
    closed: AtomicBool,
}

impl<K: Connector> ConnectionManager<K> {
    pub fn new(connector: K, endpoints: impl IntoIterator<Item = ServiceEndpoint>) -> Self {
        ConnectionManager {
            connector,
            endpoints: endpoints.into_iter().map(|e| (e.name.clone(), e)).collect(),
            discovery: None,
            conns: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Resolve names missing from the static table through `resolver` on
    /// first use.
    pub fn with_discovery(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.discovery = Some(resolver);
        self
    }

    pub fn endpoint(&self, name: &str) -> Option<&ServiceEndpoint> {
        self.endpoints.get(name)
    }

    /// Return the connection for `name`, dialing it on first use.
    pub async fn get_or_create(&self, name: &str) -> Result<K::Conn, FabricError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FabricError::Connection {
                service: name.to_string(),
                reason: "connection manager closed".into(),
            });
        }

        let existing = self.conns.read().await.get(name).cloned();
        let cell = match existing {
            Some(cell) => {
                if let Some(conn) = cell.get() {
                    return Ok(conn.clone());
                }
                cell
            }
            None => {
                if !self.endpoints.contains_key(name) && self.discovery.is_none() {
                    return Err(FabricError::UnknownService(name.to_string()));
                }
                let mut table = self.conns.write().await;
                // Double-check: another caller may have inserted while we waited.
                table
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .clone()
            }
        };

        let conn = cell.get_or_try_init(|| self.dial(name)).await?;
        Ok(conn.clone())
    }

    /// Dial every statically configured endpoint. Used at startup for
    /// dependencies the process cannot run without.
    pub async fn connect_all(&self) -> Result<(), FabricError> {
        for name in self.endpoints.keys() {
            self.get_or_create(name).await?;
        }
        Ok(())
    }

    /// Names with an established connection.
    pub async fn connected(&self) -> Vec<String> {
        let table = self.conns.read().await;
        let mut names: Vec<String> = table
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Release every connection. Safe to call more than once.
    pub async fn close_all(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut table = self.conns.write().await;
        let released = table.len();
        table.clear();
        tracing::info!(released, "connections closed");
    }

    async fn dial(&self, name: &str) -> Result<K::Conn, FabricError> {
        let endpoint = match self.endpoints.get(name) {
            Some(endpoint) => endpoint.clone(),
            None => {
                let resolver = self
                    .discovery
                    .as_ref()
                    .ok_or_else(|| FabricError::UnknownService(name.to_string()))?;
                match resolver.resolve(name).await {
                    Ok(address) => ServiceEndpoint::new(name, address),
                    Err(FabricError::NotFound(_)) => {
                        return Err(FabricError::UnknownService(name.to_string()))
                    }
                    Err(e) => {
                        return Err(FabricError::Connection {
                            service: name.to_string(),
                            reason: format!("discovery failed: {e}"),
                        })
                    }
                }
            }
        };

        match self.connector.connect(&endpoint).await {
            Ok(conn) => {
                tracing::info!(
                    service = %endpoint.name,
                    address = %endpoint.address,
                    "connection established"
                );
                Ok(conn)
            }
            Err(e) => {
                tracing::warn!(
                    service = %endpoint.name,
                    address = %endpoint.address,
                    error = %e,
                    "dial failed"
                );
                Err(e)
            }
        }
    }
}
