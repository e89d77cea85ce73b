mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use mall_proxy::{
    ConnectionManager, GrpcConnector, MemCache, NoCache, ProxyBuilder, RedisCache, ResponseCache,
};
use mall_registry::{
    EtcdRegistryStore, LeaseReaper, MemRegistryStore, RegistryClient, RegistryStore,
};
use mall_server::{gateway_router, mall_dispatch_table, serve_checkout, serve_gateway};
use mall_types::FabricError;

use crate::config::{CacheBackend, Config, RegistryBackend};

#[derive(clap::Parser, Debug)]
#[command(name = "mall-node", about = "Mall gateway and checkout node")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,
    #[command(subcommand)]
    role: Role,
}

#[derive(clap::Subcommand, Debug, Clone)]
enum Role {
    /// HTTP edge translating REST calls into proxied RPCs.
    Gateway {
        #[arg(long)]
        listen_addr: Option<String>,
    },
    /// Checkout gRPC service orchestrating cart, order and payment.
    Checkout {
        #[arg(long)]
        listen_addr: Option<String>,
    },
}

impl Role {
    fn name(&self) -> &'static str {
        match self {
            Role::Gateway { .. } => "gateway",
            Role::Checkout { .. } => "checkout",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    tracing::info!(role = cli.role.name(), "node starting");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
            }
            shutdown.cancel();
        }
    });

    let dial_timeout = Duration::from_millis(config.registry.dial_timeout_ms);
    match config.registry.backend {
        RegistryBackend::Etcd => {
            let store = EtcdRegistryStore::connect(&config.registry.endpoints, dial_timeout)
                .await
                .context("failed to connect to etcd")?;
            with_registry(cli.role, config, RegistryClient::new(Arc::new(store)), shutdown).await
        }
        RegistryBackend::Memory => {
            let store = Arc::new(MemRegistryStore::new());
            let reaper = LeaseReaper::new(store.clone())
                .with_interval(Duration::from_millis(config.registry.sweep_interval_ms));
            tokio::spawn(reaper.run(shutdown.clone()));
            with_registry(cli.role, config, RegistryClient::new(store), shutdown).await
        }
    }
}

async fn with_registry<S: RegistryStore>(
    role: Role,
    config: Config,
    registry: RegistryClient<S>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    match config.cache.backend {
        CacheBackend::Redis => {
            let cache = RedisCache::connect(&config.cache.redis_url)
                .await
                .context("failed to connect to redis")?;
            run_role(role, config, registry, cache, shutdown).await
        }
        CacheBackend::Memory => {
            let cache = MemCache::new(config.cache.memory_capacity);
            run_role(role, config, registry, cache, shutdown).await
        }
        CacheBackend::None => run_role(role, config, registry, NoCache, shutdown).await,
    }
}

async fn run_role<S: RegistryStore, R: ResponseCache>(
    role: Role,
    config: Config,
    registry: RegistryClient<S>,
    cache: R,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let connector = GrpcConnector::new(Duration::from_millis(config.connection.connect_timeout_ms));
    let mut conns = ConnectionManager::new(connector, config.endpoints());
    if config.registry.discovery {
        conns = conns.with_discovery(Arc::new(registry.clone()));
    }
    let conns = Arc::new(conns);
    let proxy = ProxyBuilder::new(conns.clone(), mall_dispatch_table())
        .cache(cache)
        .config(config.proxy())
        .build();

    let (listen_addr, advertise_addr) = match &role {
        Role::Gateway { listen_addr } => (
            listen_addr.clone().unwrap_or_else(|| config.gateway.listen_addr.clone()),
            config.gateway.advertise_addr.clone(),
        ),
        Role::Checkout { listen_addr } => (
            listen_addr.clone().unwrap_or_else(|| config.checkout.listen_addr.clone()),
            config.checkout.advertise_addr.clone(),
        ),
    };
    let addr: SocketAddr = listen_addr
        .parse()
        .with_context(|| format!("invalid listen_addr: {listen_addr}"))?;

    if matches!(role, Role::Checkout { .. }) && !config.registry.discovery {
        if let Some(missing) = config
            .checkout
            .required_services
            .iter()
            .find(|name| !config.services.contains_key(name.as_str()))
        {
            return Err(FabricError::UnknownService(missing.clone()))
                .context("checkout dependency has no address and discovery is off");
        }
    }

    let lease = registry
        .register(role.name(), &advertise_addr, Duration::from_secs(config.registry.lease_ttl_secs))
        .await
        .with_context(|| format!("failed to register {}", role.name()))?;

    let served = match role {
        Role::Gateway { .. } => {
            let router = gateway_router(proxy, config.gateway())
                .context("failed to build gateway routes")?;
            serve_gateway(addr, router, shutdown.clone()).await
        }
        Role::Checkout { .. } => serve_checkout(addr, proxy, shutdown.clone()).await,
    };

    conns.close_all().await;
    if let Err(e) = registry.deregister(lease).await {
        tracing::warn!(error = %e, "deregistration failed; lease will expire on its own");
    }
    tracing::info!("node stopped");
    served
}
