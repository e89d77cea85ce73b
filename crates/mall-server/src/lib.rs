mod checkout_service;
pub mod convert;
pub mod gateway;
pub mod routes;


use std::net::SocketAddr;

use anyhow::Context;
use axum::Router;
use mall_proto::v1::checkout_service_server::CheckoutServiceServer;
use mall_proxy::{Connector, ResilientProxy, ResponseCache};
use tokio_util::sync::CancellationToken;
use tonic_reflection::server::Builder as ReflectionBuilder;

pub use checkout_service::CheckoutServiceImpl;
pub use gateway::{Gateway, GatewayConfig};
pub use routes::{gateway_router, mall_dispatch_table};

/// Serve the HTTP edge until `shutdown` fires.
pub async fn serve_gateway(
    addr: SocketAddr,
    router: Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind gateway listener on {addr}"))?;
    tracing::info!(%addr, "gateway HTTP server starting");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(Into::into)
}

/// Serve the checkout gRPC service until `shutdown` fires.
pub async fn serve_checkout<K, R>(
    addr: SocketAddr,
    proxy: ResilientProxy<K, R>,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    K: Connector,
    R: ResponseCache,
{
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(mall_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .context("build reflection service")?;
    tracing::info!(%addr, "checkout gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(CheckoutServiceServer::new(CheckoutServiceImpl::new(proxy)))
        .add_service(reflection)
        .serve_with_shutdown(addr, async move { shutdown.cancelled().await })
        .await
        .map_err(Into::into)
}
