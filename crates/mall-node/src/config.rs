use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use mall_proxy::{BreakerConfig, CachePolicy, ProxyConfig};
use mall_server::GatewayConfig;
use mall_types::ServiceEndpoint;

const DEFAULT_CONFIG: &str = include_str!("../../../config/default.toml");

#[derive(Debug, Deserialize)]
pub struct GatewaySection {
    pub listen_addr: String,
    pub advertise_addr: String,
    pub request_timeout_ms: u64,
    pub cache_max_age_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutSection {
    pub listen_addr: String,
    pub advertise_addr: String,
    pub required_services: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectionSection {
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    Etcd,
    Memory,
}

#[derive(Debug, Deserialize)]
pub struct RegistrySection {
    pub backend: RegistryBackend,
    pub endpoints: Vec<String>,
    pub dial_timeout_ms: u64,
    pub lease_ttl_secs: u64,
    pub discovery: bool,
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Redis,
    Memory,
    None,
}

#[derive(Debug, Deserialize)]
pub struct CacheSection {
    pub backend: CacheBackend,
    pub redis_url: String,
    pub ttl_secs: u64,
    pub memory_capacity: usize,
    pub policy: CachePolicy,
}

#[derive(Debug, Deserialize)]
pub struct BreakerSection {
    pub timeout_ms: u64,
    pub max_concurrent: usize,
    pub error_percent_threshold: u8,
    pub request_volume_threshold: u64,
    pub sleep_window_ms: u64,
    pub rolling_window_ms: u64,
    pub rolling_buckets: u32,
}

#[derive(Debug, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub gateway: GatewaySection,
    pub checkout: CheckoutSection,
    pub services: BTreeMap<String, String>,
    pub connection: ConnectionSection,
    pub registry: RegistrySection,
    pub cache: CacheSection,
    pub breaker: BreakerSection,
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Embedded defaults, then `path`, then `MALL_*` variables, then
    /// `<NAME>_SERVICE_ADDR` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Toml::string(DEFAULT_CONFIG));
        if let Some(path) = path {
            figment = figment.merge(Toml::file_exact(path));
        }
        figment
            .merge(Env::prefixed("MALL_").split("__"))
            .merge(Env::raw().filter_map(|key| {
                key.as_str()
                    .strip_suffix("_service_addr")
                    .filter(|name| !name.is_empty())
                    .map(|name| format!("services.{name}").into())
            }))
    }

    pub fn endpoints(&self) -> Vec<ServiceEndpoint> {
        self.services
            .iter()
            .map(|(name, address)| ServiceEndpoint::new(name.as_str(), address.as_str()))
            .collect()
    }

    pub fn proxy(&self) -> ProxyConfig {
        let b = &self.breaker;
        ProxyConfig {
            breaker: BreakerConfig {
                timeout: Duration::from_millis(b.timeout_ms),
                max_concurrent: b.max_concurrent,
                error_percent_threshold: b.error_percent_threshold,
                request_volume_threshold: b.request_volume_threshold,
                sleep_window: Duration::from_millis(b.sleep_window_ms),
                rolling_window: Duration::from_millis(b.rolling_window_ms),
                rolling_buckets: b.rolling_buckets,
            },
            cache_ttl: Duration::from_secs(self.cache.ttl_secs),
            cache_policy: self.cache.policy,
        }
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            request_timeout: Duration::from_millis(self.gateway.request_timeout_ms),
            cache_max_age: Duration::from_secs(self.gateway.cache_max_age_secs),
        }
    }
}
