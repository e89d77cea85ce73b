pub mod breaker;
pub mod cache;
pub mod connection;
pub mod dispatch;
pub mod fallback;
pub mod proxy;

pub use breaker::{
    BreakerConfig, CallPermit, CircuitBreaker, CircuitSnapshot, CircuitState, Rejection,
};
pub use cache::{cache_key, MemCache, NoCache, RedisCache, ResponseCache, DEFAULT_CACHE_TTL};
pub use connection::{AddressResolver, ConnectionManager, Connector, GrpcConnector};
pub use dispatch::{grpc_unary, is_caller_error, BoxFuture, DispatchTable};
pub use fallback::{FailFast, Fallback, StaticFallback};
pub use proxy::{CachePolicy, CallHandle, ProxyBuilder, ProxyConfig, ResilientProxy};
