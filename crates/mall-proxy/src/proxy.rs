use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use prost::Message;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use mall_types::{CallContext, FabricError, MethodDescriptor};

use crate::breaker::{BreakerConfig, CircuitSnapshot, Circuits};
use crate::cache::{cache_key, NoCache, ResponseCache, DEFAULT_CACHE_TTL};
use crate::connection::{ConnectionManager, Connector};
use crate::dispatch::{decode_response, is_caller_error, DispatchTable};
use crate::fallback::{FailFast, Fallback};

/// Which successful responses the proxy stores in its cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Every method in the dispatch table.
    #[default]
    All,
    /// Only methods marked with [`DispatchTable::mark_cacheable`].
    Marked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub breaker: BreakerConfig,
    pub cache_ttl: Duration,
    pub cache_policy: CachePolicy,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            breaker: BreakerConfig::default(),
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_policy: CachePolicy::default(),
        }
    }
}

struct Inner<K: Connector, R> {
    conns: Arc<ConnectionManager<K>>,
    table: Arc<DispatchTable<K::Conn>>,
    cache: R,
    circuits: Circuits,
    fallback: Arc<dyn Fallback>,
    cache_ttl: Duration,
    cache_policy: CachePolicy,
}

/// The call path between services: cache, circuit breaker, dispatch and
/// fallback, in that order.
pub struct ResilientProxy<K: Connector, R = NoCache> {
    inner: Arc<Inner<K, R>>,
}

impl<K: Connector, R> Clone for ResilientProxy<K, R> {
    fn clone(&self) -> Self {
        ResilientProxy { inner: self.inner.clone() }
    }
}

pub struct ProxyBuilder<K: Connector, R = NoCache> {
    conns: Arc<ConnectionManager<K>>,
    table: DispatchTable<K::Conn>,
    cache: R,
    fallback: Arc<dyn Fallback>,
    config: ProxyConfig,
}

impl<K: Connector> ProxyBuilder<K, NoCache> {
    pub fn new(conns: Arc<ConnectionManager<K>>, table: DispatchTable<K::Conn>) -> Self {
        ProxyBuilder {
            conns,
            table,
            cache: NoCache,
            fallback: Arc::new(FailFast),
            config: ProxyConfig::default(),
        }
    }
}

impl<K: Connector, R: ResponseCache> ProxyBuilder<K, R> {
    pub fn cache<R2: ResponseCache>(self, cache: R2) -> ProxyBuilder<K, R2> {
        ProxyBuilder {
            conns: self.conns,
            table: self.table,
            cache,
            fallback: self.fallback,
            config: self.config,
        }
    }

    pub fn fallback(mut self, fallback: impl Fallback) -> Self {
        self.fallback = Arc::new(fallback);
        self
    }

    pub fn config(mut self, config: ProxyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ResilientProxy<K, R> {
        ResilientProxy {
            inner: Arc::new(Inner {
                conns: self.conns,
                table: Arc::new(self.table),
                cache: self.cache,
                circuits: Circuits::new(self.config.breaker),
                fallback: self.fallback,
                cache_ttl: self.config.cache_ttl,
                cache_policy: self.config.cache_policy,
            }),
        }
    }
}

impl<K: Connector, R: ResponseCache> ResilientProxy<K, R> {
    pub fn connections(&self) -> &Arc<ConnectionManager<K>> {
        &self.inner.conns
    }

    pub fn table(&self) -> &DispatchTable<K::Conn> {
        &self.inner.table
    }

    /// Current state of the circuit for `desc`; `None` until it has seen a
    /// call.
    pub fn circuit_state(&self, desc: &MethodDescriptor) -> Option<CircuitSnapshot> {
        self.inner.circuits.peek(desc).map(|b| b.snapshot())
    }

    /// Blocking call: returns when the downstream answers, the fallback
    /// decides, or the caller gives up.
    pub async fn call<Req, Resp>(
        &self,
        ctx: &CallContext,
        service: &str,
        method: &str,
        req: &Req,
    ) -> Result<Resp, FabricError>
    where
        Req: Message + 'static,
        Resp: Message + Default + 'static,
    {
        let desc = MethodDescriptor::new(service, method);
        let use_cache = self.caches(&desc);
        self.call_typed(ctx, desc, req, use_cache).await
    }

    /// Like [`call`](Self::call), but never reads or writes the cache.
    /// For calls that change state or must observe it fresh.
    pub async fn call_uncached<Req, Resp>(
        &self,
        ctx: &CallContext,
        service: &str,
        method: &str,
        req: &Req,
    ) -> Result<Resp, FabricError>
    where
        Req: Message + 'static,
        Resp: Message + Default + 'static,
    {
        let desc = MethodDescriptor::new(service, method);
        self.call_typed(ctx, desc, req, false).await
    }

    /// Non-blocking call. The call runs on its own task; the handle yields
    /// its result once.
    ///
    /// Cancelling `ctx` releases the waiter but leaves the call running, so
    /// its outcome still reaches the breaker and the cache.
    pub fn async_call<Req, Resp>(
        &self,
        ctx: CallContext,
        service: &str,
        method: &str,
        req: Req,
    ) -> CallHandle<Resp>
    where
        Req: Message + 'static,
        Resp: Message + Default + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let cancel = ctx.cancellation().clone();
        let desc = MethodDescriptor::new(service, method);

        if let Err(e) = self.check_contract::<Req, Resp>(&desc) {
            let _ = tx.send(Err(e));
            return CallHandle { rx, cancel };
        }

        let mut detached = CallContext::new().with_request_id(ctx.request_id.clone());
        if let Some(deadline) = ctx.deadline() {
            detached = detached.with_deadline(deadline);
        }
        let payload = Bytes::from(req.encode_to_vec());
        let proxy = self.clone();
        tokio::spawn(async move {
            let result = proxy
                .call_raw(&detached, &desc, payload)
                .await
                .and_then(|bytes| decode_response::<Resp>(&desc, bytes));
            let _ = tx.send(result);
        });

        CallHandle { rx, cancel }
    }

    /// The byte-level call path shared by [`call`](Self::call) and
    /// [`async_call`](Self::async_call). `payload` must be the encoded request
    /// type registered for `desc`.
    pub async fn call_raw(
        &self,
        ctx: &CallContext,
        desc: &MethodDescriptor,
        payload: Bytes,
    ) -> Result<Bytes, FabricError> {
        self.dispatch(ctx, desc, payload, self.caches(desc)).await
    }

    async fn call_typed<Req, Resp>(
        &self,
        ctx: &CallContext,
        desc: MethodDescriptor,
        req: &Req,
        use_cache: bool,
    ) -> Result<Resp, FabricError>
    where
        Req: Message + 'static,
        Resp: Message + Default + 'static,
    {
        self.check_contract::<Req, Resp>(&desc)?;
        let payload = Bytes::from(req.encode_to_vec());
        let bytes = self.dispatch(ctx, &desc, payload, use_cache).await?;
        decode_response(&desc, bytes)
    }

    fn caches(&self, desc: &MethodDescriptor) -> bool {
        let inner = &*self.inner;
        inner.cache.enabled()
            && match inner.cache_policy {
                CachePolicy::All => true,
                CachePolicy::Marked => inner.table.is_cacheable(desc),
            }
    }

    async fn dispatch(
        &self,
        ctx: &CallContext,
        desc: &MethodDescriptor,
        payload: Bytes,
        use_cache: bool,
    ) -> Result<Bytes, FabricError> {
        let inner = &*self.inner;
        if !inner.table.contains(desc) {
            let err = FabricError::MethodNotFound(desc.clone());
            tracing::error!(method = %desc, "no dispatch entry");
            return Err(err);
        }
        if ctx.is_cancelled() {
            return Err(FabricError::Cancelled);
        }

        let key = use_cache.then(|| cache_key(desc, &payload));
        if let Some(key) = &key {
            match inner.cache.get(key).await {
                Ok(Some(hit)) => {
                    tracing::debug!(method = %desc, request_id = %ctx.request_id, "cache hit");
                    return Ok(hit);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        method = %desc,
                        error = %e,
                        "cache lookup failed; treating as miss"
                    )
                }
            }
        }

        let breaker = inner.circuits.get(desc);
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(rejection) => return self.degrade(desc, rejection.into_error(desc)),
        };

        let breaker_timeout = inner.circuits.config().timeout;
        let limit = ctx.bounded_timeout(breaker_timeout);
        let attempt = async {
            let conn = inner.conns.get_or_create(&desc.service).await?;
            inner.table.invoke_raw(conn, desc, ctx.clone(), payload).await
        };
        let outcome = tokio::select! {
            _ = ctx.cancellation().cancelled() => Err(FabricError::Cancelled),
            res = tokio::time::timeout(limit, attempt) => {
                res.unwrap_or(Err(FabricError::Timeout))
            }
        };

        match outcome {
            Ok(bytes) => {
                permit.success();
                if let Some(key) = &key {
                    if let Err(e) = inner.cache.set(key, bytes.clone(), inner.cache_ttl).await {
                        tracing::warn!(method = %desc, error = %e, "cache store failed");
                    }
                }
                Ok(bytes)
            }
            Err(FabricError::Cancelled) => {
                drop(permit);
                tracing::debug!(
                    method = %desc,
                    request_id = %ctx.request_id,
                    "call cancelled by caller"
                );
                Err(FabricError::Cancelled)
            }
            Err(e) if e.is_contract_error() => {
                drop(permit);
                tracing::error!(method = %desc, error = %e, "dispatch contract violated");
                Err(e)
            }
            // The dependency answered; the request itself was wrong.
            Err(e) if is_caller_error(&e) => {
                drop(permit);
                tracing::debug!(method = %desc, error = %e, "request rejected by dependency");
                Err(e)
            }
            // The caller's own deadline ran out first; not the dependency's fault.
            Err(FabricError::Timeout) if limit < breaker_timeout => {
                drop(permit);
                Err(FabricError::Timeout)
            }
            Err(FabricError::Timeout) => {
                permit.timeout();
                self.degrade(desc, FabricError::Timeout)
            }
            Err(e) => {
                permit.failure();
                self.degrade(desc, e)
            }
        }
    }

    fn check_contract<Req: 'static, Resp: 'static>(
        &self,
        desc: &MethodDescriptor,
    ) -> Result<(), FabricError> {
        self.inner.table.contract::<Req, Resp>(desc).map_err(|e| {
            tracing::error!(method = %desc, error = %e, "dispatch contract violated");
            e
        })
    }

    fn degrade(&self, desc: &MethodDescriptor, cause: FabricError) -> Result<Bytes, FabricError> {
        match &cause {
            FabricError::CircuitOpen(_) | FabricError::Saturated(_) => {
                tracing::debug!(method = %desc, cause = %cause, "call rejected by circuit")
            }
            _ => tracing::warn!(method = %desc, cause = %cause, "call failed; using fallback"),
        }
        self.inner.fallback.fallback(desc, &cause)
    }
}

/// Pending result of [`ResilientProxy::async_call`].
pub struct CallHandle<T> {
    rx: oneshot::Receiver<Result<T, FabricError>>,
    cancel: CancellationToken,
}

impl<T> CallHandle<T> {
    /// Wait for the result, or `Cancelled` as soon as the caller's token
    /// fires.
    pub async fn wait(self) -> Result<T, FabricError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(FabricError::Cancelled),
            res = self.rx => res.unwrap_or(Err(FabricError::Cancelled)),
        }
    }
}
