use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::uri::PathAndQuery;
use prost::Message;
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;
use tonic::{Code, Status};

use mall_types::{CallContext, FabricError, MethodDescriptor};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type Handler<C> = Arc<
    dyn Fn(C, CallContext, Bytes) -> BoxFuture<'static, Result<Bytes, FabricError>> + Send + Sync,
>;

struct MethodEntry<C> {
    request: (TypeId, &'static str),
    response: (TypeId, &'static str),
    cacheable: bool,
    handler: Handler<C>,
}

/// Maps `(service, method)` to a typed call on a client handle `C`.
///
/// Built once at startup. Every entry is registered with its concrete
/// request and response types; the table erases them to protobuf bytes so a
/// single call path serves every endpoint, and checks them again on the way
/// in so a caller cannot invoke an entry with the wrong message types.
pub struct DispatchTable<C> {
    entries: HashMap<MethodDescriptor, MethodEntry<C>>,
}

impl<C: Send + 'static> DispatchTable<C> {
    pub fn new() -> Self {
        DispatchTable { entries: HashMap::new() }
    }

    /// Register `f` as the implementation of `service.method`.
    ///
    /// A second registration for the same descriptor replaces the first.
    pub fn register<Req, Resp, F, Fut>(&mut self, service: &str, method: &str, f: F) -> &mut Self
    where
        Req: Message + Default + Send + 'static,
        Resp: Message + Send + 'static,
        F: Fn(C, CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, FabricError>> + Send + 'static,
    {
        let desc = MethodDescriptor::new(service, method);
        let f = Arc::new(f);
        let entry_desc = desc.clone();
        let handler: Handler<C> = Arc::new(move |client: C, ctx: CallContext, payload: Bytes| {
            let f = f.clone();
            let desc = entry_desc.clone();
            let fut: BoxFuture<'static, Result<Bytes, FabricError>> = Box::pin(async move {
                let req = Req::decode(payload).map_err(|e| FabricError::InvalidContract {
                    method: desc,
                    reason: format!("request is not a {}: {e}", type_name::<Req>()),
                })?;
                let resp = f(client, ctx, req).await?;
                Ok(Bytes::from(resp.encode_to_vec()))
            });
            fut
        });

        let replaced = self.entries.insert(
            desc.clone(),
            MethodEntry {
                request: (TypeId::of::<Req>(), type_name::<Req>()),
                response: (TypeId::of::<Resp>(), type_name::<Resp>()),
                cacheable: false,
                handler,
            },
        );
        if replaced.is_some() {
            tracing::warn!(method = %desc, "dispatch entry replaced");
        }
        self
    }

    /// Declare `service.method` a pure read whose responses may be served
    /// from the response cache. Entries are uncached until marked.
    pub fn mark_cacheable(&mut self, service: &str, method: &str) -> &mut Self {
        let desc = MethodDescriptor::new(service, method);
        match self.entries.get_mut(&desc) {
            Some(entry) => entry.cacheable = true,
            None => tracing::warn!(method = %desc, "cannot mark unregistered method cacheable"),
        }
        self
    }

    pub fn is_cacheable(&self, desc: &MethodDescriptor) -> bool {
        self.entries.get(desc).is_some_and(|entry| entry.cacheable)
    }

    pub fn contains(&self, desc: &MethodDescriptor) -> bool {
        self.entries.contains_key(desc)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.entries.keys()
    }

    /// Check that `desc` exists and takes `Req`, returning `Resp`.
    pub fn contract<Req: 'static, Resp: 'static>(
        &self,
        desc: &MethodDescriptor,
    ) -> Result<(), FabricError> {
        let entry = self
            .entries
            .get(desc)
            .ok_or_else(|| FabricError::MethodNotFound(desc.clone()))?;
        if entry.request.0 != TypeId::of::<Req>() {
            return Err(FabricError::InvalidContract {
                method: desc.clone(),
                reason: format!(
                    "expects request {}, got {}",
                    entry.request.1,
                    type_name::<Req>()
                ),
            });
        }
        if entry.response.0 != TypeId::of::<Resp>() {
            return Err(FabricError::InvalidContract {
                method: desc.clone(),
                reason: format!(
                    "returns {}, caller expects {}",
                    entry.response.1,
                    type_name::<Resp>()
                ),
            });
        }
        Ok(())
    }

    /// Invoke `desc` with an already-encoded request.
    ///
    /// The handler is called with exactly `(ctx, request)`. When it fails the
    /// error is returned and nothing else.
    pub async fn invoke_raw(
        &self,
        client: C,
        desc: &MethodDescriptor,
        ctx: CallContext,
        payload: Bytes,
    ) -> Result<Bytes, FabricError> {
        let handler = self
            .entries
            .get(desc)
            .map(|entry| entry.handler.clone())
            .ok_or_else(|| FabricError::MethodNotFound(desc.clone()))?;
        handler(client, ctx, payload).await
    }

    /// Typed invoke: contract check, encode, dispatch, decode.
    pub async fn invoke<Req, Resp>(
        &self,
        client: C,
        desc: &MethodDescriptor,
        ctx: CallContext,
        req: &Req,
    ) -> Result<Resp, FabricError>
    where
        Req: Message + 'static,
        Resp: Message + Default + 'static,
    {
        self.contract::<Req, Resp>(desc)?;
        let payload = Bytes::from(req.encode_to_vec());
        let bytes = self.invoke_raw(client, desc, ctx, payload).await?;
        decode_response(desc, bytes)
    }
}

impl<C: Send + 'static> Default for DispatchTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchTable<Channel> {
    /// Register a unary gRPC method reachable at `path`
    /// (`/package.Service/Method`) on the service's channel.
    pub fn register_grpc<Req, Resp>(
        &mut self,
        service: &str,
        method: &str,
        path: &'static str,
    ) -> &mut Self
    where
        Req: Message + Default + Send + Sync + 'static,
        Resp: Message + Default + Send + Sync + 'static,
    {
        self.register::<Req, Resp, _, _>(service, method, move |channel, ctx, req| {
            grpc_unary::<Req, Resp>(channel, path, ctx, req)
        })
    }
}

pub(crate) fn decode_response<Resp: Message + Default>(
    desc: &MethodDescriptor,
    bytes: Bytes,
) -> Result<Resp, FabricError> {
    Resp::decode(bytes).map_err(|e| FabricError::InvalidContract {
        method: desc.clone(),
        reason: format!("response is not a {}: {e}", type_name::<Resp>()),
    })
}

/// A downstream answer that blames the request rather than the service.
/// Such errors reach the caller unchanged and never count against a circuit.
pub fn is_caller_error(err: &FabricError) -> bool {
    let FabricError::Downstream { code, .. } = err else {
        return false;
    };
    matches!(
        Code::from(*code),
        Code::InvalidArgument
            | Code::NotFound
            | Code::AlreadyExists
            | Code::PermissionDenied
            | Code::FailedPrecondition
            | Code::OutOfRange
            | Code::Unauthenticated
    )
}

/// One unary gRPC call over `channel`, carrying the caller's deadline and
/// request id.
pub async fn grpc_unary<Req, Resp>(
    channel: Channel,
    path: &'static str,
    ctx: CallContext,
    req: Req,
) -> Result<Resp, FabricError>
where
    Req: Message + Send + Sync + 'static,
    Resp: Message + Default + Send + Sync + 'static,
{
    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready().await.map_err(|e| FabricError::Connection {
        service: path.to_string(),
        reason: e.to_string(),
    })?;

    let mut request = tonic::Request::new(req);
    if let Some(left) = ctx.remaining() {
        request.set_timeout(left);
    }
    if let Ok(value) = MetadataValue::try_from(ctx.request_id.as_str()) {
        request.metadata_mut().insert("x-request-id", value);
    }

    let codec = tonic::codec::ProstCodec::<Req, Resp>::default();
    grpc.unary(request, PathAndQuery::from_static(path), codec)
        .await
        .map(tonic::Response::into_inner)
        .map_err(|status| status_to_fabric(path, status))
}

// Only the caller's own token yields `FabricError::Cancelled`; a downstream
// `Cancelled` status is an ordinary failure of that dependency.
fn status_to_fabric(path: &str, status: Status) -> FabricError {
    match status.code() {
        Code::Unavailable => FabricError::Connection {
            service: path.to_string(),
            reason: status.message().to_string(),
        },
        Code::DeadlineExceeded => FabricError::Timeout,
        code => FabricError::Downstream {
            code: code as i32,
            message: status.message().to_string(),
        },
    }
}
