use std::time::Duration;

use axum::extract::{Query, Request};
use axum::http::header::{HeaderName, CACHE_CONTROL, CONTENT_TYPE, EXPIRES};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, on, MethodFilter};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use prost::Message;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tower_http::trace::TraceLayer;

use mall_proxy::{Connector, ResilientProxy, ResponseCache};
use mall_types::{CallContext, FabricError, MethodDescriptor};

use crate::convert::{error_body, fabric_to_response, REQUEST_ID_HEADER};

const MAX_BODY_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Deadline given to every proxied call.
    pub request_timeout: Duration,
    /// `max-age` sent on cacheable routes.
    pub cache_max_age: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            request_timeout: Duration::from_secs(5),
            cache_max_age: Duration::from_secs(300),
        }
    }
}

/// Builds the HTTP router one proxied route at a time.
pub struct Gateway<K: Connector, R> {
    proxy: ResilientProxy<K, R>,
    config: GatewayConfig,
    router: Router,
}

impl<K: Connector, R: ResponseCache> Gateway<K, R> {
    pub fn new(proxy: ResilientProxy<K, R>, config: GatewayConfig) -> Self {
        Gateway { proxy, config, router: Router::new().route("/", get(welcome)) }
    }

    /// Map `filter path` onto `service.method`. Every request reaches the
    /// service; the response cache is bypassed.
    pub fn route<Req, Resp>(
        self,
        filter: MethodFilter,
        path: &str,
        service: &str,
        method: &str,
    ) -> Result<Self, FabricError>
    where
        Req: Message + Default + DeserializeOwned + Send + Sync + 'static,
        Resp: Message + Default + Serialize + Send + 'static,
    {
        self.add::<Req, Resp>(filter, path, MethodDescriptor::new(service, method), None)
    }

    /// Like [`route`](Self::route), but served through the proxy's response
    /// cache and marked cacheable for clients with `Cache-Control` and
    /// `Expires`. Only for reads whose answer does not depend on who asks.
    pub fn cached_route<Req, Resp>(
        self,
        filter: MethodFilter,
        path: &str,
        service: &str,
        method: &str,
    ) -> Result<Self, FabricError>
    where
        Req: Message + Default + DeserializeOwned + Send + Sync + 'static,
        Resp: Message + Default + Serialize + Send + 'static,
    {
        let max_age = Some(self.config.cache_max_age);
        self.add::<Req, Resp>(filter, path, MethodDescriptor::new(service, method), max_age)
    }

    pub fn into_router(self) -> Router {
        self.router.layer(TraceLayer::new_for_http())
    }

    fn add<Req, Resp>(
        mut self,
        filter: MethodFilter,
        path: &str,
        desc: MethodDescriptor,
        max_age: Option<Duration>,
    ) -> Result<Self, FabricError>
    where
        Req: Message + Default + DeserializeOwned + Send + Sync + 'static,
        Resp: Message + Default + Serialize + Send + 'static,
    {
        // A route to a method the table cannot serve is a deployment error.
        self.proxy.table().contract::<Req, Resp>(&desc)?;

        let proxy = self.proxy.clone();
        let timeout = self.config.request_timeout;
        let handler = move |req: Request| {
            let proxy = proxy.clone();
            let desc = desc.clone();
            async move { dispatch::<K, R, Req, Resp>(proxy, desc, timeout, max_age, req).await }
        };
        self.router = self.router.route(path, on(filter, handler));
        Ok(self)
    }
}

async fn welcome() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "code": 200, "message": "welcome to the mall gateway" }))
}

/// Received → bound → dispatched → responded.
async fn dispatch<K, R, Req, Resp>(
    proxy: ResilientProxy<K, R>,
    desc: MethodDescriptor,
    timeout: Duration,
    max_age: Option<Duration>,
    req: Request,
) -> Response
where
    K: Connector,
    R: ResponseCache,
    Req: Message + Default + DeserializeOwned + Send + Sync + 'static,
    Resp: Message + Default + Serialize + Send + 'static,
{
    let mut ctx = CallContext::new().with_timeout(timeout);
    if let Some(id) = req.headers().get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()) {
        ctx = ctx.with_request_id(id);
    }
    tracing::info!(
        method = %req.method(),
        uri = %req.uri(),
        rpc = %desc,
        request_id = %ctx.request_id,
        "received request"
    );

    let bound: Req = match bind(req).await {
        Ok(bound) => bound,
        Err(reason) => {
            tracing::debug!(rpc = %desc, %reason, "request binding failed");
            return error_body(StatusCode::BAD_REQUEST, reason);
        }
    };

    let (service, method) = (desc.service.as_str(), desc.method.as_str());
    let result = match max_age {
        Some(_) => proxy.call::<Req, Resp>(&ctx, service, method, &bound).await,
        None => proxy.call_uncached::<Req, Resp>(&ctx, service, method, &bound).await,
    };
    match result {
        Ok(resp) => {
            let mut response = Json(resp).into_response();
            if let Some(max_age) = max_age {
                let headers = response.headers_mut();
                for (name, value) in cache_headers(max_age, Utc::now()) {
                    headers.insert(name, value);
                }
            }
            response
        }
        Err(err) => fabric_to_response(&err),
    }
}

/// `Cache-Control` and `Expires` for a response that stays fresh for
/// `max_age` after `now`.
fn cache_headers(max_age: Duration, now: DateTime<Utc>) -> Vec<(HeaderName, HeaderValue)> {
    let mut headers = Vec::with_capacity(2);
    let control = format!("public, max-age={}", max_age.as_secs());
    if let Ok(value) = HeaderValue::from_str(&control) {
        headers.push((CACHE_CONTROL, value));
    }
    let ttl = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
    let expires = (now + ttl).format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    if let Ok(value) = HeaderValue::from_str(&expires) {
        headers.push((EXPIRES, value));
    }
    headers
}

/// JSON body for `POST` with `application/json`, query string otherwise.
async fn bind<Req: DeserializeOwned>(req: Request) -> Result<Req, String> {
    let (parts, body) = req.into_parts();
    if parts.method == Method::POST && is_json(parts.headers.get(CONTENT_TYPE)) {
        let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| format!("failed to read body: {e}"))?;
        serde_json::from_slice(&bytes).map_err(|e| e.to_string())
    } else {
        Query::<Req>::try_from_uri(&parts.uri)
            .map(|Query(req)| req)
            .map_err(|e| e.body_text())
    }
}

fn is_json(content_type: Option<&HeaderValue>) -> bool {
    content_type
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use mall_proxy::{ConnectionManager, GrpcConnector, ProxyBuilder};
    use chrono::TimeZone;
    use mall_proto::v1::{LoginReq, LoginResp};
    use mall_types::ServiceEndpoint;
    use tower::ServiceExt;

    use super::*;
    use crate::routes::{gateway_router, mall_dispatch_table};

    /// Every dependency points at a closed local port.
    fn unreachable_router() -> Router {
        let endpoints = ["auth", "user", "product", "cart", "order", "payment", "checkout"]
            .into_iter()
            .map(|name| ServiceEndpoint::new(name, "127.0.0.1:1"));
        let conns = Arc::new(ConnectionManager::new(
            GrpcConnector::new(Duration::from_millis(200)),
            endpoints,
        ));
        let proxy = ProxyBuilder::new(conns, mall_dispatch_table()).build();
        gateway_router(proxy, GatewayConfig::default()).unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn welcome_route() {
        let resp = unreachable_router()
            .oneshot(axum::http::Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["code"], 200);
    }

    #[tokio::test]
    async fn malformed_json_is_400() {
        let resp = unreachable_router()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/login")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from("{\"email\": "))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = json_body(resp).await;
        assert_eq!(body["code"], 400);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn bad_query_parameter_is_400() {
        let resp = unreachable_router()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/product/get?id=abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unreachable_dependency_is_503_naming_it() {
        let resp = unreachable_router()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/order/place")
                    .header(CONTENT_TYPE, "application/json; charset=utf-8")
                    .body(Body::from(r#"{"user_id": 7, "email": "a@b.c"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(resp).await;
        assert_eq!(body["code"], 503);
        assert!(body["error"].as_str().unwrap().starts_with("order service unavailable"));
    }

    #[tokio::test]
    async fn wrong_http_method_is_rejected_by_router() {
        let resp = unreachable_router()
            .oneshot(
                axum::http::Request::builder()
                    .method("GET")
                    .uri("/order/place")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn route_to_missing_method_fails_at_build_time() {
        let conns = Arc::new(ConnectionManager::new(GrpcConnector::default(), Vec::new()));
        let proxy = ProxyBuilder::new(conns, mall_proxy::DispatchTable::new()).build();
        let err = Gateway::new(proxy, GatewayConfig::default())
            .route::<LoginReq, LoginResp>(MethodFilter::POST, "/login", "user", "Login")
            .err()
            .unwrap();
        assert!(matches!(err, FabricError::MethodNotFound(_)));
    }

    #[test]
    fn cached_responses_carry_max_age_and_expiry() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let headers = cache_headers(Duration::from_secs(300), now);
        assert_eq!(
            headers,
            vec![
                (CACHE_CONTROL, HeaderValue::from_static("public, max-age=300")),
                (EXPIRES, HeaderValue::from_static("Fri, 01 Mar 2024 12:05:00 GMT")),
            ]
        );
    }

    #[test]
    fn content_type_detection_ignores_parameters() {
        assert!(is_json(Some(&HeaderValue::from_static("application/json; charset=utf-8"))));
        assert!(!is_json(Some(&HeaderValue::from_static("application/x-www-form-urlencoded"))));
        assert!(!is_json(None));
    }
}
