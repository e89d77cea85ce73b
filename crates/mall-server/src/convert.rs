use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use mall_types::{CallContext, FabricError};
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn fabric_to_status(err: FabricError) -> Status {
    match &err {
        FabricError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
        FabricError::NotFound(_) => Status::not_found(err.to_string()),
        FabricError::Downstream { code, message } => {
            Status::new(Code::from(*code), message.clone())
        }
        FabricError::Timeout => Status::deadline_exceeded(err.to_string()),
        FabricError::Cancelled => Status::cancelled(err.to_string()),
        FabricError::ServiceUnavailable { .. }
        | FabricError::CircuitOpen(_)
        | FabricError::Saturated(_)
        | FabricError::Connection { .. } => Status::unavailable(err.to_string()),
        FabricError::UnknownService(_)
        | FabricError::MethodNotFound(_)
        | FabricError::InvalidContract { .. }
        | FabricError::Registration(_)
        | FabricError::Cache(_) => Status::internal(err.to_string()),
    }
}

pub fn http_status(err: &FabricError) -> StatusCode {
    match err {
        FabricError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        FabricError::NotFound(_) => StatusCode::NOT_FOUND,
        FabricError::Downstream { code, .. } => match Code::from(*code) {
            Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
                StatusCode::BAD_REQUEST
            }
            Code::Unauthenticated => StatusCode::UNAUTHORIZED,
            Code::PermissionDenied => StatusCode::FORBIDDEN,
            Code::NotFound => StatusCode::NOT_FOUND,
            Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
            Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        FabricError::ServiceUnavailable { .. }
        | FabricError::CircuitOpen(_)
        | FabricError::Saturated(_)
        | FabricError::Connection { .. } => StatusCode::SERVICE_UNAVAILABLE,
        FabricError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        // Client closed request; nobody reads this response.
        FabricError::Cancelled => {
            StatusCode::from_u16(499).unwrap_or(StatusCode::SERVICE_UNAVAILABLE)
        }
        FabricError::UnknownService(_)
        | FabricError::MethodNotFound(_)
        | FabricError::InvalidContract { .. }
        | FabricError::Registration(_)
        | FabricError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `{"code": <status>, "error": <message>}`.
pub fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::json!({ "code": status.as_u16(), "error": message.into() });
    (status, Json(body)).into_response()
}

pub fn fabric_to_response(err: &FabricError) -> Response {
    error_body(http_status(err), err.to_string())
}

/// Build the context for an inbound gRPC call: the caller's request id and
/// `grpc-timeout` carry over to every downstream call made on its behalf.
pub fn context_from_metadata(metadata: &MetadataMap) -> CallContext {
    let mut ctx = CallContext::new();
    if let Some(id) = metadata.get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()) {
        ctx = ctx.with_request_id(id);
    }
    if let Some(timeout) = metadata
        .get("grpc-timeout")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_grpc_timeout)
    {
        ctx = ctx.with_timeout(timeout);
    }
    ctx
}

/// `grpc-timeout` is at most 8 ASCII digits followed by a unit letter.
fn parse_grpc_timeout(raw: &str) -> Option<Duration> {
    if raw.len() < 2 || raw.len() > 9 {
        return None;
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    let n: u64 = digits.parse().ok()?;
    let d = match unit {
        "H" => Duration::from_secs(n * 3600),
        "M" => Duration::from_secs(n * 60),
        "S" => Duration::from_secs(n),
        "m" => Duration::from_millis(n),
        "u" => Duration::from_micros(n),
        "n" => Duration::from_nanos(n),
        _ => return None,
    };
    Some(d)
}

#[cfg(test)]
mod tests {
    use mall_types::MethodDescriptor;

    use super::*;

    #[test]
    fn degraded_dependency_is_503_naming_it() {
        let err = FabricError::ServiceUnavailable {
            service: "payment".into(),
            method: "Charge".into(),
            reason: "circuit open for payment.Charge".into(),
        };
        assert_eq!(http_status(&err), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(fabric_to_status(err).code(), Code::Unavailable);
    }

    #[test]
    fn contract_errors_are_internal() {
        let err = FabricError::MethodNotFound(MethodDescriptor::new("order", "Refund"));
        assert_eq!(http_status(&err), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(fabric_to_status(err).code(), Code::Internal);
    }

    #[test]
    fn timeouts_and_cancellation() {
        assert_eq!(http_status(&FabricError::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(http_status(&FabricError::Cancelled).as_u16(), 499);
    }

    #[test]
    fn downstream_codes_pass_through() {
        let err = FabricError::Downstream {
            code: Code::FailedPrecondition as i32,
            message: "cart is empty".into(),
        };
        assert_eq!(http_status(&err), StatusCode::BAD_REQUEST);
        let status = fabric_to_status(err);
        assert_eq!(status.code(), Code::FailedPrecondition);
        assert_eq!(status.message(), "cart is empty");
    }

    #[test]
    fn grpc_timeout_header_parses() {
        assert_eq!(parse_grpc_timeout("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse_grpc_timeout("3S"), Some(Duration::from_secs(3)));
        assert_eq!(parse_grpc_timeout("3x"), None);
        assert_eq!(parse_grpc_timeout("S"), None);
    }

    #[tokio::test]
    async fn metadata_carries_request_id() {
        let mut md = MetadataMap::new();
        md.insert(REQUEST_ID_HEADER, "req-42".parse().unwrap());
        md.insert("grpc-timeout", "500m".parse().unwrap());
        let ctx = context_from_metadata(&md);
        assert_eq!(ctx.request_id, "req-42");
        assert!(ctx.remaining().unwrap() <= Duration::from_millis(500));
    }
}
