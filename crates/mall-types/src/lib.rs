use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Opaque lease identifier handed out by the registry store.
pub type LeaseId = i64;

/// A downstream dependency as known to one process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ServiceEndpoint {
    pub name: String,
    pub address: String,
}

impl ServiceEndpoint {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        ServiceEndpoint { name: name.into(), address: address.into() }
    }
}

/// Identity of a remote operation, independent of its message types.
///
/// Doubles as the circuit identity and the dispatch-table key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct MethodDescriptor {
    pub service: String,
    pub method: String,
}

impl MethodDescriptor {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        MethodDescriptor { service: service.into(), method: method.into() }
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.method)
    }
}

/// Per-call context: caller deadline, cancellation, and a request id that is
/// forwarded to downstream services.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub request_id: String,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new() -> Self {
        CallContext {
            request_id: uuid::Uuid::new_v4().to_string(),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Tightens the deadline; a later deadline than the current one is ignored.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time left before the deadline; `None` when the caller set no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// `cap` bounded by whatever the caller has left.
    pub fn bounded_timeout(&self, cap: Duration) -> Duration {
        match self.remaining() {
            Some(left) => left.min(cap),
            None => cap,
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FabricError {
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error("connection to {service} failed: {reason}")]
    Connection { service: String, reason: String },
    #[error("method not found: {0}")]
    MethodNotFound(MethodDescriptor),
    #[error("invalid contract for {method}: {reason}")]
    InvalidContract { method: MethodDescriptor, reason: String },
    #[error("circuit open for {0}")]
    CircuitOpen(MethodDescriptor),
    #[error("too many concurrent calls to {0}")]
    Saturated(MethodDescriptor),
    #[error("{service} service unavailable ({method}): {reason}")]
    ServiceUnavailable { service: String, method: String, reason: String },
    #[error("registration failed: {0}")]
    Registration(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{message}")]
    Downstream { code: i32, message: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("operation timed out")]
    Timeout,
    #[error("call cancelled")]
    Cancelled,
    #[error("cache error: {0}")]
    Cache(String),
}

impl FabricError {
    /// Errors that point at a broken dispatch table or endpoint configuration
    /// rather than at a misbehaving dependency.
    pub fn is_contract_error(&self) -> bool {
        matches!(
            self,
            FabricError::UnknownService(_)
                | FabricError::MethodNotFound(_)
                | FabricError::InvalidContract { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_displays_as_circuit_name() {
        let d = MethodDescriptor::new("order", "PlaceOrder");
        assert_eq!(d.to_string(), "order.PlaceOrder");
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_timeout_never_exceeds_caller_deadline() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(300));
        assert_eq!(ctx.bounded_timeout(Duration::from_secs(1)), Duration::from_millis(300));

        let open = CallContext::new();
        assert_eq!(open.bounded_timeout(Duration::from_secs(1)), Duration::from_secs(1));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn later_deadline_does_not_extend_context() {
        let ctx = CallContext::new()
            .with_timeout(Duration::from_millis(100))
            .with_timeout(Duration::from_secs(10));
        assert_eq!(ctx.remaining(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn contract_errors_are_classified() {
        assert!(FabricError::UnknownService("x".into()).is_contract_error());
        assert!(FabricError::MethodNotFound(MethodDescriptor::new("a", "b")).is_contract_error());
        assert!(!FabricError::Timeout.is_contract_error());
    }
}
