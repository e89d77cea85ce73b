use std::collections::HashMap;

use bytes::Bytes;
use prost::Message;

use mall_types::{FabricError, MethodDescriptor};

/// What a degraded call returns instead of the downstream answer.
///
/// Receives the reason the primary path failed. `Ok` bytes must encode the
/// method's response type.
pub trait Fallback: Send + Sync + 'static {
    fn fallback(&self, desc: &MethodDescriptor, cause: &FabricError) -> Result<Bytes, FabricError>;
}

/// Surface every degraded call as `ServiceUnavailable`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailFast;

impl Fallback for FailFast {
    fn fallback(&self, desc: &MethodDescriptor, cause: &FabricError) -> Result<Bytes, FabricError> {
        Err(FabricError::ServiceUnavailable {
            service: desc.service.clone(),
            method: desc.method.clone(),
            reason: cause.to_string(),
        })
    }
}

/// Canned responses for selected methods; everything else fails fast.
#[derive(Debug, Clone, Default)]
pub struct StaticFallback {
    responses: HashMap<MethodDescriptor, Bytes>,
}

impl StaticFallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<Resp: Message>(mut self, service: &str, method: &str, resp: &Resp) -> Self {
        self.responses
            .insert(MethodDescriptor::new(service, method), Bytes::from(resp.encode_to_vec()));
        self
    }
}

impl Fallback for StaticFallback {
    fn fallback(&self, desc: &MethodDescriptor, cause: &FabricError) -> Result<Bytes, FabricError> {
        match self.responses.get(desc) {
            Some(bytes) => {
                tracing::debug!(method = %desc, cause = %cause, "serving static fallback");
                Ok(bytes.clone())
            }
            None => FailFast.fallback(desc, cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_fast_names_the_dependency() {
        let desc = MethodDescriptor::new("payment", "Charge");
        let err = FailFast.fallback(&desc, &FabricError::Timeout).unwrap_err();
        assert_eq!(
            err,
            FabricError::ServiceUnavailable {
                service: "payment".into(),
                method: "Charge".into(),
                reason: "operation timed out".into(),
            }
        );
        assert_eq!(err.to_string(), "payment service unavailable (Charge): operation timed out");
    }

    #[test]
    fn static_fallback_serves_only_configured_methods() {
        let fallback = StaticFallback::new().with("product", "ListProducts", &"cached".to_string());

        let hit = fallback
            .fallback(&MethodDescriptor::new("product", "ListProducts"), &FabricError::Timeout)
            .unwrap();
        assert_eq!(String::decode(hit).unwrap(), "cached");

        let get_product = MethodDescriptor::new("product", "GetProduct");
        let miss = fallback.fallback(&get_product, &FabricError::Timeout);
        assert!(matches!(miss, Err(FabricError::ServiceUnavailable { .. })));
    }
}
