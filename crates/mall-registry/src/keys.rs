/// Every registration lives under this prefix.
pub const SERVICES_PREFIX: &str = "/services/";

/// `/services/{service_name}` → `host:port`
pub fn service_key(name: &str) -> String {
    let mut key = String::with_capacity(SERVICES_PREFIX.len() + name.len());
    key.push_str(SERVICES_PREFIX);
    key.push_str(name);
    key
}

/// Inverse of [`service_key`]; `None` for keys outside the services prefix.
pub fn service_name(key: &str) -> Option<&str> {
    key.strip_prefix(SERVICES_PREFIX).filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_key_layout() {
        assert_eq!(service_key("orders"), "/services/orders");
    }

    #[test]
    fn service_name_round_trips() {
        assert_eq!(service_name(&service_key("cart")), Some("cart"));
    }

    #[test]
    fn foreign_keys_are_rejected() {
        assert_eq!(service_name("/policies/cart"), None);
        assert_eq!(service_name("/services/"), None);
    }
}
