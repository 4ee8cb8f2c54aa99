//! Request fixtures
//!
//! Builders for the JSON bodies the container engine posts to a network
//! driver. They produce [`serde_json::Value`] so the same fixture can drive
//! both the typed driver API (via `serde_json::from_value`) and the HTTP
//! server.

use serde_json::{json, Map, Value};

/// Option key carrying the driver-specific `-o key=value` labels.
pub const GENERIC_OPTIONS: &str = "com.docker.network.generic";

/// Default IPv4 pool used by the fixtures.
pub const DEFAULT_POOL: &str = "10.42.0.0/16";

/// Default gateway used by the fixtures, CIDR form as the engine sends it.
pub const DEFAULT_GATEWAY: &str = "10.42.0.1/16";

/// Builder for a `NetworkDriver.CreateNetwork` body.
#[derive(Debug, Clone)]
pub struct NetworkRequest {
    network_id: String,
    generic: Option<Map<String, Value>>,
    top_level: Map<String, Value>,
    ipv4: Vec<Value>,
    ipv6: Vec<Value>,
}

impl NetworkRequest {
    /// A network with one IPv4 pool and no labels.
    pub fn new(network_id: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            generic: Some(Map::new()),
            top_level: Map::new(),
            ipv4: vec![ipam_entry(DEFAULT_POOL, DEFAULT_GATEWAY)],
            ipv6: Vec::new(),
        }
    }

    /// Adds a driver label (`-o key=value`).
    pub fn with_option(mut self, key: &str, value: impl Into<String>) -> Self {
        self.generic
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), Value::String(value.into()));
        self
    }

    /// Sets the `vlan` label.
    pub fn with_vlan(self, vlan: u16) -> Self {
        self.with_option("vlan", vlan.to_string())
    }

    /// Adds an engine-level option next to the generic map.
    pub fn with_engine_option(mut self, key: &str, value: Value) -> Self {
        self.top_level.insert(key.to_string(), value);
        self
    }

    /// Drops the generic option map entirely.
    pub fn without_options(mut self) -> Self {
        self.generic = None;
        self
    }

    /// Replaces the IPv4 data with the given entries.
    pub fn with_ipv4(mut self, entries: Vec<Value>) -> Self {
        self.ipv4 = entries;
        self
    }

    /// Replaces the IPv6 data with the given entries.
    pub fn with_ipv6(mut self, entries: Vec<Value>) -> Self {
        self.ipv6 = entries;
        self
    }

    /// The request body.
    pub fn to_json(&self) -> Value {
        let mut options = self.top_level.clone();
        if let Some(generic) = &self.generic {
            options.insert(GENERIC_OPTIONS.to_string(), Value::Object(generic.clone()));
        }
        json!({
            "NetworkID": self.network_id,
            "Options": options,
            "IPv4Data": self.ipv4,
            "IPv6Data": self.ipv6,
        })
    }
}

/// One IPAM data entry.
pub fn ipam_entry(pool: &str, gateway: &str) -> Value {
    json!({
        "AddressSpace": "LocalDefault",
        "Pool": pool,
        "Gateway": gateway,
        "AuxAddresses": {},
    })
}

/// `NetworkDriver.CreateEndpoint` body. An empty `mac` is omitted.
pub fn endpoint_request(network_id: &str, endpoint_id: &str, address: &str, mac: &str) -> Value {
    let mut interface = Map::new();
    interface.insert("Address".to_string(), json!(address));
    if !mac.is_empty() {
        interface.insert("MacAddress".to_string(), json!(mac));
    }
    json!({
        "NetworkID": network_id,
        "EndpointID": endpoint_id,
        "Interface": interface,
        "Options": {},
    })
}

/// Body naming one endpoint (DeleteEndpoint, EndpointOperInfo, Leave).
pub fn endpoint_ref(network_id: &str, endpoint_id: &str) -> Value {
    json!({
        "NetworkID": network_id,
        "EndpointID": endpoint_id,
    })
}

/// `NetworkDriver.Join` body.
pub fn join_request(network_id: &str, endpoint_id: &str, sandbox_key: &str) -> Value {
    json!({
        "NetworkID": network_id,
        "EndpointID": endpoint_id,
        "SandboxKey": sandbox_key,
        "Options": {},
    })
}

/// `NetworkDriver.DeleteNetwork` body.
pub fn delete_network_request(network_id: &str) -> Value {
    json!({ "NetworkID": network_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_request_shape() {
        let body = NetworkRequest::new("n1").with_vlan(42).to_json();
        assert_eq!(body["NetworkID"], "n1");
        assert_eq!(body["Options"][GENERIC_OPTIONS]["vlan"], "42");
        assert_eq!(body["IPv4Data"][0]["Gateway"], DEFAULT_GATEWAY);
        assert_eq!(body["IPv6Data"].as_array().map(Vec::len), Some(0));
    }

    #[test]
    fn test_without_options() {
        let body = NetworkRequest::new("n1").without_options().to_json();
        assert!(body["Options"].get(GENERIC_OPTIONS).is_none());
    }

    #[test]
    fn test_endpoint_request_omits_empty_mac() {
        let body = endpoint_request("n1", "e1", "10.42.0.2/16", "");
        assert!(body["Interface"].get("MacAddress").is_none());
    }
}
