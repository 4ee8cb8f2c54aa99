//! Per-network endpoint table

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use polyp_common::{PolypError, PolypResult};

use crate::provisioner::Provisioner;
use crate::types::{Endpoint, EndpointInterface, NetworkConfig};

/// Endpoints of one network on this host
///
/// The table lock is never held across a link operation. Callers that act
/// on the endpoint count (first endpoint in, last endpoint out) serialize
/// through the owning network's lock.
pub struct EndpointRegistry {
    endpoints: RwLock<HashMap<String, Endpoint>>,
    provisioner: Arc<Provisioner>,
}

impl EndpointRegistry {
    /// Creates an empty table
    pub fn new(provisioner: Arc<Provisioner>) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            provisioner,
        }
    }

    /// Fails with [`PolypError::EndpointExists`] if `id` is registered
    pub fn vacant(&self, id: &str) -> PolypResult<()> {
        if self.endpoints.read().contains_key(id) {
            return Err(PolypError::EndpointExists(id.to_string()));
        }
        Ok(())
    }

    /// Provisions the endpoint's veth pair and registers it
    ///
    /// On failure nothing is registered and the provisioner has already
    /// removed any partially created links.
    pub async fn create(
        &self,
        id: &str,
        interface: &EndpointInterface,
        config: &NetworkConfig,
    ) -> PolypResult<Endpoint> {
        self.vacant(id)?;
        let endpoint = self.provisioner.attach_endpoint(config, interface).await?;

        let registered = {
            let mut endpoints = self.endpoints.write();
            if endpoints.contains_key(id) {
                false
            } else {
                endpoints.insert(id.to_string(), endpoint.clone());
                true
            }
        };
        if !registered {
            warn!(endpoint = %id, "endpoint registered concurrently, releasing new veth");
            if let Err(e) = self.provisioner.detach_endpoint(&endpoint).await {
                warn!(endpoint = %id, error = %e, "failed to release veth");
            }
            return Err(PolypError::EndpointExists(id.to_string()));
        }
        Ok(endpoint)
    }

    /// Unregisters the endpoint and removes its veth pair
    ///
    /// The id is released before the links are touched; if removal fails
    /// the record is put back and the error returned.
    pub async fn delete(&self, id: &str) -> PolypResult<()> {
        let endpoint = self
            .endpoints
            .write()
            .remove(id)
            .ok_or_else(|| PolypError::NoSuchEndpoint(id.to_string()))?;

        if let Err(e) = self.provisioner.detach_endpoint(&endpoint).await {
            self.endpoints
                .write()
                .entry(id.to_string())
                .or_insert(endpoint);
            return Err(e);
        }

        debug!(endpoint = %id, "endpoint removed");
        Ok(())
    }

    /// Unregisters every endpoint and removes their veths
    ///
    /// Keeps going past failures and returns the first one.
    pub async fn clear(&self) -> PolypResult<()> {
        let drained: Vec<(String, Endpoint)> = self.endpoints.write().drain().collect();
        let mut first_error = None;
        for (id, endpoint) in drained {
            if let Err(e) = self.provisioner.detach_endpoint(&endpoint).await {
                warn!(endpoint = %id, error = %e, "failed to remove endpoint veth");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Number of registered endpoints
    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    /// Returns true if no endpoint is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up an endpoint
    pub fn get(&self, id: &str) -> PolypResult<Endpoint> {
        self.endpoints
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| PolypError::NoSuchEndpoint(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polyp_test::{MockLinks, OpKind};
    use std::net::Ipv4Addr;

    fn config() -> NetworkConfig {
        NetworkConfig {
            parent_name: "vlan42".to_string(),
            bridge_name: "bran42".to_string(),
            vlan: 42,
            mtu: 1500,
            enable_ipv6: false,
            gateway_ipv4: Ipv4Addr::new(10, 42, 0, 1),
            gateway_ipv6: None,
        }
    }

    fn interface() -> EndpointInterface {
        EndpointInterface {
            address: "10.42.0.2/16".to_string(),
            ..Default::default()
        }
    }

    async fn setup() -> (Arc<MockLinks>, EndpointRegistry) {
        let links = Arc::new(MockLinks::new().with_physical("eth0"));
        let provisioner = Arc::new(Provisioner::new(links.clone(), "eth0"));
        provisioner.ensure_link(&config()).await.unwrap();
        (links, EndpointRegistry::new(provisioner))
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (links, registry) = setup().await;
        assert!(registry.is_empty());

        let endpoint = registry.create("e1", &interface(), &config()).await.unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("e1").unwrap(), endpoint);
        assert!(links.has_link(&endpoint.ifname));

        assert!(matches!(
            registry.get("e2"),
            Err(PolypError::NoSuchEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_is_conflict() {
        let (links, registry) = setup().await;
        registry.create("e1", &interface(), &config()).await.unwrap();
        let veths = links.count(OpKind::AddVeth);

        assert!(matches!(registry.vacant("e1"), Err(PolypError::EndpointExists(_))));
        let err = registry
            .create("e1", &interface(), &config())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(links.count(OpKind::AddVeth), veths);
    }

    #[tokio::test]
    async fn test_failed_create_registers_nothing() {
        let (links, registry) = setup().await;
        links.fail_on(OpKind::SetUp);

        assert!(registry.create("e1", &interface(), &config()).await.is_err());
        assert!(registry.is_empty());
        registry.vacant("e1").unwrap();
    }

    #[tokio::test]
    async fn test_delete() {
        let (links, registry) = setup().await;
        let endpoint = registry.create("e1", &interface(), &config()).await.unwrap();

        registry.delete("e1").await.unwrap();
        assert!(registry.is_empty());
        assert!(!links.has_link(&endpoint.host_ifname));

        assert!(matches!(
            registry.delete("e1").await,
            Err(PolypError::NoSuchEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_delete_restores_record() {
        let (links, registry) = setup().await;
        let endpoint = registry.create("e1", &interface(), &config()).await.unwrap();
        links.fail_on_link(OpKind::Delete, &endpoint.ifname);

        assert!(registry.delete("e1").await.is_err());
        assert_eq!(registry.get("e1").unwrap(), endpoint);

        registry.delete("e1").await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_clear() {
        let (links, registry) = setup().await;
        let a = registry.create("a", &interface(), &config()).await.unwrap();
        let b = registry.create("b", &interface(), &config()).await.unwrap();

        registry.clear().await.unwrap();
        assert!(registry.is_empty());
        assert!(!links.has_link(&a.ifname));
        assert!(!links.has_link(&b.ifname));
    }
}
