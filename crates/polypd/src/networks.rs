//! Network registry
//!
//! [`NetworkRegistry`] is this host's cache of network definitions, kept
//! consistent with the shared store. Every cached [`Network`] has a
//! watcher task (see [`crate::watcher`]) that evicts it, and tears down
//! its links, when the shared record disappears.
//!
//! # Locking
//!
//! - each network id has a gate serializing its store-touching sequences:
//!   create, cache-fill and delete, plus watcher eviction. Acquired first.
//!   Sequences on different ids run concurrently.
//! - the cache map lock is only held for short synchronous sections, never
//!   across an await.
//! - each network's state lock serializes endpoint-count transitions and
//!   teardown of that network.
//!
//! Removing a network from the map is the point that decides who tears it
//! down. An explicit delete cancels the network's watcher while holding
//! the map lock and waits for the task to exit before tearing down; the
//! watcher only evicts if its token is not cancelled and the cached entry
//! is still the one it watches, checked under the same lock.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{MutexGuard, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use polyp_common::{PolypError, PolypResult};
use polyp_store::KvStore;

use crate::endpoints::EndpointRegistry;
use crate::keys::network_key;
use crate::provisioner::Provisioner;
use crate::types::{Endpoint, EndpointInterface, NetworkConfig};
use crate::watcher;

/// Mutable per-network state guarded by the network lock
#[derive(Debug, Default)]
pub struct NetworkState {
    evicted: bool,
}

impl NetworkState {
    /// Returns true once the network has been torn down on this host
    pub fn is_evicted(&self) -> bool {
        self.evicted
    }
}

/// A network known to this host
pub struct Network {
    id: String,
    config: NetworkConfig,
    endpoints: EndpointRegistry,
    provisioner: Arc<Provisioner>,
    state: tokio::sync::Mutex<NetworkState>,
    cancel: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Network {
    fn new(
        id: &str,
        config: NetworkConfig,
        provisioner: Arc<Provisioner>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: id.to_string(),
            config,
            endpoints: EndpointRegistry::new(provisioner.clone()),
            provisioner,
            state: tokio::sync::Mutex::new(NetworkState::default()),
            cancel,
            watcher: Mutex::new(None),
        }
    }

    /// Network identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stored definition
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Endpoints registered on this host
    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    /// Takes the network lock
    pub async fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().await
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Registers an endpoint, provisioning the network's links if it is
    /// the first one
    ///
    /// If the endpoint cannot be created and the links were provisioned by
    /// this call, they are removed again.
    pub async fn add_endpoint(
        &self,
        endpoint_id: &str,
        interface: &EndpointInterface,
    ) -> PolypResult<Endpoint> {
        let state = self.lock().await;
        if state.is_evicted() {
            return Err(PolypError::NoSuchNetwork(self.id.clone()));
        }
        self.endpoints.vacant(endpoint_id)?;

        let first = self.endpoints.is_empty();
        if first {
            self.provisioner.ensure_link(&self.config).await?;
        }

        match self
            .endpoints
            .create(endpoint_id, interface, &self.config)
            .await
        {
            Ok(endpoint) => Ok(endpoint),
            Err(e) => {
                if first && self.endpoints.is_empty() {
                    if let Err(teardown) = self.provisioner.teardown_link(&self.config).await {
                        warn!(network = %self.id, error = %teardown, "failed to roll back network links");
                    }
                }
                Err(e)
            }
        }
    }

    /// Unregisters an endpoint, removing the network's links if it was the
    /// last one
    pub async fn remove_endpoint(&self, endpoint_id: &str) -> PolypResult<()> {
        let state = self.lock().await;
        if state.is_evicted() {
            return Err(PolypError::NoSuchNetwork(self.id.clone()));
        }

        self.endpoints.delete(endpoint_id).await?;
        if self.endpoints.is_empty() {
            self.provisioner.teardown_link(&self.config).await?;
        }
        Ok(())
    }

    /// Removes every endpoint and the network's links
    ///
    /// Runs at most once per network; later calls return immediately.
    pub(crate) async fn teardown(&self) -> PolypResult<()> {
        let mut state = self.lock().await;
        if state.evicted {
            return Ok(());
        }
        state.evicted = true;

        let endpoints = self.endpoints.clear().await;
        let links = self.provisioner.teardown_link(&self.config).await;
        endpoints.and(links)
    }

    fn set_watcher(&self, handle: JoinHandle<()>) {
        *self.watcher.lock() = Some(handle);
    }

    /// Waits for the watcher task to exit. Its token must be cancelled.
    async fn join_watcher(&self) {
        let handle = self.watcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(network = %self.id, error = %e, "watcher task failed");
            }
        }
    }
}

/// Cache of networks known to this host, backed by the shared store
pub struct NetworkRegistry {
    networks: RwLock<HashMap<String, Arc<Network>>>,
    store: Arc<dyn KvStore>,
    provisioner: Arc<Provisioner>,
    namespace: String,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    shutdown: CancellationToken,
}

impl NetworkRegistry {
    /// Creates an empty registry
    pub fn new(
        store: Arc<dyn KvStore>,
        provisioner: Arc<Provisioner>,
        namespace: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            networks: RwLock::new(HashMap::new()),
            store,
            provisioner,
            namespace: namespace.into(),
            gates: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Shared-store key of a network
    pub fn key(&self, id: &str) -> String {
        network_key(&self.namespace, id)
    }

    pub(crate) fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Takes the gate of network `id`
    ///
    /// Gates nobody holds or waits for are dropped on the way.
    pub(crate) async fn lock_network(&self, id: &str) -> OwnedMutexGuard<()> {
        let gate = {
            let mut gates = self.gates.lock();
            gates.retain(|key, gate| key.as_str() == id || Arc::strong_count(gate) > 1);
            gates.entry(id.to_string()).or_default().clone()
        };
        gate.lock_owned().await
    }

    /// Returns the cached network, if any, without consulting the store
    pub fn get_local(&self, id: &str) -> Option<Arc<Network>> {
        self.networks.read().get(id).cloned()
    }

    /// Identifiers of cached networks
    pub fn local_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.networks.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Caches a network and starts its watcher. Caller holds its gate.
    fn insert(self: &Arc<Self>, id: &str, config: NetworkConfig) -> Arc<Network> {
        let network = Arc::new(Network::new(
            id,
            config,
            self.provisioner.clone(),
            self.shutdown.child_token(),
        ));
        self.networks
            .write()
            .insert(id.to_string(), network.clone());

        let handle = tokio::spawn(watcher::watch_network(
            Arc::downgrade(self),
            network.clone(),
            self.key(id),
        ));
        network.set_watcher(handle);
        network
    }

    /// Records a new network in the shared store, then caches it
    ///
    /// Fails if the network is known locally or in the store.
    #[instrument(skip(self, config))]
    pub async fn create(self: &Arc<Self>, id: &str, config: NetworkConfig) -> PolypResult<()> {
        let _gate = self.lock_network(id).await;
        let key = self.key(id);

        if self.networks.read().contains_key(id) || self.store.exists(&key).await? {
            return Err(PolypError::NetworkExists(id.to_string()));
        }

        self.store.put(&key, config.to_bytes()?).await?;
        self.insert(id, config);
        info!(network = %id, "network created");
        Ok(())
    }

    /// Looks a network up, filling the cache from the shared store on a
    /// local miss
    pub async fn get(self: &Arc<Self>, id: &str) -> PolypResult<Arc<Network>> {
        if let Some(network) = self.get_local(id) {
            return Ok(network);
        }

        let _gate = self.lock_network(id).await;
        if let Some(network) = self.get_local(id) {
            return Ok(network);
        }

        match self.store.get(&self.key(id)).await? {
            Some(bytes) => {
                let config = NetworkConfig::from_bytes(&bytes)?;
                debug!(network = %id, "network loaded from shared store");
                Ok(self.insert(id, config))
            }
            None => Err(PolypError::NoSuchNetwork(id.to_string())),
        }
    }

    /// Deletes a network locally and from the shared store
    ///
    /// The local side (watcher, endpoints, links, cache entry) and the
    /// remote record are handled independently; either may already be
    /// gone. Fails with [`PolypError::NoSuchNetwork`] only if both are.
    /// A local teardown failure does not stop the remote delete but is
    /// returned afterwards.
    ///
    /// Not cancel-safe: a caller that may be dropped midway runs it on its
    /// own task, as [`crate::Driver`] does.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> PolypResult<()> {
        let _gate = self.lock_network(id).await;
        let key = self.key(id);

        let removed = {
            let mut networks = self.networks.write();
            let removed = networks.remove(id);
            if let Some(network) = &removed {
                network.cancel_token().cancel();
            }
            removed
        };

        let mut local = Ok(());
        if let Some(network) = &removed {
            network.join_watcher().await;
            local = network.teardown().await;
            debug!(network = %id, "local network state removed");
        }

        let remote = self.store.exists(&key).await?;
        if remote {
            self.store.delete(&key).await?;
        }

        if removed.is_none() && !remote {
            return Err(PolypError::NoSuchNetwork(id.to_string()));
        }
        info!(network = %id, local = removed.is_some(), remote, "network deleted");
        local
    }

    /// Drops `network` from the cache after its shared record was deleted
    /// elsewhere, then tears it down
    ///
    /// Does nothing if the watcher was cancelled or the cache now holds a
    /// different network under the same id. Caller holds its gate.
    pub(crate) async fn evict(&self, network: &Arc<Network>) -> PolypResult<bool> {
        let removed = {
            let mut networks = self.networks.write();
            let current = networks
                .get(network.id())
                .is_some_and(|cached| Arc::ptr_eq(cached, network));
            if current && !network.cancel_token().is_cancelled() {
                networks.remove(network.id());
                true
            } else {
                false
            }
        };

        if !removed {
            return Ok(false);
        }
        info!(network = %network.id(), "network deleted remotely, tearing down");
        network.teardown().await?;
        Ok(true)
    }

    /// Stops every watcher without tearing anything down
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let networks: Vec<Arc<Network>> = self.networks.read().values().cloned().collect();
        for network in networks {
            network.join_watcher().await;
        }
        debug!("network watchers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polyp_store::MemoryStore;
    use polyp_test::{MockLinks, OpKind};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use std::time::Duration;

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

    fn interface(address: &str) -> EndpointInterface {
        EndpointInterface {
            address: address.to_string(),
            ..Default::default()
        }
    }

    fn host(store: &MemoryStore) -> (Arc<MockLinks>, Arc<NetworkRegistry>) {
        let links = Arc::new(MockLinks::new().with_physical("eth0"));
        let provisioner = Arc::new(Provisioner::new(links.clone(), "eth0"));
        let registry = NetworkRegistry::new(Arc::new(store.clone()), provisioner, "polyp");
        (links, registry)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_create_writes_store_then_cache() {
        let store = MemoryStore::new();
        let (_, registry) = host(&store);

        registry.create("n1", config()).await.unwrap();
        assert!(store.exists("polyp/network/n1").await.unwrap());
        assert_eq!(registry.local_ids(), vec!["n1".to_string()]);
        assert_eq!(registry.get("n1").await.unwrap().config(), &config());
    }

    #[tokio::test]
    async fn test_create_rejects_existing() {
        let store = MemoryStore::new();
        let (_, a) = host(&store);
        let (_, b) = host(&store);

        a.create("n1", config()).await.unwrap();
        assert!(matches!(
            a.create("n1", config()).await,
            Err(PolypError::NetworkExists(_))
        ));
        // Known remotely only.
        assert!(matches!(
            b.create("n1", config()).await,
            Err(PolypError::NetworkExists(_))
        ));
    }

    #[tokio::test]
    async fn test_get_fills_cache_from_store() {
        let store = MemoryStore::new();
        let (_, a) = host(&store);
        let (_, b) = host(&store);

        a.create("n1", config()).await.unwrap();
        assert!(b.get_local("n1").is_none());

        let network = b.get("n1").await.unwrap();
        assert_eq!(network.config(), &config());
        assert!(b.get_local("n1").is_some());

        assert!(matches!(
            b.get("missing").await,
            Err(PolypError::NoSuchNetwork(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_local_and_remote() {
        let store = MemoryStore::new();
        let (links, registry) = host(&store);

        registry.create("n1", config()).await.unwrap();
        let network = registry.get("n1").await.unwrap();
        network.add_endpoint("e1", &interface("10.42.0.2/16")).await.unwrap();
        assert!(links.has_link("bran42"));

        registry.delete("n1").await.unwrap();
        assert!(registry.get_local("n1").is_none());
        assert!(store.is_empty());
        assert!(!links.has_link("bran42"));
        assert!(!links.has_link("vlan42"));
        assert!(network.lock().await.is_evicted());
    }

    #[tokio::test]
    async fn test_delete_remote_only() {
        let store = MemoryStore::new();
        let (_, a) = host(&store);
        let (links_b, b) = host(&store);

        a.create("n1", config()).await.unwrap();
        b.delete("n1").await.unwrap();
        assert!(store.is_empty());
        assert_eq!(links_b.count(OpKind::Exists), 0);
    }

    #[tokio::test]
    async fn test_delete_unknown() {
        let store = MemoryStore::new();
        let (_, registry) = host(&store);
        let err = registry.delete("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_reports_teardown_failure_after_remote_delete() {
        let store = MemoryStore::new();
        let (links, registry) = host(&store);

        registry.create("n1", config()).await.unwrap();
        let network = registry.get("n1").await.unwrap();
        network.add_endpoint("e1", &interface("10.42.0.2/16")).await.unwrap();
        links.fail_on_link(OpKind::Delete, "bran42");

        assert!(matches!(
            registry.delete("n1").await,
            Err(PolypError::Link { .. })
        ));
        assert!(store.is_empty());
        assert!(registry.get_local("n1").is_none());
    }

    #[tokio::test]
    async fn test_endpoint_count_drives_links() {
        let store = MemoryStore::new();
        let (links, registry) = host(&store);
        registry.create("n1", config()).await.unwrap();
        let network = registry.get("n1").await.unwrap();

        network.add_endpoint("a", &interface("10.42.0.2/16")).await.unwrap();
        network.add_endpoint("b", &interface("10.42.0.3/16")).await.unwrap();
        network.remove_endpoint("a").await.unwrap();
        assert!(links.has_link("bran42"));
        network.remove_endpoint("b").await.unwrap();

        assert_eq!(links.count(OpKind::AddBridge), 1);
        assert_eq!(links.count_on(OpKind::Delete, "bran42"), 1);
        assert!(!links.has_link("bran42"));
    }

    #[tokio::test]
    async fn test_failed_first_endpoint_rolls_back_links() {
        let store = MemoryStore::new();
        let (links, registry) = host(&store);
        registry.create("n1", config()).await.unwrap();
        let network = registry.get("n1").await.unwrap();

        links.fail_on(OpKind::AddVeth);
        assert!(network
            .add_endpoint("a", &interface("10.42.0.2/16"))
            .await
            .is_err());
        assert!(network.endpoints().is_empty());
        assert!(!links.has_link("bran42"));
        assert!(!links.has_link("vlan42"));
    }

    #[tokio::test]
    async fn test_watcher_evicts_on_remote_delete() {
        let store = MemoryStore::new();
        let (links, a) = host(&store);
        let (_, b) = host(&store);

        a.create("n1", config()).await.unwrap();
        let network = a.get("n1").await.unwrap();
        network.add_endpoint("e1", &interface("10.42.0.2/16")).await.unwrap();

        b.delete("n1").await.unwrap();
        wait_until(|| a.get_local("n1").is_none()).await;
        wait_until(|| !links.has_link("bran42")).await;
        assert!(!links.has_link("vlan42"));
        assert!(network.endpoints().is_empty());
    }

    #[tokio::test]
    async fn test_evicted_network_rejects_endpoints() {
        let store = MemoryStore::new();
        let (_, registry) = host(&store);
        registry.create("n1", config()).await.unwrap();
        let network = registry.get("n1").await.unwrap();

        registry.delete("n1").await.unwrap();
        assert!(matches!(
            network.add_endpoint("late", &interface("10.42.0.9/16")).await,
            Err(PolypError::NoSuchNetwork(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_keeps_links() {
        let store = MemoryStore::new();
        let (links, registry) = host(&store);
        registry.create("n1", config()).await.unwrap();
        let network = registry.get("n1").await.unwrap();
        network.add_endpoint("e1", &interface("10.42.0.2/16")).await.unwrap();

        registry.shutdown().await;
        store.delete("polyp/network/n1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(links.has_link("bran42"));
        assert!(registry.get_local("n1").is_some());
    }

    #[tokio::test]
    async fn test_slow_teardown_does_not_block_other_networks() {
        let store = MemoryStore::new();
        let (links, registry) = host(&store);
        registry.create("n1", config()).await.unwrap();
        let network = registry.get("n1").await.unwrap();
        network.add_endpoint("e1", &interface("10.42.0.2/16")).await.unwrap();

        links.slow_on(OpKind::SetDown, Duration::from_millis(300));
        let deleting = tokio::spawn({
            let registry = registry.clone();
            async move { registry.delete("n1").await }
        });
        wait_until(|| registry.get_local("n1").is_none()).await;

        let other = NetworkConfig {
            parent_name: "vlan43".to_string(),
            bridge_name: "bran43".to_string(),
            vlan: 43,
            ..config()
        };
        tokio::time::timeout(Duration::from_millis(100), async {
            registry.create("n2", other).await.unwrap();
            registry.get("n2").await.unwrap();
            registry.delete("n2").await.unwrap();
        })
        .await
        .expect("n2 waited for n1's teardown");

        deleting.await.unwrap().unwrap();
        assert!(store.is_empty());
        assert_eq!(links.link_names(), vec!["eth0".to_string()]);
    }
}
