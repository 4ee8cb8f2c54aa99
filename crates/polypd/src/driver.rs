//! Network driver
//!
//! [`Driver`] implements the remote network-driver operations on top of the
//! [`NetworkRegistry`]. It validates requests and reports failures as
//! [`PolypError`]; the protocol server turns them into `{"Err": ...}`
//! replies.
//!
//! Operations that change links or the shared store run on their own task.
//! The caller's future may be dropped (the engine hung up) without
//! interrupting a sequence halfway; the operation completes and its result
//! is discarded.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, instrument, warn, Instrument};

use polyp_common::{PolypError, PolypResult};

use crate::keys::CONTAINER_IFACE_PREFIX;
use crate::networks::NetworkRegistry;
use crate::options::{parse_ipam, NetworkOptions};
use crate::types::{
    CapabilitiesResponse, CreateEndpointRequest, CreateEndpointResponse, CreateNetworkRequest,
    DeleteNetworkRequest, EndpointInfoResponse, EndpointRequest, InterfaceName, JoinRequest,
    JoinResponse, Scope,
};

/// Runs `op` to completion on a separate task and waits for its result
async fn detached<T, F>(op: F) -> PolypResult<T>
where
    F: Future<Output = PolypResult<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(op.in_current_span())
        .await
        .map_err(|e| PolypError::internal(format!("driver task failed: {e}")))?
}

/// VLAN/bridge network driver
pub struct Driver {
    scope: Scope,
    default_mtu: u32,
    networks: Arc<NetworkRegistry>,
}

impl Driver {
    /// Creates a driver over `networks`
    pub fn new(scope: Scope, default_mtu: u32, networks: Arc<NetworkRegistry>) -> Self {
        Self {
            scope,
            default_mtu,
            networks,
        }
    }

    /// The network registry
    pub fn networks(&self) -> &Arc<NetworkRegistry> {
        &self.networks
    }

    /// Reports the driver scope
    pub fn get_capabilities(&self) -> CapabilitiesResponse {
        CapabilitiesResponse {
            scope: self.scope,
            connectivity_scope: self.scope,
        }
    }

    /// Parses the network definition and records it
    #[instrument(skip(self, rq), fields(network = %rq.network_id))]
    pub async fn create_network(&self, rq: CreateNetworkRequest) -> PolypResult<()> {
        debug!(options = ?rq.options, ipv4 = ?rq.ipv4_data, ipv6 = ?rq.ipv6_data, "create network request");

        let options = NetworkOptions::parse(rq.options.as_ref())?;
        if options.enable_ipv6 {
            warn!("IPv6 requested but not supported, rejecting network");
            return Err(PolypError::Ipv6Unsupported);
        }
        let gateways = parse_ipam(&rq.network_id, &rq.ipv4_data, &rq.ipv6_data)?;
        let config = options.into_config(gateways, self.default_mtu);

        let networks = self.networks.clone();
        detached(async move { networks.create(&rq.network_id, config).await }).await
    }

    /// Deletes the network here and in the shared store
    #[instrument(skip(self, rq), fields(network = %rq.network_id))]
    pub async fn delete_network(&self, rq: DeleteNetworkRequest) -> PolypResult<()> {
        let networks = self.networks.clone();
        detached(async move { networks.delete(&rq.network_id).await }).await
    }

    /// Creates the endpoint's veth pair, provisioning the network's links
    /// for the first endpoint
    #[instrument(skip(self, rq), fields(network = %rq.network_id, endpoint = %rq.endpoint_id))]
    pub async fn create_endpoint(
        &self,
        rq: CreateEndpointRequest,
    ) -> PolypResult<CreateEndpointResponse> {
        let CreateEndpointRequest {
            network_id,
            endpoint_id,
            interface,
            ..
        } = rq;
        let Some(interface) = interface else {
            return Err(PolypError::InvalidInterface(
                "interface not given".to_string(),
            ));
        };

        let networks = self.networks.clone();
        detached(async move {
            let network = networks.get(&network_id).await?;
            let endpoint = network.add_endpoint(&endpoint_id, &interface).await?;
            debug!(host = %endpoint.host_ifname, sandbox = %endpoint.ifname, "endpoint created");
            Ok(CreateEndpointResponse::default())
        })
        .await
    }

    /// Deletes the endpoint, removing the network's links after the last
    /// one
    #[instrument(skip(self, rq), fields(network = %rq.network_id, endpoint = %rq.endpoint_id))]
    pub async fn delete_endpoint(&self, rq: EndpointRequest) -> PolypResult<()> {
        let networks = self.networks.clone();
        detached(async move {
            let network = networks.get(&rq.network_id).await?;
            network.remove_endpoint(&rq.endpoint_id).await
        })
        .await
    }

    /// Describes a registered endpoint
    pub async fn endpoint_info(&self, rq: EndpointRequest) -> PolypResult<EndpointInfoResponse> {
        let network = self.networks.get(&rq.network_id).await?;
        let endpoint = network.endpoints().get(&rq.endpoint_id)?;

        let mut value = HashMap::new();
        value.insert("HostInterface".to_string(), endpoint.host_ifname);
        value.insert("SandboxInterface".to_string(), endpoint.ifname);
        value.insert("Address".to_string(), endpoint.addr.to_string());
        if let Some(addr_v6) = endpoint.addr_v6 {
            value.insert("AddressIPv6".to_string(), addr_v6.to_string());
        }
        if let Some(mac) = endpoint.mac {
            value.insert("MacAddress".to_string(), mac.to_string());
        }
        Ok(EndpointInfoResponse { value })
    }

    /// Tells the engine which interface to move into the sandbox and which
    /// gateway to use
    #[instrument(skip(self, rq), fields(network = %rq.network_id, endpoint = %rq.endpoint_id, sandbox = %rq.sandbox_key))]
    pub async fn join(&self, rq: JoinRequest) -> PolypResult<JoinResponse> {
        let network = self.networks.get(&rq.network_id).await?;
        let endpoint = network.endpoints().get(&rq.endpoint_id)?;

        Ok(JoinResponse {
            interface_name: InterfaceName {
                src_name: endpoint.ifname,
                dst_prefix: CONTAINER_IFACE_PREFIX.to_string(),
            },
            gateway: network.config().gateway_ipv4.to_string(),
        })
    }

    /// Nothing to undo: links go away with the endpoint
    pub async fn leave(&self, rq: EndpointRequest) -> PolypResult<()> {
        debug!(network = %rq.network_id, endpoint = %rq.endpoint_id, "leave");
        Ok(())
    }

    /// Stops all watchers; links and records are left in place
    pub async fn shutdown(&self) {
        self.networks.shutdown().await;
    }
}
