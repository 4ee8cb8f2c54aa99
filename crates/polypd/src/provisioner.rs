//! Link topology provisioning
//!
//! [`Provisioner`] creates and removes the kernel objects behind a network
//! (VLAN sub-interface plus bridge) and behind an endpoint (veth pair).
//! Creation is rollback-safe: a failing step removes whatever the same call
//! already created. Removal is idempotent: links that are already gone are
//! skipped.

use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use polyp_common::{LinkOps, PolypError, PolypResult};

use crate::keys::{VETH_LEN, VETH_PREFIX};
use crate::types::{Endpoint, EndpointInterface, IpCidr, MacAddr, NetworkConfig};

/// Attempts at finding an unused veth name before giving up.
const NAME_ATTEMPTS: usize = 8;

const NAME_CHARS: &[u8] = b"0123456789abcdef";

/// Generates `<prefix><len random hex chars>`.
fn generate_iface_name(prefix: &str, len: usize) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..len)
        .map(|_| NAME_CHARS[rng.gen_range(0..NAME_CHARS.len())] as char)
        .collect();
    format!("{}{}", prefix, suffix)
}

/// Creates and removes link topology through a [`LinkOps`] backend
pub struct Provisioner {
    links: Arc<dyn LinkOps>,
    /// Physical interface VLAN sub-interfaces are created on
    parent: String,
}

impl Provisioner {
    /// Creates a provisioner building VLANs on `parent`
    pub fn new(links: Arc<dyn LinkOps>, parent: impl Into<String>) -> Self {
        Self {
            links,
            parent: parent.into(),
        }
    }

    /// The physical parent interface
    pub fn parent(&self) -> &str {
        &self.parent
    }

    /// Returns true if the physical parent interface exists
    pub async fn parent_exists(&self) -> PolypResult<bool> {
        self.links
            .exists(&self.parent)
            .await
            .map_err(|e| PolypError::link("find parent iface", e))
    }

    async fn exists(&self, name: &str) -> PolypResult<bool> {
        self.links
            .exists(name)
            .await
            .map_err(|e| PolypError::link(format!("find iface by name ({})", name), e))
    }

    /// Deletes links created earlier in a failed call
    async fn rollback(&self, names: &[&str]) {
        for name in names {
            match self.links.exists(name).await {
                Ok(true) => {
                    if let Err(e) = self.links.delete(name).await {
                        warn!(link = %name, error = %e, "rollback failed to delete link");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(link = %name, error = %e, "rollback failed to look up link"),
            }
        }
    }

    /// Makes sure the network's VLAN sub-interface and bridge exist
    ///
    /// Missing links are created, enslaved and brought up. If a step fails,
    /// links created by this call are removed before the error is returned.
    #[instrument(skip(self, config), fields(vlan = config.vlan, bridge = %config.bridge_name))]
    pub async fn ensure_link(&self, config: &NetworkConfig) -> PolypResult<()> {
        let vlan_name = config.parent_name.as_str();
        let bridge_name = config.bridge_name.as_str();
        let mut created: Vec<&str> = Vec::new();

        if !self.exists(vlan_name).await? {
            self.links
                .add_vlan(vlan_name, &self.parent, config.vlan)
                .await
                .map_err(|e| PolypError::link("create vlan iface", e))?;
            created.push(vlan_name);

            if let Err(e) = self.links.set_up(vlan_name).await {
                self.rollback(&created).await;
                return Err(PolypError::link("bring vlan iface up", e));
            }
        }

        if !self.exists(bridge_name).await? {
            if let Err(e) = self.links.add_bridge(bridge_name).await {
                self.rollback(&created).await;
                return Err(PolypError::link("create bridge", e));
            }
            created.insert(0, bridge_name);
        }

        if created.is_empty() {
            debug!("links already present");
            return Ok(());
        }

        if let Err(e) = self.links.set_master(vlan_name, bridge_name).await {
            self.rollback(&created).await;
            return Err(PolypError::link("set bridge master", e));
        }

        if created.contains(&bridge_name) {
            if let Err(e) = self.links.set_up(bridge_name).await {
                self.rollback(&created).await;
                return Err(PolypError::link("bring bridge up", e));
            }
        }

        info!(iface = %vlan_name, "network links provisioned");
        Ok(())
    }

    /// Removes the network's bridge and VLAN sub-interface
    ///
    /// Links that do not exist are skipped.
    #[instrument(skip(self, config), fields(vlan = config.vlan, bridge = %config.bridge_name))]
    pub async fn teardown_link(&self, config: &NetworkConfig) -> PolypResult<()> {
        if self.exists(&config.bridge_name).await? {
            self.links
                .set_down(&config.bridge_name)
                .await
                .map_err(|e| PolypError::link("bring bridge down", e))?;
            self.links
                .delete(&config.bridge_name)
                .await
                .map_err(|e| PolypError::link("delete bridge", e))?;
        }

        if self.exists(&config.parent_name).await? {
            self.links
                .set_down(&config.parent_name)
                .await
                .map_err(|e| PolypError::link("bring vlan down", e))?;
            self.links
                .delete(&config.parent_name)
                .await
                .map_err(|e| PolypError::link("delete vlan", e))?;
        }

        info!(iface = %config.parent_name, "network links removed");
        Ok(())
    }

    async fn unused_name(&self, taken: Option<&str>) -> PolypResult<String> {
        for _ in 0..NAME_ATTEMPTS {
            let name = generate_iface_name(VETH_PREFIX, VETH_LEN);
            if Some(name.as_str()) == taken {
                continue;
            }
            if !self.exists(&name).await? {
                return Ok(name);
            }
        }
        Err(PolypError::internal(format!(
            "could not generate an unused {}* interface name",
            VETH_PREFIX
        )))
    }

    /// Creates the veth pair of a new endpoint and attaches it to the
    /// network's bridge
    ///
    /// The sandbox end gets the MAC (if any) and is left down for the
    /// engine to move and bring up. On failure both ends are removed.
    #[instrument(skip(self, config, interface), fields(bridge = %config.bridge_name))]
    pub async fn attach_endpoint(
        &self,
        config: &NetworkConfig,
        interface: &EndpointInterface,
    ) -> PolypResult<Endpoint> {
        if interface.address.is_empty() {
            return Err(PolypError::InvalidInterface(
                "ipv4 address not assigned".to_string(),
            ));
        }
        let addr: IpCidr = interface
            .address
            .parse()
            .map_err(|e: String| PolypError::InvalidInterface(format!("ipv4 address: {}", e)))?;
        if !addr.is_ipv4() {
            return Err(PolypError::InvalidInterface(format!(
                "{} is not an ipv4 address",
                interface.address
            )));
        }
        let addr_v6 = if interface.address_ipv6.is_empty() {
            None
        } else {
            let addr_v6: IpCidr = interface.address_ipv6.parse().map_err(|e: String| {
                PolypError::InvalidInterface(format!("ipv6 address: {}", e))
            })?;
            Some(addr_v6)
        };
        let mac = if interface.mac_address.is_empty() {
            None
        } else {
            let mac: MacAddr = interface
                .mac_address
                .parse()
                .map_err(|e: String| PolypError::InvalidInterface(format!("mac address: {}", e)))?;
            Some(mac)
        };

        let host_ifname = self.unused_name(None).await?;
        let ifname = self.unused_name(Some(&host_ifname)).await?;

        self.links
            .add_veth(&host_ifname, &ifname)
            .await
            .map_err(|e| {
                PolypError::link(
                    format!("add host ({}) <=> sandbox ({}) pair", host_ifname, ifname),
                    e,
                )
            })?;

        if let Err(e) = self
            .configure_pair(config, &host_ifname, &ifname, mac.as_ref())
            .await
        {
            self.rollback(&[&host_ifname, &ifname]).await;
            return Err(e);
        }

        debug!(host = %host_ifname, sandbox = %ifname, "endpoint veth attached");
        Ok(Endpoint {
            host_ifname,
            ifname,
            addr,
            addr_v6,
            mac,
        })
    }

    async fn configure_pair(
        &self,
        config: &NetworkConfig,
        host: &str,
        sandbox: &str,
        mac: Option<&MacAddr>,
    ) -> PolypResult<()> {
        if config.mtu != 0 {
            self.links
                .set_mtu(host, config.mtu)
                .await
                .map_err(|e| PolypError::link(format!("set MTU on host interface {}", host), e))?;
            self.links.set_mtu(sandbox, config.mtu).await.map_err(|e| {
                PolypError::link(format!("set MTU on sandbox interface {}", sandbox), e)
            })?;
        }

        self.links
            .set_master(host, &config.bridge_name)
            .await
            .map_err(|e| {
                PolypError::link(
                    format!("add interface {} to bridge {}", host, config.bridge_name),
                    e,
                )
            })?;

        if let Some(mac) = mac {
            self.links.set_down(sandbox).await.map_err(|e| {
                PolypError::link(format!("set link down for sandbox interface {}", sandbox), e)
            })?;
            self.links
                .set_address(sandbox, &mac.to_string())
                .await
                .map_err(|e| {
                    PolypError::link(format!("set mac address for sandbox interface {}", sandbox), e)
                })?;
        }

        self.links.set_up(host).await.map_err(|e| {
            PolypError::link(format!("set link up for host interface {}", host), e)
        })
    }

    /// Removes an endpoint's veth pair
    ///
    /// Deleting either end removes both; a pair already gone is not an
    /// error.
    pub async fn detach_endpoint(&self, endpoint: &Endpoint) -> PolypResult<()> {
        for name in [&endpoint.ifname, &endpoint.host_ifname] {
            if self.exists(name).await? {
                return self
                    .links
                    .delete(name)
                    .await
                    .map_err(|e| PolypError::link("delete veth", e));
            }
        }
        debug!(sandbox = %endpoint.ifname, "endpoint veth already gone");
        Ok(())
    }
}
