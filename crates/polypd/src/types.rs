//! Type definitions for polypd
//!
//! Persistent state ([`NetworkConfig`]), per-host state ([`Endpoint`]) and
//! the JSON bodies of the remote network-driver protocol. Field names of
//! the wire types follow the engine's PascalCase spelling.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use polyp_common::{PolypError, PolypResult};

/// Driver scope reported to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Networks are private to one host
    Local,
    /// Networks are shared across the cluster
    Global,
}

impl Scope {
    /// Wire spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Local => "local",
            Scope::Global => "global",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network definition, stored verbatim in the shared store
///
/// Immutable once created. `parent_name` is the VLAN sub-interface the
/// bridge is built on, not the physical interface under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkConfig {
    /// VLAN sub-interface name
    pub parent_name: String,
    /// Bridge name
    pub bridge_name: String,
    /// 802.1Q tag
    pub vlan: u16,
    /// MTU applied to endpoint veths
    pub mtu: u32,
    /// IPv6 flag (always false for accepted networks)
    #[serde(rename = "EnableIPv6")]
    pub enable_ipv6: bool,
    /// IPv4 gateway handed to joining sandboxes
    #[serde(rename = "GatewayIPv4")]
    pub gateway_ipv4: Ipv4Addr,
    /// IPv6 gateway, recorded when IPAM supplied one
    #[serde(rename = "GatewayIPv6", default, skip_serializing_if = "Option::is_none")]
    pub gateway_ipv6: Option<Ipv6Addr>,
}

impl NetworkConfig {
    /// Serializes for the shared store
    pub fn to_bytes(&self) -> PolypResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| PolypError::internal(format!("encode config: {}", e)))
    }

    /// Decodes a stored definition
    pub fn from_bytes(bytes: &[u8]) -> PolypResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| PolypError::store("decode", e))
    }
}

/// Address with prefix length, e.g. `10.42.0.2/16`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpCidr {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl IpCidr {
    /// Returns true for an IPv4 address
    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }
}

impl FromStr for IpCidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("'{}' is not in CIDR notation", s))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|e| format!("invalid address '{}': {}", addr, e))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| format!("invalid prefix length '{}': {}", prefix, e))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(format!("prefix length {} exceeds {}", prefix, max));
        }
        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// 48-bit hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Raw octets
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(format!("'{}' is not a MAC address", s));
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(format!("'{}' is not a MAC address", s));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| format!("'{}' is not a MAC address", s))?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// An endpoint provisioned on this host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host-side veth, enslaved to the bridge
    pub host_ifname: String,
    /// Sandbox-side veth, moved into the container by the engine
    pub ifname: String,
    /// Assigned IPv4 address
    pub addr: IpCidr,
    /// Assigned IPv6 address, if the engine sent one
    pub addr_v6: Option<IpCidr>,
    /// Hardware address set on the sandbox-side veth
    pub mac: Option<MacAddr>,
}

/// One IPAM pool assignment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpamData {
    #[serde(default)]
    pub address_space: String,
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub aux_addresses: HashMap<String, String>,
}

/// Interface addresses the engine assigned to an endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointInterface {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(rename = "AddressIPv6", default, skip_serializing_if = "String::is_empty")]
    pub address_ipv6: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac_address: String,
}

/// `NetworkDriver.CreateNetwork` request
#[derive(Debug, Clone, Deserialize)]
pub struct CreateNetworkRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "Options", default)]
    pub options: Option<Map<String, Value>>,
    #[serde(rename = "IPv4Data", default)]
    pub ipv4_data: Vec<IpamData>,
    #[serde(rename = "IPv6Data", default)]
    pub ipv6_data: Vec<IpamData>,
}

/// `NetworkDriver.DeleteNetwork` request
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteNetworkRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
}

/// `NetworkDriver.CreateEndpoint` request
#[derive(Debug, Clone, Deserialize)]
pub struct CreateEndpointRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    #[serde(rename = "Interface", default)]
    pub interface: Option<EndpointInterface>,
    #[serde(rename = "Options", default)]
    pub options: Option<Map<String, Value>>,
}

/// `NetworkDriver.CreateEndpoint` response
///
/// `interface` stays `None`: the engine's addresses are used as given.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateEndpointResponse {
    #[serde(rename = "Interface", skip_serializing_if = "Option::is_none")]
    pub interface: Option<EndpointInterface>,
}

/// Request naming one endpoint (DeleteEndpoint, EndpointOperInfo, Leave)
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
}

/// `NetworkDriver.EndpointOperInfo` response
#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointInfoResponse {
    #[serde(rename = "Value")]
    pub value: HashMap<String, String>,
}

/// `NetworkDriver.Join` request
#[derive(Debug, Clone, Deserialize)]
pub struct JoinRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    #[serde(rename = "SandboxKey", default)]
    pub sandbox_key: String,
    #[serde(rename = "Options", default)]
    pub options: Option<Map<String, Value>>,
}

/// Names the engine uses to move the sandbox veth into the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InterfaceName {
    pub src_name: String,
    pub dst_prefix: String,
}

/// `NetworkDriver.Join` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinResponse {
    pub interface_name: InterfaceName,
    pub gateway: String,
}

/// `NetworkDriver.GetCapabilities` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CapabilitiesResponse {
    pub scope: Scope,
    pub connectivity_scope: Scope,
}
