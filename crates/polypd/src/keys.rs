//! Store key layout, engine label names and naming constants

/// Default key namespace in the shared store.
pub const DEFAULT_NAMESPACE: &str = "polyp";

/// Directory under the namespace holding one key per network.
pub const NETWORK_DIR: &str = "network";

/// Shared-store key of a network: `<namespace>/network/<id>`.
pub fn network_key(namespace: &str, network_id: &str) -> String {
    format!("{}/{}/{}", namespace, NETWORK_DIR, network_id)
}

/// Option keys the engine itself defines
pub mod labels {
    /// Map holding the user's `-o key=value` driver options
    pub const GENERIC: &str = "com.docker.network.generic";

    /// MTU requested through the engine
    pub const DRIVER_MTU: &str = "com.docker.network.driver.mtu";

    /// IPv6 flag set by the engine (`--ipv6`)
    pub const ENABLE_IPV6: &str = "com.docker.network.enable_ipv6";
}

/// Driver options recognised inside the generic map
pub mod options {
    /// VLAN tag (required)
    pub const VLAN: &str = "vlan";

    /// VLAN sub-interface name override
    pub const IFACE: &str = "iface";

    /// Bridge name override
    pub const BRIDGE: &str = "bridge";

    /// MTU override
    pub const MTU: &str = "mtu";

    /// IPv6 flag (rejected when true)
    pub const ENABLE_IPV6: &str = "enable_ipv6";
}

/// Default VLAN sub-interface prefix (`vlan<N>`)
pub const VLAN_IFACE_PREFIX: &str = "vlan";

/// Default bridge prefix (`bran<N>`)
pub const BRIDGE_PREFIX: &str = "bran";

/// Prefix of generated veth names
pub const VETH_PREFIX: &str = "veth";

/// Number of random characters appended to [`VETH_PREFIX`]
pub const VETH_LEN: usize = 7;

/// Prefix the engine gives the interface inside the sandbox
pub const CONTAINER_IFACE_PREFIX: &str = "eth";

/// MTU used when no option sets one
pub const DEFAULT_MTU: u32 = 1500;

/// Smallest MTU accepted for an IPv4 link
pub const MIN_MTU: u32 = 68;

/// Lowest valid 802.1Q tag
pub const MIN_VLAN: u16 = 1;

/// Highest valid 802.1Q tag
pub const MAX_VLAN: u16 = 4094;
