//! Network option and IPAM parsing
//!
//! Turns the untyped option map and IPAM data of a CreateNetwork request
//! into a [`NetworkConfig`]. Recognised options:
//!
//! | Option | Effect |
//! |---|---|
//! | `vlan` | sets the VLAN tag (required, 1-4094) |
//! | `iface` | overrides the VLAN sub-interface name (default `vlan<N>`) |
//! | `bridge` | overrides the bridge name (default `bran<N>`) |
//! | `mtu`, `com.docker.network.driver.mtu` | overrides the MTU |
//! | `enable_ipv6`, `com.docker.network.enable_ipv6` | rejected when true |
//!
//! Other labels are ignored.

use serde_json::{Map, Value};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;

use polyp_common::{ip, PolypError, PolypResult};

use crate::keys::{
    labels, options, BRIDGE_PREFIX, MAX_VLAN, MIN_MTU, MIN_VLAN, VLAN_IFACE_PREFIX,
};
use crate::types::{IpCidr, IpamData, NetworkConfig};

/// Typed driver options of one network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkOptions {
    pub vlan: u16,
    pub iface: Option<String>,
    pub bridge: Option<String>,
    pub mtu: Option<u32>,
    pub enable_ipv6: bool,
}

/// Gateways taken from IPAM data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpamGateways {
    pub ipv4: Ipv4Addr,
    pub ipv6: Option<Ipv6Addr>,
}

/// Reads a label as text. The engine sends strings, but numbers and
/// booleans are accepted too.
fn label_text(field: &str, value: &Value) -> PolypResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(PolypError::invalid_param(
            field,
            other.to_string(),
            "expected a string",
        )),
    }
}

fn parse_bool(field: &str, value: &str) -> PolypResult<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(PolypError::invalid_param(field, value, "invalid syntax")),
    }
}

fn parse_mtu(field: &str, value: &str) -> PolypResult<u32> {
    let mtu: u32 = value
        .parse()
        .map_err(|e| PolypError::invalid_param(field, value, e))?;
    if mtu < MIN_MTU {
        return Err(PolypError::invalid_param(
            field,
            value,
            format!("mtu must be at least {}", MIN_MTU),
        ));
    }
    Ok(mtu)
}

fn parse_vlan(value: &str) -> PolypResult<u16> {
    let vlan: u16 = value
        .parse()
        .map_err(|e| PolypError::invalid_param(options::VLAN, value, e))?;
    if !(MIN_VLAN..=MAX_VLAN).contains(&vlan) {
        return Err(PolypError::invalid_param(
            options::VLAN,
            value,
            format!("vlan id must be between {} and {}", MIN_VLAN, MAX_VLAN),
        ));
    }
    Ok(vlan)
}

/// Empty means "use the default name"; anything else must be a valid
/// interface name.
fn link_name(field: &str, value: String) -> PolypResult<Option<String>> {
    if value.is_empty() {
        return Ok(None);
    }
    ip::check_ifname(&value).map_err(|e| PolypError::invalid_param(field, &value, e))?;
    Ok(Some(value))
}

impl NetworkOptions {
    /// Parses the request's `Options` map.
    ///
    /// The generic map is required; engine-level keys next to it are
    /// consulted for the MTU and IPv6 flag.
    pub fn parse(request_options: Option<&Map<String, Value>>) -> PolypResult<Self> {
        let generic = request_options
            .and_then(|o| o.get(labels::GENERIC))
            .and_then(Value::as_object)
            .ok_or(PolypError::MissingParameterMap)?;

        let vlan = match generic.get(options::VLAN) {
            Some(value) => label_text(options::VLAN, value)?,
            None => String::new(),
        };
        if vlan.is_empty() {
            return Err(PolypError::missing_param(options::VLAN));
        }

        let mut parsed = Self {
            vlan: parse_vlan(&vlan)?,
            iface: None,
            bridge: None,
            mtu: None,
            enable_ipv6: false,
        };

        if let Some(Value::Bool(enabled)) = request_options.and_then(|o| o.get(labels::ENABLE_IPV6)) {
            parsed.enable_ipv6 = *enabled;
        }

        for (label, value) in generic {
            match label.as_str() {
                options::VLAN => {}
                options::IFACE => parsed.iface = link_name(label, label_text(label, value)?)?,
                options::BRIDGE => parsed.bridge = link_name(label, label_text(label, value)?)?,
                options::MTU | labels::DRIVER_MTU => {
                    parsed.mtu = Some(parse_mtu(label, &label_text(label, value)?)?)
                }
                options::ENABLE_IPV6 | labels::ENABLE_IPV6 => {
                    parsed.enable_ipv6 |= parse_bool(label, &label_text(label, value)?)?
                }
                _ => debug!(label = %label, "ignoring unrecognised network option"),
            }
        }

        Ok(parsed)
    }

    /// VLAN sub-interface name.
    pub fn iface_name(&self) -> String {
        self.iface
            .clone()
            .unwrap_or_else(|| format!("{}{}", VLAN_IFACE_PREFIX, self.vlan))
    }

    /// Bridge name.
    pub fn bridge_name(&self) -> String {
        self.bridge
            .clone()
            .unwrap_or_else(|| format!("{}{}", BRIDGE_PREFIX, self.vlan))
    }

    /// Builds the stored definition.
    pub fn into_config(self, gateways: IpamGateways, default_mtu: u32) -> NetworkConfig {
        NetworkConfig {
            parent_name: self.iface_name(),
            bridge_name: self.bridge_name(),
            vlan: self.vlan,
            mtu: self.mtu.unwrap_or(default_mtu),
            enable_ipv6: self.enable_ipv6,
            gateway_ipv4: gateways.ipv4,
            gateway_ipv6: gateways.ipv6,
        }
    }
}

fn parse_gateway(network_id: &str, gateway: &str) -> PolypResult<IpAddr> {
    gateway
        .parse::<IpCidr>()
        .map(|cidr| cidr.addr)
        .map_err(|e| PolypError::Ipam(format!("network {}: bad gateway: {}", network_id, e)))
}

/// Extracts the gateways from IPAM data.
///
/// Exactly one IPv4 pool with a gateway is required; more than one pool of
/// either family is rejected.
pub fn parse_ipam(
    network_id: &str,
    ipv4_data: &[IpamData],
    ipv6_data: &[IpamData],
) -> PolypResult<IpamGateways> {
    if ipv4_data.len() > 1 || ipv6_data.len() > 1 {
        return Err(PolypError::Ipam(
            "driver does not support multiple subnets".to_string(),
        ));
    }

    let Some(v4) = ipv4_data.first() else {
        return Err(PolypError::Ipam(format!(
            "network {} requires ipv4 configuration",
            network_id
        )));
    };
    if v4.gateway.is_empty() {
        return Err(PolypError::Ipam(format!(
            "network {} requires ipv4 gateway",
            network_id
        )));
    }
    let IpAddr::V4(ipv4) = parse_gateway(network_id, &v4.gateway)? else {
        return Err(PolypError::Ipam(format!(
            "network {}: ipv4 gateway {} is not an ipv4 address",
            network_id, v4.gateway
        )));
    };

    let ipv6 = match ipv6_data.first() {
        Some(v6) if !v6.gateway.is_empty() => match parse_gateway(network_id, &v6.gateway)? {
            IpAddr::V6(addr) => Some(addr),
            IpAddr::V4(_) => {
                return Err(PolypError::Ipam(format!(
                    "network {}: ipv6 gateway {} is not an ipv6 address",
                    network_id, v6.gateway
                )))
            }
        },
        _ => None,
    };

    Ok(IpamGateways { ipv4, ipv6 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn opts(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn ipam(gateway: &str) -> IpamData {
        IpamData {
            pool: "10.42.0.0/16".to_string(),
            gateway: gateway.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_from_vlan() {
        let options = opts(json!({ (labels::GENERIC): { "vlan": "42" } }));
        let parsed = NetworkOptions::parse(Some(&options)).unwrap();
        assert_eq!(parsed.iface_name(), "vlan42");
        assert_eq!(parsed.bridge_name(), "bran42");

        let gateways = parse_ipam("n1", &[ipam("10.42.0.1/16")], &[]).unwrap();
        let config = parsed.into_config(gateways, 1500);
        assert_eq!(config.parent_name, "vlan42");
        assert_eq!(config.bridge_name, "bran42");
        assert_eq!(config.vlan, 42);
        assert_eq!(config.mtu, 1500);
        assert_eq!(config.gateway_ipv4, Ipv4Addr::new(10, 42, 0, 1));
    }

    #[test]
    fn test_overrides() {
        let options = opts(json!({
            (labels::GENERIC): {
                "vlan": "100",
                "iface": "eth0.100",
                "bridge": "br-tenant",
                "mtu": "9000",
                "com.docker.network.foo": "bar",
            }
        }));
        let parsed = NetworkOptions::parse(Some(&options)).unwrap();
        assert_eq!(parsed.iface_name(), "eth0.100");
        assert_eq!(parsed.bridge_name(), "br-tenant");
        assert_eq!(parsed.mtu, Some(9000));
    }

    #[test]
    fn test_empty_overrides_fall_back() {
        let options = opts(json!({ (labels::GENERIC): { "vlan": "7", "iface": "", "bridge": "" } }));
        let parsed = NetworkOptions::parse(Some(&options)).unwrap();
        assert_eq!(parsed.iface_name(), "vlan7");
        assert_eq!(parsed.bridge_name(), "bran7");
    }

    #[test]
    fn test_engine_mtu_label() {
        let options = opts(json!({
            (labels::GENERIC): { "vlan": "42", (labels::DRIVER_MTU): "1450" }
        }));
        let parsed = NetworkOptions::parse(Some(&options)).unwrap();
        assert_eq!(parsed.mtu, Some(1450));
    }

    #[test]
    fn test_missing_map() {
        assert!(matches!(
            NetworkOptions::parse(None),
            Err(PolypError::MissingParameterMap)
        ));
        let options = opts(json!({ (labels::ENABLE_IPV6): false }));
        assert!(matches!(
            NetworkOptions::parse(Some(&options)),
            Err(PolypError::MissingParameterMap)
        ));
    }

    #[test]
    fn test_missing_vlan() {
        let options = opts(json!({ (labels::GENERIC): { "bridge": "br0" } }));
        let err = NetworkOptions::parse(Some(&options)).unwrap_err();
        assert!(matches!(&err, PolypError::MissingParam(name) if name == "vlan"));
        assert_eq!(err.to_string(), "param vlan not given");

        let options = opts(json!({ (labels::GENERIC): { "vlan": "" } }));
        assert!(matches!(
            NetworkOptions::parse(Some(&options)),
            Err(PolypError::MissingParam(_))
        ));
    }

    #[test]
    fn test_bad_vlan() {
        for bad in ["abc", "0", "4095", "-1"] {
            let options = opts(json!({ (labels::GENERIC): { "vlan": bad } }));
            let err = NetworkOptions::parse(Some(&options)).unwrap_err();
            assert!(
                matches!(&err, PolypError::InvalidParam { field, .. } if field == "vlan"),
                "{} gave {:?}",
                bad,
                err
            );
        }
    }

    #[test]
    fn test_numeric_vlan_accepted() {
        let options = opts(json!({ (labels::GENERIC): { "vlan": 42 } }));
        assert_eq!(NetworkOptions::parse(Some(&options)).unwrap().vlan, 42);
    }

    #[test]
    fn test_bad_mtu() {
        for bad in ["jumbo", "10"] {
            let options = opts(json!({ (labels::GENERIC): { "vlan": "42", "mtu": bad } }));
            assert!(matches!(
                NetworkOptions::parse(Some(&options)),
                Err(PolypError::InvalidParam { .. })
            ));
        }
    }

    #[test]
    fn test_ipv6_flag() {
        let options = opts(json!({ (labels::GENERIC): { "vlan": "42", "enable_ipv6": "true" } }));
        assert!(NetworkOptions::parse(Some(&options)).unwrap().enable_ipv6);

        let options = opts(json!({
            (labels::GENERIC): { "vlan": "42" },
            (labels::ENABLE_IPV6): true,
        }));
        assert!(NetworkOptions::parse(Some(&options)).unwrap().enable_ipv6);

        let options = opts(json!({ (labels::GENERIC): { "vlan": "42", "enable_ipv6": "maybe" } }));
        assert!(NetworkOptions::parse(Some(&options)).is_err());
    }

    #[test]
    fn test_ipam_requires_one_v4_gateway() {
        let err = parse_ipam("n1", &[], &[]).unwrap_err();
        assert!(err.to_string().contains("requires ipv4 configuration"));

        let err = parse_ipam("n1", &[ipam("")], &[]).unwrap_err();
        assert!(err.to_string().contains("requires ipv4 gateway"));

        let err = parse_ipam("n1", &[ipam("10.42.0.1/16"), ipam("10.43.0.1/16")], &[]).unwrap_err();
        assert!(err.to_string().contains("multiple subnets"));

        let err = parse_ipam("n1", &[ipam("10.42.0.1")], &[]).unwrap_err();
        assert!(matches!(err, PolypError::Ipam(_)));

        let err = parse_ipam("n1", &[ipam("fd00::1/64")], &[]).unwrap_err();
        assert!(err.to_string().contains("not an ipv4 address"));
    }

    #[test]
    fn test_ipam_records_v6_gateway() {
        let gateways = parse_ipam("n1", &[ipam("10.42.0.1/16")], &[ipam("fd00::1/64")]).unwrap();
        assert_eq!(gateways.ipv6, Some("fd00::1".parse().unwrap()));

        let err = parse_ipam(
            "n1",
            &[ipam("10.42.0.1/16")],
            &[ipam("fd00::1/64"), ipam("fd01::1/64")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("multiple subnets"));
    }

    #[test]
    fn test_link_name_overrides_are_checked() {
        let options = opts(json!({ (labels::GENERIC): { "vlan": "42", "iface": "bond0.42", "bridge": "" } }));
        let parsed = NetworkOptions::parse(Some(&options)).unwrap();
        assert_eq!(parsed.iface_name(), "bond0.42");
        assert_eq!(parsed.bridge_name(), "bran42");

        let options = opts(json!({ (labels::GENERIC): { "vlan": "42", "bridge": "br$(reboot)" } }));
        let err = NetworkOptions::parse(Some(&options)).unwrap_err();
        assert!(matches!(err, PolypError::InvalidParam { ref field, .. } if field == "bridge"));

        let options = opts(json!({ (labels::GENERIC): { "vlan": "42", "iface": "a-very-long-vlan-name" } }));
        assert!(NetworkOptions::parse(Some(&options)).is_err());
    }
}
