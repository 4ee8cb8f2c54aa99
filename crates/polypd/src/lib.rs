//! polypd - VLAN/bridge container network driver
//!
//! Serves the engine's remote network-driver protocol. Networks are recorded
//! in a store shared by every host of the cluster; each host builds the
//! VLAN sub-interface and bridge of a network only while it has endpoints
//! on it, and tears them down again when the network's record disappears.

mod commands;
pub mod config;
mod driver;
mod endpoints;
pub mod keys;
mod networks;
mod options;
mod provisioner;
pub mod server;
mod types;
mod watcher;

pub use commands::*;
pub use config::{Args, ConfigError, DaemonConfig};
pub use driver::Driver;
pub use endpoints::EndpointRegistry;
pub use networks::{Network, NetworkRegistry, NetworkState};
pub use options::{parse_ipam, IpamGateways, NetworkOptions};
pub use provisioner::Provisioner;
pub use types::*;
