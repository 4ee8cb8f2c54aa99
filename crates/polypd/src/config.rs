//! Daemon configuration
//!
//! Loaded from a TOML file (every field has a default, a missing file means
//! all defaults) and then overridden by command-line flags.
//!
//! ```toml
//! log_level = "info"
//!
//! [plugin]
//! socket = "/run/docker/plugins/polyp.sock"
//! scope = "global"
//!
//! [network]
//! iface = "eth0"
//! default_mtu = 1500
//!
//! [store]
//! url = "redis://10.0.0.5:6379/0"
//! namespace = "polyp"
//! ```

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use polyp_common::ip;

use crate::keys::{DEFAULT_MTU, DEFAULT_NAMESPACE, MIN_MTU};
use crate::types::Scope;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/polyp/polypd.toml";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for [`DaemonConfig`].
    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Plugin socket settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Unix socket the engine connects to
    #[serde(default = "default_socket")]
    pub socket: PathBuf,

    /// Scope reported in capabilities
    #[serde(default = "default_scope")]
    pub scope: Scope,
}

/// Host network settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSection {
    /// Physical interface VLAN sub-interfaces are created on
    #[serde(default = "default_iface")]
    pub iface: String,

    /// MTU used when a network does not set one
    #[serde(default = "default_mtu")]
    pub default_mtu: u32,
}

/// Shared store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend URL, `memory://` or `redis://host:port/db`
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Key prefix shared by every host of the cluster
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

/// Complete daemon configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Log filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub plugin: PluginConfig,

    #[serde(default)]
    pub network: NetworkSection,

    #[serde(default)]
    pub store: StoreConfig,
}

fn default_socket() -> PathBuf {
    PathBuf::from("/run/docker/plugins/polyp.sock")
}

fn default_scope() -> Scope {
    Scope::Global
}

fn default_iface() -> String {
    "eth0".to_string()
}

fn default_mtu() -> u32 {
    DEFAULT_MTU
}

fn default_store_url() -> String {
    "memory://".to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            scope: default_scope(),
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            iface: default_iface(),
            default_mtu: default_mtu(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            namespace: default_namespace(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            plugin: PluginConfig::default(),
            network: NetworkSection::default(),
            store: StoreConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Loads `path`, falling back to defaults if the file does not exist
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content, path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Overrides file values with the flags that were given
    pub fn apply(&mut self, args: &Args) {
        if let Some(socket) = &args.socket {
            self.plugin.socket = socket.clone();
        }
        if let Some(scope) = args.scope {
            self.plugin.scope = scope;
        }
        if let Some(iface) = &args.iface {
            self.network.iface = iface.clone();
        }
        if let Some(url) = &args.store {
            self.store.url = url.clone();
        }
        if let Some(namespace) = &args.namespace {
            self.store.namespace = namespace.clone();
        }
        if let Some(level) = &args.log_level {
            self.log_level = level.clone();
        }
    }

    /// Checks values that serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Err(e) = ip::check_ifname(&self.network.iface) {
            return Err(ConfigError::Invalid(format!("network.iface: {e}")));
        }
        if self.network.default_mtu < MIN_MTU {
            return Err(ConfigError::Invalid(format!(
                "network.default_mtu must be at least {MIN_MTU}"
            )));
        }
        if self.store.namespace.is_empty() || self.store.namespace.contains('/') {
            return Err(ConfigError::Invalid(
                "store.namespace must be a non-empty single path segment".to_string(),
            ));
        }
        Ok(())
    }

    /// Loads the file named by `args` and applies the flags on top
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let mut config = Self::load_or_default(&args.config)?;
        config.apply(args);
        config.validate()?;
        Ok(config)
    }
}

/// VLAN/bridge network driver for container engines
#[derive(Parser, Debug, Clone)]
#[command(name = "polypd")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Plugin socket path
    #[arg(short = 's', long)]
    pub socket: Option<PathBuf>,

    /// Physical parent interface
    #[arg(short = 'i', long)]
    pub iface: Option<String>,

    /// Store URL (memory:// or redis://host:port/db)
    #[arg(long)]
    pub store: Option<String>,

    /// Store key namespace
    #[arg(long)]
    pub namespace: Option<String>,

    /// Driver scope
    #[arg(long, value_enum)]
    pub scope: Option<Scope>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,
}
