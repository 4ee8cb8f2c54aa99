//! The link manipulation seam.
//!
//! The provisioner never talks to the kernel directly; it drives a
//! [`LinkOps`] implementation. Production runs `ip(8)` through
//! [`crate::ip`], tests use an in-memory link table.

use async_trait::async_trait;

use crate::error::PolypResult;

/// Primitive operations on Linux network links.
///
/// Every method is a single kernel request. Implementations report failures
/// verbatim; callers decide which action name to attach and what to roll
/// back.
#[async_trait]
pub trait LinkOps: Send + Sync {
    /// Returns true if a link with this name exists.
    async fn exists(&self, name: &str) -> PolypResult<bool>;

    /// Creates an 802.1Q sub-interface `name` on `parent` tagged `vlan`.
    async fn add_vlan(&self, name: &str, parent: &str, vlan: u16) -> PolypResult<()>;

    /// Creates a bridge device.
    async fn add_bridge(&self, name: &str) -> PolypResult<()>;

    /// Creates a connected veth pair.
    async fn add_veth(&self, name: &str, peer: &str) -> PolypResult<()>;

    /// Enslaves `name` to the bridge `master`.
    async fn set_master(&self, name: &str, master: &str) -> PolypResult<()>;

    /// Sets the MTU of a link.
    async fn set_mtu(&self, name: &str, mtu: u32) -> PolypResult<()>;

    /// Sets the hardware address of a link.
    async fn set_address(&self, name: &str, mac: &str) -> PolypResult<()>;

    /// Brings a link administratively up.
    async fn set_up(&self, name: &str) -> PolypResult<()>;

    /// Brings a link administratively down.
    async fn set_down(&self, name: &str) -> PolypResult<()>;

    /// Deletes a link.
    async fn delete(&self, name: &str) -> PolypResult<()>;
}
