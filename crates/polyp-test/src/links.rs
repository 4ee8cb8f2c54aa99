//! In-memory link table standing in for the kernel.
//!
//! [`MockLinks`] implements [`LinkOps`] with the same success and failure
//! rules `ip(8)` has for the handful of operations the driver uses, records
//! every call, and can be told to fail a chosen call once.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use polyp_common::{LinkOps, PolypError, PolypResult};

/// Default MTU of freshly created links.
pub const DEFAULT_LINK_MTU: u32 = 1500;

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    Exists(String),
    AddVlan { name: String, parent: String, vlan: u16 },
    AddBridge(String),
    AddVeth { name: String, peer: String },
    SetMaster { name: String, master: String },
    SetMtu { name: String, mtu: u32 },
    SetAddress { name: String, mac: String },
    SetUp(String),
    SetDown(String),
    Delete(String),
}

/// Call kind, used to select ops and to inject failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Exists,
    AddVlan,
    AddBridge,
    AddVeth,
    SetMaster,
    SetMtu,
    SetAddress,
    SetUp,
    SetDown,
    Delete,
}

impl LinkOp {
    /// The kind of this call.
    pub fn kind(&self) -> OpKind {
        match self {
            LinkOp::Exists(_) => OpKind::Exists,
            LinkOp::AddVlan { .. } => OpKind::AddVlan,
            LinkOp::AddBridge(_) => OpKind::AddBridge,
            LinkOp::AddVeth { .. } => OpKind::AddVeth,
            LinkOp::SetMaster { .. } => OpKind::SetMaster,
            LinkOp::SetMtu { .. } => OpKind::SetMtu,
            LinkOp::SetAddress { .. } => OpKind::SetAddress,
            LinkOp::SetUp(_) => OpKind::SetUp,
            LinkOp::SetDown(_) => OpKind::SetDown,
            LinkOp::Delete(_) => OpKind::Delete,
        }
    }

    /// The link the call targets.
    pub fn name(&self) -> &str {
        match self {
            LinkOp::Exists(name)
            | LinkOp::AddBridge(name)
            | LinkOp::SetUp(name)
            | LinkOp::SetDown(name)
            | LinkOp::Delete(name) => name,
            LinkOp::AddVlan { name, .. }
            | LinkOp::AddVeth { name, .. }
            | LinkOp::SetMaster { name, .. }
            | LinkOp::SetMtu { name, .. }
            | LinkOp::SetAddress { name, .. } => name,
        }
    }
}

/// What a fake link is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Physical,
    Vlan { parent: String, id: u16 },
    Bridge,
    Veth { peer: String },
}

/// State of one fake link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeLink {
    pub kind: LinkKind,
    pub master: Option<String>,
    pub up: bool,
    pub mtu: u32,
    pub mac: Option<String>,
}

impl FakeLink {
    fn new(kind: LinkKind) -> Self {
        Self {
            kind,
            master: None,
            up: false,
            mtu: DEFAULT_LINK_MTU,
            mac: None,
        }
    }
}

struct Failure {
    kind: OpKind,
    name: Option<String>,
}

#[derive(Default)]
struct State {
    links: HashMap<String, FakeLink>,
    ops: Vec<LinkOp>,
    failures: Vec<Failure>,
    delays: HashMap<OpKind, Duration>,
}

/// Fake kernel link table.
#[derive(Default)]
pub struct MockLinks {
    state: Mutex<State>,
}

fn not_found(op: &LinkOp) -> PolypError {
    PolypError::CommandFailed {
        command: format!("{:?}", op),
        exit_code: 1,
        output: format!("Cannot find device \"{}\"", op.name()),
    }
}

fn file_exists(op: &LinkOp) -> PolypError {
    PolypError::CommandFailed {
        command: format!("{:?}", op),
        exit_code: 2,
        output: "RTNETLINK answers: File exists".to_string(),
    }
}

impl MockLinks {
    /// Creates an empty link table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a physical interface (e.g. the VLAN parent `eth0`).
    pub fn with_physical(self, name: &str) -> Self {
        self.state
            .lock()
            .links
            .insert(name.to_string(), FakeLink::new(LinkKind::Physical));
        self
    }

    /// Makes the next call of `kind` fail.
    pub fn fail_on(&self, kind: OpKind) {
        self.state.lock().failures.push(Failure { kind, name: None });
    }

    /// Makes the next call of `kind` on link `name` fail.
    pub fn fail_on_link(&self, kind: OpKind, name: &str) {
        self.state.lock().failures.push(Failure {
            kind,
            name: Some(name.to_string()),
        });
    }

    /// Makes every call of `kind` wait `delay` before it takes effect.
    ///
    /// A call dropped while waiting leaves the table untouched and is not
    /// recorded.
    pub fn slow_on(&self, kind: OpKind, delay: Duration) {
        self.state.lock().delays.insert(kind, delay);
    }

    /// All recorded calls, oldest first.
    pub fn ops(&self) -> Vec<LinkOp> {
        self.state.lock().ops.clone()
    }

    /// Forgets recorded calls (the link table is kept).
    pub fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }

    /// Number of recorded calls of `kind`.
    pub fn count(&self, kind: OpKind) -> usize {
        self.state
            .lock()
            .ops
            .iter()
            .filter(|op| op.kind() == kind)
            .count()
    }

    /// Number of recorded calls of `kind` targeting `name`.
    pub fn count_on(&self, kind: OpKind, name: &str) -> usize {
        self.state
            .lock()
            .ops
            .iter()
            .filter(|op| op.kind() == kind && op.name() == name)
            .count()
    }

    /// Returns true if a link named `name` exists.
    pub fn has_link(&self, name: &str) -> bool {
        self.state.lock().links.contains_key(name)
    }

    /// Snapshot of one link.
    pub fn link(&self, name: &str) -> Option<FakeLink> {
        self.state.lock().links.get(name).cloned()
    }

    /// Names of all links, sorted.
    pub fn link_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().links.keys().cloned().collect();
        names.sort();
        names
    }

    /// Waits out any delay set for the kind of `op`, then records `op` and
    /// applies an injected failure if one matches, otherwise runs `apply`
    /// against the table.
    async fn record<T>(
        &self,
        op: LinkOp,
        apply: impl FnOnce(&mut HashMap<String, FakeLink>, &LinkOp) -> PolypResult<T>,
    ) -> PolypResult<T> {
        let delay = self.state.lock().delays.get(&op.kind()).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.ops.push(op.clone());

        let injected = state.failures.iter().position(|failure| {
            failure.kind == op.kind() && failure.name.as_deref().map_or(true, |n| n == op.name())
        });
        if let Some(index) = injected {
            state.failures.remove(index);
            return Err(PolypError::CommandFailed {
                command: format!("{:?}", op),
                exit_code: 2,
                output: "injected failure".to_string(),
            });
        }

        apply(&mut state.links, &op)
    }

    async fn modify(
        &self,
        op: LinkOp,
        change: impl FnOnce(&mut FakeLink),
    ) -> PolypResult<()> {
        self.record(op, |links, op| match links.get_mut(op.name()) {
            Some(link) => {
                change(link);
                Ok(())
            }
            None => Err(not_found(op)),
        })
        .await
    }
}

#[async_trait]
impl LinkOps for MockLinks {
    async fn exists(&self, name: &str) -> PolypResult<bool> {
        self.record(LinkOp::Exists(name.to_string()), |links, _| {
            Ok(links.contains_key(name))
        })
        .await
    }

    async fn add_vlan(&self, name: &str, parent: &str, vlan: u16) -> PolypResult<()> {
        let op = LinkOp::AddVlan {
            name: name.to_string(),
            parent: parent.to_string(),
            vlan,
        };
        self.record(op, |links, op| {
            if links.contains_key(name) {
                return Err(file_exists(op));
            }
            if !links.contains_key(parent) {
                return Err(PolypError::CommandFailed {
                    command: format!("{:?}", op),
                    exit_code: 1,
                    output: format!("Cannot find device \"{}\"", parent),
                });
            }
            links.insert(
                name.to_string(),
                FakeLink::new(LinkKind::Vlan {
                    parent: parent.to_string(),
                    id: vlan,
                }),
            );
            Ok(())
        })
        .await
    }

    async fn add_bridge(&self, name: &str) -> PolypResult<()> {
        self.record(LinkOp::AddBridge(name.to_string()), |links, op| {
            if links.contains_key(name) {
                return Err(file_exists(op));
            }
            links.insert(name.to_string(), FakeLink::new(LinkKind::Bridge));
            Ok(())
        })
        .await
    }

    async fn add_veth(&self, name: &str, peer: &str) -> PolypResult<()> {
        let op = LinkOp::AddVeth {
            name: name.to_string(),
            peer: peer.to_string(),
        };
        self.record(op, |links, op| {
            if links.contains_key(name) || links.contains_key(peer) {
                return Err(file_exists(op));
            }
            links.insert(
                name.to_string(),
                FakeLink::new(LinkKind::Veth {
                    peer: peer.to_string(),
                }),
            );
            links.insert(
                peer.to_string(),
                FakeLink::new(LinkKind::Veth {
                    peer: name.to_string(),
                }),
            );
            Ok(())
        })
        .await
    }

    async fn set_master(&self, name: &str, master: &str) -> PolypResult<()> {
        let op = LinkOp::SetMaster {
            name: name.to_string(),
            master: master.to_string(),
        };
        self.record(op, |links, op| {
            match links.get(master) {
                Some(link) if link.kind == LinkKind::Bridge => {}
                Some(_) => {
                    return Err(PolypError::CommandFailed {
                        command: format!("{:?}", op),
                        exit_code: 2,
                        output: format!("{} is not a bridge", master),
                    })
                }
                None => return Err(not_found(op)),
            }
            match links.get_mut(name) {
                Some(link) => {
                    link.master = Some(master.to_string());
                    Ok(())
                }
                None => Err(not_found(op)),
            }
        })
        .await
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> PolypResult<()> {
        let op = LinkOp::SetMtu {
            name: name.to_string(),
            mtu,
        };
        self.modify(op, |link| link.mtu = mtu).await
    }

    async fn set_address(&self, name: &str, mac: &str) -> PolypResult<()> {
        let op = LinkOp::SetAddress {
            name: name.to_string(),
            mac: mac.to_string(),
        };
        self.modify(op, |link| link.mac = Some(mac.to_string())).await
    }

    async fn set_up(&self, name: &str) -> PolypResult<()> {
        self.modify(LinkOp::SetUp(name.to_string()), |link| link.up = true).await
    }

    async fn set_down(&self, name: &str) -> PolypResult<()> {
        self.modify(LinkOp::SetDown(name.to_string()), |link| link.up = false).await
    }

    async fn delete(&self, name: &str) -> PolypResult<()> {
        self.record(LinkOp::Delete(name.to_string()), |links, op| {
            let Some(removed) = links.remove(name) else {
                return Err(not_found(op));
            };
            // Deleting one end of a veth pair removes the other.
            if let LinkKind::Veth { peer } = &removed.kind {
                links.remove(peer);
            }
            for link in links.values_mut() {
                if link.master.as_deref() == Some(name) {
                    link.master = None;
                }
            }
            Ok(())
        })
        .await
    }
}
