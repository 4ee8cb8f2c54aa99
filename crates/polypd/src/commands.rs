//! `ip link` command builders and the `ip(8)` backed [`LinkOps`]
//! implementation

use async_trait::async_trait;
use tracing::debug;

use polyp_common::ip::{self, IpLink};
use polyp_common::{LinkOps, PolypError, PolypResult};

/// Build check if link exists command
pub fn build_link_exists_cmd(name: &str) -> IpLink {
    IpLink::show(name)
}

/// Build add VLAN sub-interface command
pub fn build_add_vlan_cmd(name: &str, parent: &str, vlan: u16) -> IpLink {
    IpLink::add()
        .arg("link")
        .arg(parent)
        .arg("name")
        .arg(name)
        .arg("type")
        .arg("vlan")
        .arg("id")
        .arg(vlan)
}

/// Build add bridge command
pub fn build_add_bridge_cmd(name: &str) -> IpLink {
    IpLink::add().arg("name").arg(name).arg("type").arg("bridge")
}

/// Build add veth pair command
pub fn build_add_veth_cmd(name: &str, peer: &str) -> IpLink {
    IpLink::add()
        .arg("name")
        .arg(name)
        .arg("type")
        .arg("veth")
        .arg("peer")
        .arg("name")
        .arg(peer)
}

/// Build set bridge master command
pub fn build_set_master_cmd(name: &str, master: &str) -> IpLink {
    IpLink::set(name).arg("master").arg(master)
}

/// Build set MTU command
pub fn build_set_mtu_cmd(name: &str, mtu: u32) -> IpLink {
    IpLink::set(name).arg("mtu").arg(mtu)
}

/// Build set hardware address command
pub fn build_set_address_cmd(name: &str, mac: &str) -> IpLink {
    IpLink::set(name).arg("address").arg(mac)
}

/// Build set admin state command
pub fn build_set_admin_cmd(name: &str, state: &str) -> IpLink {
    IpLink::set(name).arg(state)
}

/// Build delete link command
pub fn build_delete_link_cmd(name: &str) -> IpLink {
    IpLink::del(name)
}

/// `ip link show` answer for a missing device
fn is_missing_device(stderr: &str) -> bool {
    stderr.contains("does not exist") || stderr.contains("Cannot find device")
}

/// [`LinkOps`] over `ip(8)`
#[derive(Default)]
pub struct IpLinks {
    /// Captured commands in mock mode
    #[cfg(test)]
    captured_commands: Option<parking_lot::Mutex<Vec<String>>>,
}

impl IpLinks {
    /// Creates a link backend running `ip` commands
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables mock mode for testing: commands are captured, not run, and
    /// no link exists
    #[cfg(test)]
    pub fn with_mock_mode(mut self) -> Self {
        self.captured_commands = Some(parking_lot::Mutex::new(Vec::new()));
        self
    }

    /// Gets captured commands (for testing)
    #[cfg(test)]
    pub fn captured_commands(&self) -> Vec<String> {
        self.captured_commands
            .as_ref()
            .map(|c| c.lock().clone())
            .unwrap_or_default()
    }

    /// Run one command (with mock mode support)
    async fn run(&self, cmd: IpLink) -> PolypResult<()> {
        #[cfg(test)]
        if let Some(captured) = &self.captured_commands {
            captured.lock().push(cmd.to_string());
            return Ok(());
        }

        debug!(cmd = %cmd, "running link command");
        ip::run(&cmd).await
    }
}

#[async_trait]
impl LinkOps for IpLinks {
    async fn exists(&self, name: &str) -> PolypResult<bool> {
        let cmd = build_link_exists_cmd(name);

        #[cfg(test)]
        if let Some(captured) = &self.captured_commands {
            captured.lock().push(cmd.to_string());
            return Ok(false);
        }

        let outcome = ip::status(&cmd).await?;
        if outcome.success() {
            Ok(true)
        } else if is_missing_device(&outcome.stderr) {
            Ok(false)
        } else {
            Err(PolypError::CommandFailed {
                command: cmd.to_string(),
                exit_code: outcome.exit_code,
                output: outcome.stderr,
            })
        }
    }

    async fn add_vlan(&self, name: &str, parent: &str, vlan: u16) -> PolypResult<()> {
        self.run(build_add_vlan_cmd(name, parent, vlan)).await
    }

    async fn add_bridge(&self, name: &str) -> PolypResult<()> {
        self.run(build_add_bridge_cmd(name)).await
    }

    async fn add_veth(&self, name: &str, peer: &str) -> PolypResult<()> {
        self.run(build_add_veth_cmd(name, peer)).await
    }

    async fn set_master(&self, name: &str, master: &str) -> PolypResult<()> {
        self.run(build_set_master_cmd(name, master)).await
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> PolypResult<()> {
        self.run(build_set_mtu_cmd(name, mtu)).await
    }

    async fn set_address(&self, name: &str, mac: &str) -> PolypResult<()> {
        self.run(build_set_address_cmd(name, mac)).await
    }

    async fn set_up(&self, name: &str) -> PolypResult<()> {
        self.run(build_set_admin_cmd(name, "up")).await
    }

    async fn set_down(&self, name: &str) -> PolypResult<()> {
        self.run(build_set_admin_cmd(name, "down")).await
    }

    async fn delete(&self, name: &str) -> PolypResult<()> {
        self.run(build_delete_link_cmd(name)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_add_vlan_cmd() {
        let cmd = build_add_vlan_cmd("vlan42", "eth0", 42);
        assert_eq!(
            cmd.to_string(),
            "ip link add link eth0 name vlan42 type vlan id 42"
        );
    }

    #[test]
    fn test_build_add_bridge_cmd() {
        let cmd = build_add_bridge_cmd("bran42");
        assert_eq!(cmd.to_string(), "ip link add name bran42 type bridge");
    }

    #[test]
    fn test_build_add_veth_cmd() {
        let cmd = build_add_veth_cmd("veth1234567", "vethabcdefg");
        assert!(cmd.to_string().ends_with("type veth peer name vethabcdefg"));
    }

    #[test]
    fn test_build_set_cmds() {
        assert!(build_set_master_cmd("veth1234567", "bran42")
            .to_string()
            .ends_with("master bran42"));
        assert!(build_set_mtu_cmd("veth1234567", 9000)
            .to_string()
            .ends_with("mtu 9000"));
        assert!(build_set_address_cmd("vethabcdefg", "02:42:ac:11:00:02")
            .to_string()
            .ends_with("address 02:42:ac:11:00:02"));
        assert_eq!(
            build_set_admin_cmd("bran42", "down").to_string(),
            "ip link set dev bran42 down"
        );
        assert_eq!(
            build_delete_link_cmd("vlan42").to_string(),
            "ip link del dev vlan42"
        );
    }

    #[test]
    fn test_missing_device_answers() {
        assert!(is_missing_device("Device \"bran42\" does not exist."));
        assert!(is_missing_device("Cannot find device \"bran42\""));
        assert!(!is_missing_device("RTNETLINK answers: Operation not permitted"));
    }

    #[tokio::test]
    async fn test_mock_mode_captures_commands() {
        let links = IpLinks::new().with_mock_mode();
        assert!(!links.exists("bran42").await.unwrap());
        links.add_bridge("bran42").await.unwrap();
        links.set_up("bran42").await.unwrap();

        let cmds = links.captured_commands();
        assert_eq!(
            cmds,
            vec![
                "ip link show dev bran42",
                "ip link add name bran42 type bridge",
                "ip link set dev bran42 up",
            ]
        );
    }
}
