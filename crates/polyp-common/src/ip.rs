//! `ip link` invocation.
//!
//! Every link change is one `ip(8)` run. Arguments are passed as a vector
//! straight to the process (no shell), so interface names never need
//! quoting. Runs go through tokio's process driver and never block a
//! runtime worker.
//!
//! # Example
//!
//! ```ignore
//! use polyp_common::ip::{self, IpLink};
//!
//! ip::run(&IpLink::set("bran42").arg("up")).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{PolypError, PolypResult};

/// Path to the `ip` binary.
pub const IP_CMD: &str = "/sbin/ip";

/// Longest interface name the kernel accepts (IFNAMSIZ - 1).
pub const IFNAME_MAX: usize = 15;

/// Characters `ip` and the kernel accept in a name without surprises.
static IFNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("Invalid regex pattern"));

/// Checks that `name` is usable as a Linux interface name.
///
/// Returns the reason when it is not.
pub fn check_ifname(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("interface name is empty".to_string());
    }
    if name.len() > IFNAME_MAX {
        return Err(format!(
            "interface name longer than {} characters",
            IFNAME_MAX
        ));
    }
    if name == "." || name == ".." || !IFNAME_RE.is_match(name) {
        return Err("interface name may only contain letters, digits, '_', '.' and '-'".to_string());
    }
    Ok(())
}

/// One `ip link <verb> ...` command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpLink {
    args: Vec<String>,
}

impl IpLink {
    fn verb(verb: &str) -> Self {
        Self {
            args: vec!["link".to_string(), verb.to_string()],
        }
    }

    /// `ip link add`
    pub fn add() -> Self {
        Self::verb("add")
    }

    /// `ip link set dev <name>`
    pub fn set(name: &str) -> Self {
        Self::verb("set").arg("dev").arg(name)
    }

    /// `ip link del dev <name>`
    pub fn del(name: &str) -> Self {
        Self::verb("del").arg("dev").arg(name)
    }

    /// `ip link show dev <name>`
    pub fn show(name: &str) -> Self {
        Self::verb("show").arg("dev").arg(name)
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    /// Arguments after the binary name.
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for IpLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ip {}", self.args.join(" "))
    }
}

/// Exit status and trimmed stderr of one run.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// Exit code (-1 if killed by a signal).
    pub exit_code: i32,
    /// What `ip` printed on stderr, usually the kernel's answer.
    pub stderr: String,
}

impl Outcome {
    /// True on exit code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs `cmd` and reports how it exited.
///
/// Fails only if `ip` could not be started.
pub async fn status(cmd: &IpLink) -> PolypResult<Outcome> {
    let output = Command::new(IP_CMD)
        .args(cmd.args())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| PolypError::CommandSpawn {
            command: cmd.to_string(),
            source: e,
        })?;

    let outcome = Outcome {
        exit_code: output.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };
    if !outcome.success() {
        tracing::debug!(
            command = %cmd,
            exit_code = outcome.exit_code,
            stderr = %outcome.stderr,
            "ip exited non-zero"
        );
    }
    Ok(outcome)
}

/// Runs `cmd`; a non-zero exit becomes [`PolypError::CommandFailed`]
/// carrying the kernel's message, ready to be wrapped with
/// [`PolypError::link`].
pub async fn run(cmd: &IpLink) -> PolypResult<()> {
    let outcome = status(cmd).await?;
    if outcome.success() {
        return Ok(());
    }
    Err(PolypError::CommandFailed {
        command: cmd.to_string(),
        exit_code: outcome.exit_code,
        output: outcome.stderr,
    })
}
