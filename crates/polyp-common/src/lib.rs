//! Common infrastructure for the polyp network driver.
//!
//! - [`error`]: the error taxonomy reported back to the container engine
//! - [`ip`]: `ip link` command lines and their execution
//! - [`link`]: the [`LinkOps`] trait the provisioner drives
//!
//! # Example
//!
//! ```ignore
//! use polyp_common::{ip::{self, IpLink}, PolypResult};
//!
//! async fn bring_up(name: &str) -> PolypResult<()> {
//!     ip::run(&IpLink::set(name).arg("up")).await
//! }
//! ```

pub mod error;
pub mod ip;
pub mod link;

pub use error::{PolypError, PolypResult};
pub use link::LinkOps;
