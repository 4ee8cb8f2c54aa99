//! Test infrastructure for the polyp network driver
//!
//! Provides:
//! - [`MockLinks`]: an in-memory kernel link table with call recording and
//!   failure injection
//! - Request fixtures in the JSON shapes the container engine sends
//! - Link operation verification helpers
//! - A containerised Redis server for store tests

pub mod fixtures;
pub mod links;
mod redis_env;
mod verification;

pub use fixtures::*;
pub use links::{FakeLink, LinkKind, LinkOp, MockLinks, OpKind};
pub use redis_env::RedisTestEnv;
pub use verification::*;
