//! Shared key/value store used to keep network definitions consistent
//! across hosts.
//!
//! The driver only needs five operations from the cluster store, captured by
//! [`KvStore`]. Two backends are provided:
//!
//! - [`MemoryStore`]: in-process; clones share one map, which is how tests
//!   model several hosts talking to one cluster store
//! - [`RedisStore`]: a Redis server, with watches built on keyspace
//!   notifications
//!
//! # Watches
//!
//! [`KvStore::watch`] returns a [`Watch`] whose first event is the key's
//! current state, followed by every later change. Dropping the `Watch` or
//! cancelling the token passed in releases the subscription.

mod memory;
mod redis_backend;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use polyp_common::{PolypError, PolypResult};

pub use memory::MemoryStore;
pub use redis_backend::RedisStore;

/// Change notification for a watched key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The key was written (or exists when the watch starts).
    Put(Vec<u8>),
    /// The key was deleted (or is absent when the watch starts).
    Deleted,
}

/// A live subscription to one key.
pub struct Watch {
    events: mpsc::Receiver<PolypResult<WatchEvent>>,
    _guard: DropGuard,
}

impl Watch {
    /// Channel capacity used by the backends.
    pub(crate) const CAPACITY: usize = 16;

    pub(crate) fn new(
        events: mpsc::Receiver<PolypResult<WatchEvent>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            events,
            _guard: token.drop_guard(),
        }
    }

    /// Waits for the next event. `None` means the subscription ended.
    pub async fn next(&mut self) -> Option<PolypResult<WatchEvent>> {
        self.events.recv().await
    }
}

/// Operations the driver needs from the cluster store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Writes `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Vec<u8>) -> PolypResult<()>;

    /// Reads `key`; `None` if absent.
    async fn get(&self, key: &str) -> PolypResult<Option<Vec<u8>>>;

    /// Returns true if `key` is present.
    async fn exists(&self, key: &str) -> PolypResult<bool>;

    /// Removes `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> PolypResult<()>;

    /// Subscribes to changes of `key` until `cancel` fires or the returned
    /// [`Watch`] is dropped.
    async fn watch(&self, key: &str, cancel: CancellationToken) -> PolypResult<Watch>;
}

/// Opens a store from a URL.
///
/// - `memory://`: process-local store
/// - `redis://host:port/db` (or `rediss://`): Redis server
pub async fn connect(url: &str) -> PolypResult<Arc<dyn KvStore>> {
    let scheme = url.split_once("://").map(|(scheme, _)| scheme).unwrap_or("");
    match scheme {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "redis" | "rediss" => Ok(Arc::new(RedisStore::connect(url).await?)),
        "" => Err(PolypError::store(
            "connect",
            format!("store url '{}' has no scheme", url),
        )),
        other => Err(PolypError::store(
            "connect",
            format!("unsupported store backend '{}'", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_memory() {
        let store = connect("memory://").await.unwrap();
        store.put("polyp/network/n1", b"{}".to_vec()).await.unwrap();
        assert!(store.exists("polyp/network/n1").await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_backend() {
        let err = connect("zookeeper://10.0.0.1:2181").await.err().unwrap();
        assert!(err.to_string().contains("zookeeper"));

        let err = connect("10.0.0.1:2379").await.err().unwrap();
        assert!(err.to_string().contains("no scheme"));
    }
}
