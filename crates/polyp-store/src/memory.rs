//! In-process store backend.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use polyp_common::PolypResult;

use crate::{KvStore, Watch, WatchEvent};

const CHANGE_BACKLOG: usize = 256;

#[derive(Debug, Clone)]
struct Change {
    key: String,
    event: WatchEvent,
}

struct Inner {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    changes: broadcast::Sender<Change>,
}

/// Process-local [`KvStore`].
///
/// Cloning yields another handle onto the same data, so two drivers built on
/// clones of one `MemoryStore` behave like two hosts sharing a cluster store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BACKLOG);
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                changes,
            }),
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self, key: &str) -> WatchEvent {
        match self.inner.entries.read().get(key) {
            Some(value) => WatchEvent::Put(value.clone()),
            None => WatchEvent::Deleted,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> PolypResult<()> {
        let mut entries = self.inner.entries.write();
        entries.insert(key.to_string(), value.clone());
        // Published under the write lock so subscribers see writes in order.
        let _ = self.inner.changes.send(Change {
            key: key.to_string(),
            event: WatchEvent::Put(value),
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> PolypResult<Option<Vec<u8>>> {
        Ok(self.inner.entries.read().get(key).cloned())
    }

    async fn exists(&self, key: &str) -> PolypResult<bool> {
        Ok(self.inner.entries.read().contains_key(key))
    }

    async fn delete(&self, key: &str) -> PolypResult<()> {
        let mut entries = self.inner.entries.write();
        if entries.remove(key).is_some() {
            let _ = self.inner.changes.send(Change {
                key: key.to_string(),
                event: WatchEvent::Deleted,
            });
        }
        Ok(())
    }

    async fn watch(&self, key: &str, cancel: CancellationToken) -> PolypResult<Watch> {
        // Subscribe before taking the snapshot so no change falls in between.
        let mut changes = self.inner.changes.subscribe();
        let (tx, rx) = mpsc::channel(Watch::CAPACITY);
        let token = cancel.child_token();
        let task_token = token.clone();
        let store = self.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            if tx.send(Ok(store.snapshot(&key))).await.is_err() {
                return;
            }
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    change = changes.recv() => match change {
                        Ok(change) if change.key == key => {
                            if tx.send(Ok(change.event)).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(key = %key, skipped, "memory watch lagged, resending current state");
                            if tx.send(Ok(store.snapshot(&key))).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!(key = %key, "memory watch released");
        });

        Ok(Watch::new(rx, token))
    }
}
