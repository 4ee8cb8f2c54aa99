//! Redis store backend.
//!
//! Commands go through a [`ConnectionManager`]; each watch opens its own
//! pub/sub connection subscribed to the key's keyspace channel
//! (`__keyspace@<db>__:<key>`), which Redis publishes to only when
//! `notify-keyspace-events` includes keyspace (`K`) and generic/string
//! classes. [`RedisStore::connect`] tries to enable them.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use polyp_common::{PolypError, PolypResult};

use crate::{KvStore, Watch, WatchEvent};

/// Notification classes: keyspace channel, generic commands, strings,
/// expiry and eviction.
const KEYSPACE_EVENTS: &str = "K$gxe";

/// [`KvStore`] backed by a Redis server.
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
    db: i64,
}

impl RedisStore {
    /// Connects to `url` (e.g. `redis://10.0.0.5:6379/0`).
    #[instrument]
    pub async fn connect(url: &str) -> PolypResult<Self> {
        let client = Client::open(url).map_err(|e| PolypError::store("connect", e))?;
        let db = client.get_connection_info().redis.db;

        let mut connection = client
            .get_connection_manager()
            .await
            .map_err(|e| PolypError::store("connect", e))?;

        let enabled: redis::RedisResult<()> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg(KEYSPACE_EVENTS)
            .query_async(&mut connection)
            .await;
        if let Err(e) = enabled {
            warn!(
                error = %e,
                "could not enable keyspace notifications, watches rely on server configuration"
            );
        }

        info!(db, "Connected to Redis store");
        Ok(Self {
            client,
            connection,
            db,
        })
    }

    fn keyspace_channel(&self, key: &str) -> String {
        format!("__keyspace@{}__:{}", self.db, key)
    }
}

async fn current_state(conn: &mut ConnectionManager, key: &str) -> PolypResult<WatchEvent> {
    let value: Option<Vec<u8>> = conn
        .get(key)
        .await
        .map_err(|e| PolypError::store("get", e))?;
    Ok(match value {
        Some(value) => WatchEvent::Put(value),
        None => WatchEvent::Deleted,
    })
}

#[async_trait]
impl KvStore for RedisStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> PolypResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .set(key, value)
            .await
            .map_err(|e| PolypError::store("put", e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> PolypResult<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        conn.get(key)
            .await
            .map_err(|e| PolypError::store("get", e))
    }

    async fn exists(&self, key: &str) -> PolypResult<bool> {
        let mut conn = self.connection.clone();
        conn.exists(key)
            .await
            .map_err(|e| PolypError::store("exists", e))
    }

    async fn delete(&self, key: &str) -> PolypResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .del(key)
            .await
            .map_err(|e| PolypError::store("delete", e))?;
        Ok(())
    }

    async fn watch(&self, key: &str, cancel: CancellationToken) -> PolypResult<Watch> {
        let channel = self.keyspace_channel(key);
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| PolypError::store("watch", e))?;
        pubsub
            .subscribe(&channel)
            .await
            .map_err(|e| PolypError::store("watch", e))?;

        let (tx, rx) = mpsc::channel(Watch::CAPACITY);
        let token = cancel.child_token();
        let task_token = token.clone();
        let mut conn = self.connection.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            // Subscribed already, so reading now cannot miss a change.
            if tx.send(current_state(&mut conn, &key).await).await.is_err() {
                return;
            }
            let mut messages = Box::pin(pubsub.on_message());
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    message = messages.next() => {
                        let Some(message) = message else {
                            let _ = tx
                                .send(Err(PolypError::store("watch", "subscription closed by server")))
                                .await;
                            break;
                        };
                        let operation: String = match message.get_payload() {
                            Ok(operation) => operation,
                            Err(e) => {
                                warn!(key = %key, error = %e, "unreadable keyspace notification");
                                continue;
                            }
                        };
                        let event = match operation.as_str() {
                            "del" | "expired" | "evicted" | "rename_from" => Ok(WatchEvent::Deleted),
                            "set" | "rename_to" => current_state(&mut conn, &key).await,
                            _ => continue,
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(key = %key, "redis watch released");
        });

        Ok(Watch::new(rx, token))
    }
}
