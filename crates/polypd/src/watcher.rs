//! Consistency watcher
//!
//! One task per cached network, subscribed to the network's shared-store
//! key. When the record is deleted, the network is evicted from the cache
//! and its links torn down. Cancellation (explicit local delete or daemon
//! shutdown) always wins over a pending deletion event.

use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

use polyp_store::WatchEvent;

use crate::networks::{Network, NetworkRegistry};

/// Watches `key` until the record is deleted, the stream ends, or the
/// network's token is cancelled.
pub(crate) async fn watch_network(
    registry: Weak<NetworkRegistry>,
    network: Arc<Network>,
    key: String,
) {
    let cancel = network.cancel_token().clone();
    let id = network.id().to_string();

    let subscribed = {
        let Some(registry) = registry.upgrade() else {
            return;
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            subscribed = registry.store().watch(&key, cancel.clone()) => subscribed,
        }
    };
    let mut watch = match subscribed {
        Ok(watch) => watch,
        Err(e) => {
            error!(network = %id, error = %e, "could not watch network record");
            return;
        }
    };
    debug!(network = %id, key = %key, "watcher bound");

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = watch.next() => event,
        };

        match event {
            Some(Ok(WatchEvent::Put(_))) => {
                debug!(network = %id, "network record written");
            }
            Some(Ok(WatchEvent::Deleted)) => {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let _gate = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    gate = registry.lock_network(&id) => gate,
                };
                if let Err(e) = registry.evict(&network).await {
                    warn!(network = %id, error = %e, "teardown after remote delete failed");
                }
                break;
            }
            Some(Err(e)) => {
                error!(network = %id, error = %e, "network watch failed, stopping watcher");
                break;
            }
            None => {
                warn!(network = %id, "network watch closed");
                break;
            }
        }
    }

    debug!(network = %id, "watcher stopped");
}
