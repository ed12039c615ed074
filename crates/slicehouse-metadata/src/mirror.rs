//! Prefix Mirror
//!
//! Local, continuously updated copy of every value under a key prefix.
//! Routers use mirrors to know the writer volumes, the source nodes and the
//! writing Slices without querying the store on the write path.
//!
//! ## How It Works
//!
//! ```text
//! start()
//!   └─ watch_prefix(prefix) -> snapshot @ rev N   (applied before start returns)
//!
//! background task
//!   loop:
//!     Events { rev, events } -> apply puts/deletes, publish change and progress
//!     Progress { rev }       -> publish progress only
//!     Restart / stream end   -> watch again, replace the map with the new snapshot
//!     cancelled              -> exit
//! ```
//!
//! Readers subscribe to the change revision to react to changes, or wait
//! until the mirror has caught up with a revision they committed themselves.
//! Progress covers every store revision, including ones that changed other
//! prefixes, so a wait for any committed revision returns.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::kv::{KeyValue, KvStore, WatchEvent, WatchResponse, WatchStream};

const REWATCH_DELAY: Duration = Duration::from_millis(100);

/// Mirrored values keyed by the store key with the prefix removed.
pub struct Mirror<T> {
    prefix: String,
    values: Arc<RwLock<BTreeMap<String, T>>>,
    changes: watch::Receiver<i64>,
    progress: watch::Receiver<i64>,
    cancel: CancellationToken,
    task_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl<T> Mirror<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Load the current snapshot and keep it updated in the background.
    pub async fn start(store: Arc<dyn KvStore>, prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        let stream = store.watch_prefix(&prefix).await?;

        let values = Arc::new(RwLock::new(decode_snapshot(&prefix, &stream.snapshot)));
        let (changes_tx, changes) = watch::channel(stream.revision);
        let (progress_tx, progress) = watch::channel(stream.revision);
        let cancel = CancellationToken::new();

        let task = WatchTask {
            store,
            prefix: prefix.clone(),
            values: values.clone(),
            changes_tx,
            progress_tx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run(stream));

        info!(prefix = %prefix, "Started mirror");

        Ok(Self {
            prefix,
            values,
            changes,
            progress,
            cancel,
            task_handle: Arc::new(RwLock::new(Some(handle))),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub async fn get(&self, key: &str) -> Option<T> {
        self.values.read().await.get(key).cloned()
    }

    /// All mirrored values sorted by key.
    pub async fn snapshot(&self) -> Vec<T> {
        self.values.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.values.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.values.read().await.is_empty()
    }

    /// Store revision the mirror reflects.
    pub fn revision(&self) -> i64 {
        *self.progress.borrow()
    }

    /// Receiver notified after every applied change of the prefix.
    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.changes.clone()
    }

    /// Wait until the mirror reflects at least `revision`.
    ///
    /// Returns `false` if the mirror stopped first.
    pub async fn wait_for_revision(&self, revision: i64) -> bool {
        let mut rx = self.progress.clone();
        let reached = rx.wait_for(|current| *current >= revision).await.is_ok();
        reached
    }

    /// Stop the background watch.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task_handle.write().await.take() {
            let _ = handle.await;
        }
        debug!(prefix = %self.prefix, "Stopped mirror");
    }
}

impl<T> Drop for Mirror<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct WatchTask<T> {
    store: Arc<dyn KvStore>,
    prefix: String,
    values: Arc<RwLock<BTreeMap<String, T>>>,
    changes_tx: watch::Sender<i64>,
    progress_tx: watch::Sender<i64>,
    cancel: CancellationToken,
}

impl<T> WatchTask<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn run(self, mut stream: WatchStream) {
        loop {
            let response = tokio::select! {
                _ = self.cancel.cancelled() => break,
                response = stream.events.next() => response,
            };

            match response {
                Some(WatchResponse::Events { revision, events }) => {
                    self.apply(events).await;
                    self.changes_tx.send_replace(revision);
                    self.progress_tx.send_replace(revision);
                }
                Some(WatchResponse::Progress { revision }) => {
                    self.progress_tx.send_replace(revision);
                }
                Some(WatchResponse::Restart) | None => {
                    warn!(prefix = %self.prefix, "Mirror watch interrupted, watching again");
                    match self.rewatch().await {
                        Some(next) => stream = next,
                        None => break,
                    }
                }
            }
        }
    }

    async fn apply(&self, events: Vec<WatchEvent>) {
        let mut values = self.values.write().await;
        for event in events {
            match event {
                WatchEvent::Put { kv, .. } => {
                    if let Some((key, value)) = decode::<T>(&self.prefix, &kv) {
                        values.insert(key, value);
                    }
                }
                WatchEvent::Delete { key, .. } => {
                    values.remove(strip(&self.prefix, &key));
                }
            }
        }
    }

    /// Watch again until it succeeds or the mirror is cancelled.
    async fn rewatch(&self) -> Option<WatchStream> {
        loop {
            match self.store.watch_prefix(&self.prefix).await {
                Ok(stream) => {
                    *self.values.write().await = decode_snapshot(&self.prefix, &stream.snapshot);
                    self.changes_tx.send_replace(stream.revision);
                    self.progress_tx.send_replace(stream.revision);
                    return Some(stream);
                }
                Err(e) => {
                    warn!(prefix = %self.prefix, error = %e, "Cannot watch prefix");
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(REWATCH_DELAY) => {}
            }
        }
    }
}

fn strip<'a>(prefix: &str, key: &'a str) -> &'a str {
    key.strip_prefix(prefix).unwrap_or(key)
}

fn decode<T: DeserializeOwned>(prefix: &str, kv: &KeyValue) -> Option<(String, T)> {
    match serde_json::from_slice(&kv.value) {
        Ok(value) => Some((strip(prefix, &kv.key).to_string(), value)),
        Err(e) => {
            warn!(key = %kv.key, error = %e, "Skipping undecodable mirrored value");
            None
        }
    }
}

fn decode_snapshot<T: DeserializeOwned>(prefix: &str, snapshot: &[KeyValue]) -> BTreeMap<String, T> {
    snapshot.iter().filter_map(|kv| decode(prefix, kv)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::Op;
    use crate::kv::TxnRequest;
    use crate::memory::MemoryKvStore;
    use bytes::Bytes;

    async fn put(store: &MemoryKvStore, key: &str, value: &str) -> i64 {
        let response = store
            .txn(TxnRequest {
                compares: vec![],
                ops: vec![Op::Put {
                    key: key.to_string(),
                    value: Bytes::from(value.to_string()),
                }],
            })
            .await
            .unwrap();
        response.revision
    }

    async fn delete(store: &MemoryKvStore, key: &str) -> i64 {
        let response = store
            .txn(TxnRequest {
                compares: vec![],
                ops: vec![Op::Delete {
                    key: key.to_string(),
                }],
            })
            .await
            .unwrap();
        response.revision
    }

    #[tokio::test]
    async fn test_mirror_follows_changes() {
        let store = Arc::new(MemoryKvStore::new());
        put(&store, "p/a", "1").await;
        put(&store, "other/x", "9").await;

        let mirror: Mirror<u32> = Mirror::start(store.clone(), "p/").await.unwrap();
        assert_eq!(mirror.snapshot().await, vec![1]);

        let revision = put(&store, "p/b", "2").await;
        assert!(mirror.wait_for_revision(revision).await);
        assert_eq!(mirror.get("b").await, Some(2));

        let revision = delete(&store, "p/a").await;
        assert!(mirror.wait_for_revision(revision).await);
        assert_eq!(mirror.snapshot().await, vec![2]);

        mirror.stop().await;
    }

    #[tokio::test]
    async fn test_mirror_waits_for_revision_of_other_prefix() {
        let store = Arc::new(MemoryKvStore::new());
        put(&store, "p/a", "1").await;

        let mirror: Mirror<u32> = Mirror::start(store.clone(), "p/").await.unwrap();
        let mut changes = mirror.subscribe();
        changes.borrow_and_update();

        let revision = put(&store, "other/x", "9").await;
        let reached = tokio::time::timeout(
            Duration::from_secs(3),
            mirror.wait_for_revision(revision),
        )
        .await
        .expect("wait for a revision of another prefix should return");
        assert!(reached);
        assert_eq!(mirror.revision(), revision);

        // Progress alone is not a change of the mirrored values
        assert!(!changes.has_changed().unwrap());
        assert_eq!(mirror.snapshot().await, vec![1]);

        mirror.stop().await;
    }

    #[tokio::test]
    async fn test_mirror_skips_undecodable_values() {
        let store = Arc::new(MemoryKvStore::new());
        put(&store, "p/a", "not a number").await;
        put(&store, "p/b", "2").await;

        let mirror: Mirror<u32> = Mirror::start(store.clone(), "p/").await.unwrap();
        assert_eq!(mirror.len().await, 1);
        mirror.stop().await;
    }
}
