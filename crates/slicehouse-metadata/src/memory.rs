//! In-Memory Versioned Store
//!
//! [`MemoryKvStore`] implements [`KvStore`] with a `BTreeMap` guarded by a
//! `tokio::sync::RwLock` and a broadcast channel for watchers.
//!
//! ## Consistency
//!
//! - Transactions take the write lock, so they are linearized and each one
//!   produces exactly one new revision.
//! - A watch takes its snapshot and subscribes under the read lock, so no
//!   transaction can commit in between; batches at or below the snapshot
//!   revision are skipped, so nothing is delivered twice.
//! - Transactions that do not touch the watched prefix are reported as
//!   [`WatchResponse::Progress`], so watchers always know the store revision.
//!
//! ## Usage
//!
//! ```ignore
//! let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
//! let repo = Repository::new(store.clone());
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tracing::trace;

use crate::error::Result;
use crate::kv::{KeyValue, KvStore, Op, TxnRequest, TxnResponse, WatchEvent, WatchResponse, WatchStream};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Batch {
    revision: i64,
    events: Vec<WatchEvent>,
}

#[derive(Debug, Default)]
struct StoreState {
    revision: i64,
    data: BTreeMap<String, KeyValue>,
}

/// Versioned key-value store kept in process memory.
#[derive(Debug)]
pub struct MemoryKvStore {
    state: RwLock<StoreState>,
    events: broadcast::Sender<Arc<Batch>>,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(StoreState::default()),
            events,
        }
    }

    /// Dump of all keys and values, used by tests to assert the stored layout.
    pub async fn dump(&self) -> Vec<(String, String)> {
        let state = self.state.read().await;
        state
            .data
            .values()
            .map(|kv| (kv.key.clone(), String::from_utf8_lossy(&kv.value).into_owned()))
            .collect()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let state = self.state.read().await;
        Ok(state.data.get(key).cloned())
    }

    async fn range(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let state = self.state.read().await;
        Ok(state
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect())
    }

    async fn txn(&self, txn: TxnRequest) -> Result<TxnResponse> {
        let mut state = self.state.write().await;

        let failed_compares: Vec<usize> = txn
            .compares
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.matches(state.data.get(&c.key)))
            .map(|(i, _)| i)
            .collect();

        if !failed_compares.is_empty() {
            return Ok(TxnResponse {
                succeeded: false,
                revision: state.revision,
                failed_compares,
            });
        }

        if txn.ops.is_empty() {
            return Ok(TxnResponse {
                succeeded: true,
                revision: state.revision,
                failed_compares,
            });
        }

        state.revision += 1;
        let revision = state.revision;
        let mut events = Vec::with_capacity(txn.ops.len());

        for op in txn.ops {
            match op {
                Op::Put { key, value } => {
                    let prev = state.data.get(&key).cloned();
                    let kv = KeyValue {
                        key: key.clone(),
                        value,
                        create_revision: prev.as_ref().map_or(revision, |p| p.create_revision),
                        mod_revision: revision,
                        version: prev.as_ref().map_or(1, |p| p.version + 1),
                    };
                    state.data.insert(key, kv.clone());
                    events.push(WatchEvent::Put { kv, prev });
                }
                Op::Delete { key } => {
                    if let Some(prev) = state.data.remove(&key) {
                        events.push(WatchEvent::Delete {
                            key,
                            prev: Some(prev),
                        });
                    }
                }
            }
        }

        trace!(revision, events = events.len(), "Committed transaction");

        // No receivers is not an error, nobody is watching.
        let _ = self.events.send(Arc::new(Batch { revision, events }));

        Ok(TxnResponse {
            succeeded: true,
            revision,
            failed_compares,
        })
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let state = self.state.read().await;
        let receiver = self.events.subscribe();
        let snapshot: Vec<KeyValue> = state
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        let revision = state.revision;
        drop(state);

        let prefix = prefix.to_string();
        let events = futures::stream::unfold(
            (receiver, revision, prefix),
            |(mut rx, mut last, prefix)| async move {
                loop {
                    match rx.recv().await {
                        Ok(batch) => {
                            if batch.revision <= last {
                                continue;
                            }
                            last = batch.revision;
                            let events: Vec<WatchEvent> = batch
                                .events
                                .iter()
                                .filter(|e| e.key().starts_with(&prefix))
                                .cloned()
                                .collect();
                            let response = if events.is_empty() {
                                WatchResponse::Progress {
                                    revision: batch.revision,
                                }
                            } else {
                                WatchResponse::Events {
                                    revision: batch.revision,
                                    events,
                                }
                            };
                            return Some((response, (rx, last, prefix)));
                        }
                        Err(RecvError::Lagged(_)) => {
                            return Some((WatchResponse::Restart, (rx, last, prefix)));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            },
        )
        .boxed();

        Ok(WatchStream {
            snapshot,
            revision,
            events,
        })
    }

    async fn revision(&self) -> Result<i64> {
        Ok(self.state.read().await.revision)
    }
}
