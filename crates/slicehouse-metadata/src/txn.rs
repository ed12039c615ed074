//! Save Context: the Atomic Transaction Builder
//!
//! Every repository operation builds one [`SaveContext`] and commits it as a
//! single compare-and-swap transaction. Observers receive the same context,
//! so a whole cascade (File closed -> Slices closed) commits or aborts as one
//! unit.
//!
//! ## Read-Your-Writes
//!
//! Reads go through the context. A key written earlier in the same context
//! returns the pending value; a key read from the store is **guarded**: the
//! transaction only commits if the key is still at the revision that was
//! read.
//!
//! ```text
//! ctx.get("a")          -> store read, guard mod_revision(a) == 7
//! ctx.put("a", v2)      -> pending op
//! ctx.get("a")          -> v2 (pending, no store read)
//! ctx.expect_absent("b")-> guard version(b) == 0, AlreadyExists on failure
//! ctx.commit()          -> txn { compares: [a@7, b absent], ops: [put a, ...] }
//! ```
//!
//! ## Failure Mapping
//!
//! - create guard failed -> `AlreadyExists`
//! - read/update guard failed and the key is gone -> `NotFound`
//! - read/update guard failed otherwise -> `Conflict` (the caller re-reads and retries)

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use slicehouse_core::UtcTime;
use tracing::debug;

use crate::error::{MetadataError, Result};
use crate::kv::{Compare, KvStore, Op, TxnRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardKind {
    Read,
    Create,
    Update,
}

#[derive(Debug, Clone)]
struct Guard {
    entity: &'static str,
    kind: GuardKind,
    compare: Compare,
}

/// Pending atomic transaction with its read set.
pub struct SaveContext {
    store: Arc<dyn KvStore>,
    now: UtcTime,
    guards: BTreeMap<String, Guard>,
    ops: BTreeMap<String, Op>,
}

impl std::fmt::Debug for SaveContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveContext")
            .field("now", &self.now)
            .field("guards", &self.guards.len())
            .field("ops", &self.ops.len())
            .finish()
    }
}

impl SaveContext {
    pub fn new(store: Arc<dyn KvStore>, now: UtcTime) -> Self {
        Self {
            store,
            now,
            guards: BTreeMap::new(),
            ops: BTreeMap::new(),
        }
    }

    /// Timestamp shared by every change in the transaction.
    pub fn now(&self) -> UtcTime {
        self.now
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Read a key through the transaction.
    pub async fn get(&mut self, entity: &'static str, key: &str) -> Result<Option<Bytes>> {
        if let Some(op) = self.ops.get(key) {
            return Ok(match op {
                Op::Put { value, .. } => Some(value.clone()),
                Op::Delete { .. } => None,
            });
        }

        let kv = self.store.get(key).await?;
        let compare = match &kv {
            Some(kv) => Compare::mod_revision(key, kv.mod_revision),
            None => Compare::not_exists(key),
        };
        self.guard(entity, GuardKind::Read, compare);
        Ok(kv.map(|kv| kv.value))
    }

    /// Read all keys with the prefix through the transaction, sorted by key.
    pub async fn range(&mut self, entity: &'static str, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        let mut merged = BTreeMap::new();
        for kv in self.store.range(prefix).await? {
            self.guard(entity, GuardKind::Read, Compare::mod_revision(&kv.key, kv.mod_revision));
            merged.insert(kv.key, kv.value);
        }

        let pending = self
            .ops
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix));
        for (key, op) in pending {
            match op {
                Op::Put { value, .. } => {
                    merged.insert(key.clone(), value.clone());
                }
                Op::Delete { .. } => {
                    merged.remove(key);
                }
            }
        }

        Ok(merged.into_iter().collect())
    }

    /// Require the key does not exist when the transaction commits.
    pub fn expect_absent(&mut self, entity: &'static str, key: &str) -> Result<()> {
        if matches!(self.ops.get(key), Some(Op::Put { .. })) {
            return Err(already_exists(entity, key));
        }

        let absent = Compare::not_exists(key);
        match self.guards.get_mut(key) {
            Some(guard) if guard.compare == absent => {
                guard.kind = GuardKind::Create;
                Ok(())
            }
            Some(_) if self.ops.contains_key(key) => Ok(()),
            Some(_) => Err(already_exists(entity, key)),
            None => {
                self.guard(entity, GuardKind::Create, absent);
                Ok(())
            }
        }
    }

    /// Require the key exists and is unchanged since it was read.
    pub fn expect_present(&mut self, entity: &'static str, key: &str) -> Result<()> {
        if self.ops.contains_key(key) {
            return Ok(());
        }

        match self.guards.get(key) {
            Some(guard) if guard.compare == Compare::not_exists(key) => Err(MetadataError::NotFound {
                kind: entity,
                key: key.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.guard(entity, GuardKind::Update, Compare::exists(key));
                Ok(())
            }
        }
    }

    pub fn put(&mut self, key: String, value: Bytes) {
        self.ops.insert(key.clone(), Op::Put { key, value });
    }

    pub fn delete(&mut self, key: String) {
        self.ops.insert(key.clone(), Op::Delete { key });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn guard(&mut self, entity: &'static str, kind: GuardKind, compare: Compare) {
        self.guards
            .entry(compare.key.clone())
            .or_insert(Guard {
                entity,
                kind,
                compare,
            });
    }

    /// Commit all pending operations atomically, returns the new store revision.
    pub async fn commit(self) -> Result<i64> {
        let guards: Vec<Guard> = self.guards.into_values().collect();
        let request = TxnRequest {
            compares: guards.iter().map(|g| g.compare.clone()).collect(),
            ops: self.ops.into_values().collect(),
        };
        let ops = request.ops.len();

        let response = self.store.txn(request).await?;
        if response.succeeded {
            debug!(revision = response.revision, ops, "Transaction committed");
            return Ok(response.revision);
        }

        let Some(guard) = response
            .failed_compares
            .first()
            .and_then(|i| guards.get(*i))
        else {
            return Err(MetadataError::Store(
                "transaction failed without a failed compare".to_string(),
            ));
        };

        let key = guard.compare.key.clone();
        debug!(key = %key, kind = ?guard.kind, "Transaction precondition failed");

        match guard.kind {
            GuardKind::Create => Err(already_exists(guard.entity, &key)),
            GuardKind::Read if guard.compare == Compare::not_exists(&key) => {
                Err(MetadataError::Conflict {
                    kind: guard.entity,
                    key,
                })
            }
            GuardKind::Read | GuardKind::Update => match self.store.get(&key).await? {
                None => Err(MetadataError::NotFound {
                    kind: guard.entity,
                    key,
                }),
                Some(_) => Err(MetadataError::Conflict {
                    kind: guard.entity,
                    key,
                }),
            },
        }
    }
}

fn already_exists(entity: &'static str, key: &str) -> MetadataError {
    MetadataError::AlreadyExists {
        kind: entity,
        key: key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKvStore;

    fn now() -> UtcTime {
        UtcTime::parse("2000-01-01T00:00:00.000Z").unwrap()
    }

    async fn seed(store: &Arc<dyn KvStore>, key: &str, value: &str) {
        let mut ctx = SaveContext::new(store.clone(), now());
        ctx.put(key.to_string(), Bytes::from(value.to_string()));
        ctx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_your_writes() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        seed(&store, "p/a", "1").await;

        let mut ctx = SaveContext::new(store.clone(), now());
        ctx.put("p/b".into(), Bytes::from("2"));
        ctx.delete("p/a".into());

        assert_eq!(ctx.get("test", "p/b").await.unwrap(), Some(Bytes::from("2")));
        assert_eq!(ctx.get("test", "p/a").await.unwrap(), None);
        let range = ctx.range("test", "p/").await.unwrap();
        assert_eq!(range, vec![("p/b".to_string(), Bytes::from("2"))]);
    }

    #[tokio::test]
    async fn test_create_existing_key_fails() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        seed(&store, "k", "1").await;

        let mut ctx = SaveContext::new(store.clone(), now());
        ctx.expect_absent("file", "k").unwrap();
        ctx.put("k".into(), Bytes::from("2"));
        let err = ctx.commit().await.unwrap_err();
        assert!(matches!(err, MetadataError::AlreadyExists { kind: "file", .. }));
    }

    #[tokio::test]
    async fn test_concurrent_modification_is_conflict() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        seed(&store, "k", "1").await;

        let mut ctx = SaveContext::new(store.clone(), now());
        ctx.get("file", "k").await.unwrap();
        ctx.expect_present("file", "k").unwrap();
        ctx.put("k".into(), Bytes::from("2"));

        seed(&store, "k", "other").await;

        let err = ctx.commit().await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_concurrent_delete_is_not_found() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        seed(&store, "k", "1").await;

        let mut ctx = SaveContext::new(store.clone(), now());
        ctx.get("file", "k").await.unwrap();
        ctx.put("k".into(), Bytes::from("2"));

        let mut other = SaveContext::new(store.clone(), now());
        other.delete("k".into());
        other.commit().await.unwrap();

        let err = ctx.commit().await.unwrap_err();
        assert!(matches!(err, MetadataError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_of_missing_key_is_not_found() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let mut ctx = SaveContext::new(store.clone(), now());
        assert!(ctx.get("file", "k").await.unwrap().is_none());
        let err = ctx.expect_present("file", "k").unwrap_err();
        assert!(matches!(err, MetadataError::NotFound { .. }));
    }
}
