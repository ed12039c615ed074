//! Versioned Key-Value Store Abstraction
//!
//! The repository persists entities in a distributed, versioned key-value
//! store with the etcd data model:
//!
//! - every committed transaction increments the store **revision**
//! - every key carries `create_revision`, `mod_revision` and `version`
//! - a missing key has all three equal to zero
//! - a transaction is a list of **compares** and a list of **ops**; the ops
//!   are applied atomically only if every compare holds
//! - a **watch** over a key prefix delivers a consistent snapshot followed by
//!   every later change, in revision order, and progress notifications for
//!   revisions that did not touch the prefix
//!
//! ## Optimistic Concurrency
//!
//! ```text
//! create: compare version(key) == 0            -> else AlreadyExists
//! update: compare mod_revision(key) == read_rev -> else NotFound / Conflict
//! ```
//!
//! ## Implementations
//!
//! - [`MemoryKvStore`](crate::MemoryKvStore): in-process store, used by tests
//!   and single-node deployments
//!
//! Any etcd-compatible backend can implement [`KvStore`]; the only extra
//! requirement is reporting which compares failed, which etcd clients derive
//! with a follow-up read.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::Result;

/// One stored key with its revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareTarget {
    Version,
    CreateRevision,
    ModRevision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    Less,
}

/// Transaction precondition over one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    pub target: CompareTarget,
    pub op: CompareOp,
    pub value: i64,
}

impl Compare {
    /// The key must not exist.
    pub fn not_exists(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::Version,
            op: CompareOp::Equal,
            value: 0,
        }
    }

    /// The key must exist.
    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::Version,
            op: CompareOp::Greater,
            value: 0,
        }
    }

    /// The key must not be modified since `revision`.
    pub fn mod_revision(key: impl Into<String>, revision: i64) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::ModRevision,
            op: CompareOp::Equal,
            value: revision,
        }
    }

    /// Evaluate the compare against the current value of the key.
    pub fn matches(&self, current: Option<&KeyValue>) -> bool {
        let actual = match (self.target, current) {
            (_, None) => 0,
            (CompareTarget::Version, Some(kv)) => kv.version,
            (CompareTarget::CreateRevision, Some(kv)) => kv.create_revision,
            (CompareTarget::ModRevision, Some(kv)) => kv.mod_revision,
        };
        match self.op {
            CompareOp::Equal => actual == self.value,
            CompareOp::NotEqual => actual != self.value,
            CompareOp::Greater => actual > self.value,
            CompareOp::Less => actual < self.value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Put { key: String, value: Bytes },
    Delete { key: String },
}

impl Op {
    pub fn key(&self) -> &str {
        match self {
            Op::Put { key, .. } | Op::Delete { key } => key,
        }
    }
}

/// Atomic multi-key transaction.
#[derive(Debug, Clone, Default)]
pub struct TxnRequest {
    pub compares: Vec<Compare>,
    pub ops: Vec<Op>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnResponse {
    pub succeeded: bool,
    /// Store revision after the transaction, or the current one if it failed.
    pub revision: i64,
    /// Indexes of the compares that did not hold.
    pub failed_compares: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put {
        kv: KeyValue,
        prev: Option<KeyValue>,
    },
    Delete {
        key: String,
        prev: Option<KeyValue>,
    },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { kv, .. } => &kv.key,
            WatchEvent::Delete { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchResponse {
    /// Changes committed in one transaction.
    Events { revision: i64, events: Vec<WatchEvent> },
    /// The store reached `revision` without changing the watched prefix.
    Progress { revision: i64 },
    /// The watcher fell behind and missed events, it must watch again.
    Restart,
}

/// Snapshot of a prefix followed by the stream of its changes.
pub struct WatchStream {
    pub snapshot: Vec<KeyValue>,
    /// Store revision of the snapshot, the stream starts after it.
    pub revision: i64,
    pub events: BoxStream<'static, WatchResponse>,
}

impl std::fmt::Debug for WatchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchStream")
            .field("snapshot", &self.snapshot.len())
            .field("revision", &self.revision)
            .finish()
    }
}

/// Versioned key-value store.
///
/// All methods are async and the store is shared across tasks via
/// `Arc<dyn KvStore>`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// All keys starting with `prefix`, sorted by key.
    async fn range(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    async fn txn(&self, txn: TxnRequest) -> Result<TxnResponse>;

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream>;

    async fn revision(&self) -> Result<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(version: i64, mod_revision: i64) -> KeyValue {
        KeyValue {
            key: "k".into(),
            value: Bytes::new(),
            create_revision: 1,
            mod_revision,
            version,
        }
    }

    #[test]
    fn test_compare_missing_key_is_zero() {
        assert!(Compare::not_exists("k").matches(None));
        assert!(!Compare::exists("k").matches(None));
        assert!(!Compare::mod_revision("k", 5).matches(None));
    }

    #[test]
    fn test_compare_existing_key() {
        let current = kv(2, 5);
        assert!(!Compare::not_exists("k").matches(Some(&current)));
        assert!(Compare::exists("k").matches(Some(&current)));
        assert!(Compare::mod_revision("k", 5).matches(Some(&current)));
        assert!(!Compare::mod_revision("k", 4).matches(Some(&current)));
    }
}
