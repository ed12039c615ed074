//! Slicehouse Metadata Repository
//!
//! Durable state of the ingestion write path: Files, Slices, sink
//! definitions, writer volumes and source nodes, persisted in a versioned
//! key-value store with compare-and-swap transactions.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  rotate / transitions  ┌──────────────┐  txn  ┌──────────┐
//! │ Operators  │ ─────────────────────► │  Repository  │ ────► │ KvStore  │
//! └────────────┘                        │  + observers │       └────┬─────┘
//!                                       └──────────────┘            │ watch
//! ┌────────────┐           mirrors                                  │
//! │  Routers   │ ◄──────────────────────────────────────────────────┘
//! └────────────┘
//! ```
//!
//! - [`Repository`]: transactional CRUD with built-in consistency observers
//! - [`SaveContext`]: one atomic transaction shared by a whole cascade
//! - [`Mirror`]: local copy of a key prefix kept current by a watch
//! - [`MemoryKvStore`]: in-process [`KvStore`] implementation
//!
//! ## Usage Example
//!
//! ```ignore
//! use slicehouse_metadata::{MemoryKvStore, Repository};
//!
//! let repo = Repository::new(Arc::new(MemoryKvStore::new()));
//! repo.volumes().register(&volume).await?;
//! repo.sinks().create(now, Sink::new(sink_key.clone())).await?;
//!
//! // Later: close the writing file and open the next one
//! let file = repo.files().rotate(now, &sink_key).await?;
//! ```

pub mod error;
pub mod kv;
pub mod memory;
pub mod mirror;
pub mod observer;
pub mod repository;
pub mod schema;
pub mod txn;

mod hooks;

pub use error::{MetadataError, Result};
pub use kv::{KvStore, WatchEvent, WatchResponse, WatchStream};
pub use memory::MemoryKvStore;
pub use mirror::Mirror;
pub use observer::{FileObserver, SinkObserver, SliceObserver};
pub use repository::{
    FileRepository, Repository, RepositoryBuilder, RepositoryConfig, SinkRepository, SliceRepository,
    SourceNode, SourceNodeRepository, VolumeRepository,
};
pub use txn::SaveContext;
