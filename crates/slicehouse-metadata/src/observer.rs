//! Entity Change Observers
//!
//! Cross-entity side effects are expressed as observers. The repository keeps
//! a fixed, ordered list of observers per entity type, built once by
//! [`RepositoryBuilder`](crate::RepositoryBuilder). Every save calls them in
//! order with the `(old, updated)` pair and the [`SaveContext`] of the
//! running transaction; an observer may read through the context and add
//! more operations to it. An error from any observer aborts the whole
//! transaction.
//!
//! ```text
//! save_file(old, updated)
//!   ├─ write canonical + level keys
//!   └─ for observer in file_observers:
//!         observer.on_file_save(repo, ctx, old, updated)
//!           └─ repo.save_slice(...)  // same ctx, same transaction
//! ```
//!
//! The built-in observers live in [`hooks`](crate::hooks) and always run
//! before the ones registered by collaborators.

use async_trait::async_trait;
use slicehouse_core::{File, Sink, Slice};

use crate::error::Result;
use crate::repository::Repository;
use crate::txn::SaveContext;

#[async_trait]
pub trait FileObserver: Send + Sync {
    /// Called on every File save; `old` is `None` on create.
    async fn on_file_save(
        &self,
        repo: &Repository,
        ctx: &mut SaveContext,
        old: Option<&File>,
        updated: &File,
    ) -> Result<()>;
}

#[async_trait]
pub trait SliceObserver: Send + Sync {
    /// Called on every Slice save; `old` is `None` on create.
    async fn on_slice_save(
        &self,
        repo: &Repository,
        ctx: &mut SaveContext,
        old: Option<&Slice>,
        updated: &Slice,
    ) -> Result<()>;
}

#[async_trait]
pub trait SinkObserver: Send + Sync {
    /// The sink started accepting records: created enabled, or enabled.
    async fn on_sink_activation(
        &self,
        _repo: &Repository,
        _ctx: &mut SaveContext,
        _sink: &Sink,
    ) -> Result<()> {
        Ok(())
    }

    /// The sink stopped accepting records: disabled or deleted.
    async fn on_sink_deactivation(
        &self,
        _repo: &Repository,
        _ctx: &mut SaveContext,
        _sink: &Sink,
    ) -> Result<()> {
        Ok(())
    }
}
