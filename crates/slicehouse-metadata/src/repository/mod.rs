//! File / Slice Repository
//!
//! Durable, consistent CRUD over Files, Slices and Sinks on top of a
//! [`KvStore`]. Every entity is stored twice:
//!
//! ```text
//! storage/file/all/<key>              canonical copy, CRUD target
//! storage/file/level/<level>/<key>    copy in the current storage level
//! ```
//!
//! A save that changes the level moves the level copy in the same
//! transaction that updates the canonical copy. A delete marks the entity
//! `deleted` for the observers and removes both keys.
//!
//! ## Facades
//!
//! - [`Repository::files`]: rotate, close, state transitions, retries
//! - [`Repository::slices`]: rotate, close, state transitions, retries
//! - [`Repository::sinks`]: sink definitions, activation and deactivation
//! - [`Repository::volumes`] / [`Repository::source_nodes`]: node registrations
//!
//! ## Usage
//!
//! ```ignore
//! let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
//! let repo = Repository::builder(store)
//!     .backoff(RetryBackoff::default())
//!     .file_observer(Arc::new(MyAuditLog))
//!     .build();
//!
//! repo.sinks().create(now, Sink::new(sink_key.clone())).await?;   // opens the first File
//! let file = repo.files().rotate(later, &sink_key).await?;        // closes it, opens a new one
//! ```

mod file;
mod registry;
mod sink;
mod slice;

pub(crate) use file::{close_writing_in, open_in};
pub use file::FileRepository;
pub use registry::{SourceNode, SourceNodeRepository, VolumeRepository};
pub use sink::SinkRepository;
pub use slice::SliceRepository;

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use slicehouse_core::{File, FileKey, KeyPrefix, Level, RetryBackoff, Sink, Slice, UtcTime};
use tracing::debug;

use crate::error::{MetadataError, Result};
use crate::hooks::{FileActivation, FileStateGuard, SliceCascade};
use crate::kv::KvStore;
use crate::observer::{FileObserver, SinkObserver, SliceObserver};
use crate::schema::{self, EntitySchema};
use crate::txn::SaveContext;

/// Repository tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// How many times a read-modify-write operation is retried after losing
    /// a compare-and-swap race.
    pub max_conflict_retries: u32,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 5,
        }
    }
}

/// Entity stored by the repository.
pub(crate) trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync {
    const KIND: &'static str;
    const SCHEMA: EntitySchema;

    fn key_string(&self) -> String;

    /// Level index of the entity, `None` if the entity has no level copy.
    fn level(&self) -> Option<Level>;

    fn is_deleted(&self) -> bool;
}

impl Entity for File {
    const KIND: &'static str = "file";
    const SCHEMA: EntitySchema = schema::FILES;

    fn key_string(&self) -> String {
        self.key.to_string()
    }

    fn level(&self) -> Option<Level> {
        Some(self.state.level())
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }
}

impl Entity for Slice {
    const KIND: &'static str = "slice";
    const SCHEMA: EntitySchema = schema::SLICES;

    fn key_string(&self) -> String {
        self.key.to_string()
    }

    fn level(&self) -> Option<Level> {
        Some(self.state.level())
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }
}

impl Entity for Sink {
    const KIND: &'static str = "sink";
    const SCHEMA: EntitySchema = schema::SINKS;

    fn key_string(&self) -> String {
        self.key.to_string()
    }

    fn level(&self) -> Option<Level> {
        None
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }
}

pub struct RepositoryBuilder {
    store: Arc<dyn KvStore>,
    config: RepositoryConfig,
    backoff: RetryBackoff,
    file_observers: Vec<Arc<dyn FileObserver>>,
    slice_observers: Vec<Arc<dyn SliceObserver>>,
    sink_observers: Vec<Arc<dyn SinkObserver>>,
}

impl RepositoryBuilder {
    pub fn config(mut self, config: RepositoryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn file_observer(mut self, observer: Arc<dyn FileObserver>) -> Self {
        self.file_observers.push(observer);
        self
    }

    pub fn slice_observer(mut self, observer: Arc<dyn SliceObserver>) -> Self {
        self.slice_observers.push(observer);
        self
    }

    pub fn sink_observer(mut self, observer: Arc<dyn SinkObserver>) -> Self {
        self.sink_observers.push(observer);
        self
    }

    pub fn build(self) -> Repository {
        let mut file_observers: Vec<Arc<dyn FileObserver>> = vec![Arc::new(SliceCascade)];
        file_observers.extend(self.file_observers);

        let mut slice_observers: Vec<Arc<dyn SliceObserver>> = vec![Arc::new(FileStateGuard)];
        slice_observers.extend(self.slice_observers);

        let mut sink_observers: Vec<Arc<dyn SinkObserver>> = vec![Arc::new(FileActivation)];
        sink_observers.extend(self.sink_observers);

        Repository {
            store: self.store,
            config: self.config,
            backoff: self.backoff,
            file_observers,
            slice_observers,
            sink_observers,
        }
    }
}

/// Transactional persistence of Files, Slices and Sinks.
pub struct Repository {
    store: Arc<dyn KvStore>,
    config: RepositoryConfig,
    backoff: RetryBackoff,
    file_observers: Vec<Arc<dyn FileObserver>>,
    slice_observers: Vec<Arc<dyn SliceObserver>>,
    sink_observers: Vec<Arc<dyn SinkObserver>>,
}

impl Repository {
    /// Repository with the default configuration and only the built-in observers.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::builder(store).build()
    }

    pub fn builder(store: Arc<dyn KvStore>) -> RepositoryBuilder {
        RepositoryBuilder {
            store,
            config: RepositoryConfig::default(),
            backoff: RetryBackoff::default(),
            file_observers: Vec::new(),
            slice_observers: Vec::new(),
            sink_observers: Vec::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn backoff(&self) -> &RetryBackoff {
        &self.backoff
    }

    /// Start a new transaction; observers and collaborators add to it.
    pub fn begin(&self, now: UtcTime) -> SaveContext {
        SaveContext::new(self.store.clone(), now)
    }

    pub fn files(&self) -> FileRepository<'_> {
        FileRepository::new(self)
    }

    pub fn slices(&self) -> SliceRepository<'_> {
        SliceRepository::new(self)
    }

    pub fn sinks(&self) -> SinkRepository<'_> {
        SinkRepository::new(self)
    }

    pub fn volumes(&self) -> VolumeRepository<'_> {
        VolumeRepository::new(self)
    }

    pub fn source_nodes(&self) -> SourceNodeRepository<'_> {
        SourceNodeRepository::new(self)
    }

    // ------------------------------------------------------------------
    // Saves: write the entity, then notify the observers in order
    // ------------------------------------------------------------------

    pub async fn save_file(
        &self,
        ctx: &mut SaveContext,
        old: Option<&File>,
        updated: &File,
    ) -> Result<()> {
        write_entity(ctx, old, updated)?;
        for observer in &self.file_observers {
            observer.on_file_save(self, ctx, old, updated).await?;
        }
        Ok(())
    }

    pub async fn save_slice(
        &self,
        ctx: &mut SaveContext,
        old: Option<&Slice>,
        updated: &Slice,
    ) -> Result<()> {
        write_entity(ctx, old, updated)?;
        for observer in &self.slice_observers {
            observer.on_slice_save(self, ctx, old, updated).await?;
        }
        Ok(())
    }

    pub async fn save_sink(
        &self,
        ctx: &mut SaveContext,
        old: Option<&Sink>,
        updated: &Sink,
    ) -> Result<()> {
        write_entity(ctx, old, updated)?;

        let was_active = old.is_some_and(|s| s.is_active());
        let is_active = updated.is_active();
        if !was_active && is_active {
            for observer in &self.sink_observers {
                observer.on_sink_activation(self, ctx, updated).await?;
            }
        } else if was_active && !is_active {
            for observer in &self.sink_observers {
                observer.on_sink_deactivation(self, ctx, updated).await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads through a transaction
    // ------------------------------------------------------------------

    pub async fn load_file(&self, ctx: &mut SaveContext, key: &FileKey) -> Result<File> {
        load_required(ctx, &key.to_string()).await
    }

    /// All Slices of the File visible in the transaction.
    pub async fn load_slices_in_file(
        &self,
        ctx: &mut SaveContext,
        key: &FileKey,
    ) -> Result<Vec<Slice>> {
        load_in(ctx, &format!("{}{}", Slice::SCHEMA.all(), key.key_prefix())).await
    }

    /// Run one atomic operation, retrying it when it loses a compare-and-swap race.
    pub(crate) async fn atomic<T, F, Fut>(&self, now: UtcTime, op: F) -> Result<T>
    where
        F: Fn(SaveContext) -> Fut,
        Fut: Future<Output = Result<(T, SaveContext)>>,
    {
        let mut attempt = 0;
        loop {
            let result = match op(self.begin(now)).await {
                Ok((value, ctx)) => ctx.commit().await.map(|_| value),
                Err(e) => Err(e),
            };
            match result {
                Err(e) if e.is_conflict() && attempt < self.config.max_conflict_retries => {
                    attempt += 1;
                    debug!(attempt, error = %e, "Transaction conflict, retrying");
                }
                other => return other,
            }
        }
    }

    /// Entities under a store prefix, read outside any transaction.
    pub(crate) async fn list<E: Entity>(&self, prefix: &str) -> Result<Vec<E>> {
        self.store
            .range(prefix)
            .await?
            .into_iter()
            .map(|kv| serde_json::from_slice(&kv.value).map_err(MetadataError::from))
            .collect()
    }

    pub(crate) async fn get<E: Entity>(&self, key: &str) -> Result<E> {
        match self.store.get(&E::SCHEMA.all_key(&key)).await? {
            Some(kv) => Ok(serde_json::from_slice(&kv.value)?),
            None => Err(MetadataError::NotFound {
                kind: E::KIND,
                key: key.to_string(),
            }),
        }
    }
}

/// Put the canonical and level copies, moving the level copy if the level changed.
fn write_entity<E: Entity>(ctx: &mut SaveContext, old: Option<&E>, updated: &E) -> Result<()> {
    let key = updated.key_string();
    let all_key = E::SCHEMA.all_key(&key);

    match old {
        None => ctx.expect_absent(E::KIND, &all_key)?,
        Some(_) => ctx.expect_present(E::KIND, &all_key)?,
    }

    let old_level = old.and_then(|o| o.level());
    if let Some(old_level) = old_level {
        if updated.is_deleted() || updated.level() != Some(old_level) {
            ctx.delete(E::SCHEMA.in_level_key(old_level, &key));
        }
    }

    if updated.is_deleted() {
        ctx.delete(all_key);
        return Ok(());
    }

    let value = bytes::Bytes::from(serde_json::to_vec(updated)?);
    if let Some(level) = updated.level() {
        ctx.put(E::SCHEMA.in_level_key(level, &key), value.clone());
    }
    ctx.put(all_key, value);
    Ok(())
}

pub(crate) async fn load<E: Entity>(ctx: &mut SaveContext, key: &str) -> Result<Option<E>> {
    match ctx.get(E::KIND, &E::SCHEMA.all_key(&key)).await? {
        Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
        None => Ok(None),
    }
}

pub(crate) async fn load_required<E: Entity>(ctx: &mut SaveContext, key: &str) -> Result<E> {
    load(ctx, key).await?.ok_or_else(|| MetadataError::NotFound {
        kind: E::KIND,
        key: key.to_string(),
    })
}

/// Entities under a full store prefix, read through the transaction.
pub(crate) async fn load_in<E: Entity>(ctx: &mut SaveContext, prefix: &str) -> Result<Vec<E>> {
    ctx.range(E::KIND, prefix)
        .await?
        .into_iter()
        .map(|(_, value)| serde_json::from_slice(&value).map_err(MetadataError::from))
        .collect()
}
