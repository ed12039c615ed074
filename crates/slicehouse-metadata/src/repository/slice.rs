use slicehouse_core::{
    File, FileVolumeKey, KeyPrefix, Level, Slice, SliceKey, SliceState, UtcTime,
};
use tracing::{error, info};

use super::{load_in, load_required, Repository};
use crate::error::{MetadataError, Result};
use crate::schema;
use crate::txn::SaveContext;

/// Slice operations.
pub struct SliceRepository<'a> {
    repo: &'a Repository,
}

impl<'a> SliceRepository<'a> {
    pub(crate) fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    pub async fn get(&self, key: &SliceKey) -> Result<Slice> {
        self.repo.get(&key.to_string()).await
    }

    pub async fn list_all(&self) -> Result<Vec<Slice>> {
        self.repo.list(&schema::SLICES.all()).await
    }

    /// Slices under a project, branch, source, sink, file or file volume.
    pub async fn list_in(&self, parent: &impl KeyPrefix) -> Result<Vec<Slice>> {
        self.repo
            .list(&format!("{}{}", schema::SLICES.all(), parent.key_prefix()))
            .await
    }

    pub async fn list_in_level(&self, parent: &impl KeyPrefix, level: Level) -> Result<Vec<Slice>> {
        self.repo
            .list(&format!("{}{}", schema::SLICES.in_level(level), parent.key_prefix()))
            .await
    }

    pub async fn list_in_state(
        &self,
        parent: &impl KeyPrefix,
        state: SliceState,
    ) -> Result<Vec<Slice>> {
        let slices = self.list_in_level(parent, state.level()).await?;
        Ok(slices.into_iter().filter(|s| s.state == state).collect())
    }

    /// Close the writing Slice in the file volume and open a new one, atomically.
    pub async fn rotate(&self, now: UtcTime, key: &FileVolumeKey) -> Result<Slice> {
        let repo = self.repo;
        repo.atomic(now, |mut ctx| async move {
            let file: File = load_required(&mut ctx, &key.file_key.to_string()).await?;
            if !file.volumes.contains(&key.volume_id) {
                return Err(MetadataError::NotFound {
                    kind: "file volume",
                    key: key.to_string(),
                });
            }

            close_writing_in(repo, &mut ctx, key).await?;
            let slice = Slice::new(key.slice(ctx.now()), file.encoding.clone());
            repo.save_slice(&mut ctx, None, &slice).await?;
            info!(slice_key = %slice.key, "Opened slice");
            Ok((slice, ctx))
        })
        .await
    }

    /// Close the writing Slice in the file volume without opening a new one.
    pub async fn close(&self, now: UtcTime, key: &FileVolumeKey) -> Result<Vec<Slice>> {
        let repo = self.repo;
        repo.atomic(now, |mut ctx| async move {
            let closed = close_writing_in(repo, &mut ctx, key).await?;
            Ok((closed, ctx))
        })
        .await
    }

    /// Move the Slice from `from` to `to`.
    pub async fn state_transition(
        &self,
        now: UtcTime,
        key: &SliceKey,
        from: SliceState,
        to: SliceState,
    ) -> Result<Slice> {
        if to == SliceState::Closing {
            return Err(MetadataError::InvalidOperation(format!(
                "unexpected slice transition to the state \"{}\", use Rotate* or Close* methods",
                SliceState::Closing
            )));
        }

        let repo = self.repo;
        repo.atomic(now, |mut ctx| async move {
            let slice: Slice = load_required(&mut ctx, &key.to_string()).await?;
            slice.expect_state(from)?;
            let updated = slice.with_state(ctx.now(), to)?;
            repo.save_slice(&mut ctx, Some(&slice), &updated).await?;
            Ok((updated, ctx))
        })
        .await
    }

    /// Record a failed attempt to move the Slice forward.
    pub async fn increment_retry_attempt(
        &self,
        now: UtcTime,
        key: &SliceKey,
        reason: &str,
    ) -> Result<Slice> {
        let repo = self.repo;
        repo.atomic(now, |mut ctx| async move {
            let slice: Slice = load_required(&mut ctx, &key.to_string()).await?;
            let mut updated = slice.clone();
            updated.retryable.increment(repo.backoff(), ctx.now(), reason);
            repo.save_slice(&mut ctx, Some(&slice), &updated).await?;
            Ok((updated, ctx))
        })
        .await
    }
}

async fn close_writing_in(
    repo: &Repository,
    ctx: &mut SaveContext,
    key: &FileVolumeKey,
) -> Result<Vec<Slice>> {
    let slices: Vec<Slice> = load_in(
        ctx,
        &format!("{}{}", schema::SLICES.in_level(Level::Local), key.key_prefix()),
    )
    .await?;
    let writing: Vec<Slice> = slices
        .into_iter()
        .filter(|s| s.state == SliceState::Writing)
        .collect();

    if writing.len() > 1 {
        error!(
            file_volume_key = %key,
            count = writing.len(),
            "Found more than one writing slice, closing all of them"
        );
    }

    let mut closed = Vec::with_capacity(writing.len());
    for slice in writing {
        let updated = slice.with_state(ctx.now(), SliceState::Closing)?;
        repo.save_slice(ctx, Some(&slice), &updated).await?;
        closed.push(updated);
    }
    Ok(closed)
}
