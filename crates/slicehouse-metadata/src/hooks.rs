//! Built-in observers.
//!
//! They keep Files, Slices and Sinks consistent with each other:
//!
//! - [`SliceCascade`]: a File save creates, closes, imports or deletes its Slices
//! - [`FileStateGuard`]: a Slice save must match the state of its File
//! - [`FileActivation`]: an active sink always has exactly one writing File

use async_trait::async_trait;
use slicehouse_core::{
    validate_file_and_slice_state, File, FileState, KeyPrefix, Sink, Slice, SliceState,
};
use tracing::debug;

use crate::error::Result;
use crate::observer::{FileObserver, SinkObserver, SliceObserver};
use crate::repository::{close_writing_in, open_in, Repository};
use crate::txn::SaveContext;

/// Propagates File changes to its Slices.
pub(crate) struct SliceCascade;

#[async_trait]
impl FileObserver for SliceCascade {
    async fn on_file_save(
        &self,
        repo: &Repository,
        ctx: &mut SaveContext,
        old: Option<&File>,
        updated: &File,
    ) -> Result<()> {
        let Some(old) = old else {
            for volume_id in &updated.volumes {
                let key = updated.key.volume(volume_id.clone()).slice(ctx.now());
                let slice = Slice::new(key, updated.encoding.clone());
                repo.save_slice(ctx, None, &slice).await?;
            }
            return Ok(());
        };

        let slices = repo.load_slices_in_file(ctx, &updated.key).await?;

        if updated.deleted {
            for slice in slices {
                let mut deleted = slice.clone();
                deleted.deleted = true;
                repo.save_slice(ctx, Some(&slice), &deleted).await?;
            }
            debug!(file_key = %updated.key, "Deleted slices of the file");
            return Ok(());
        }

        let cascade = if old.state == updated.state {
            None
        } else {
            match updated.state {
                FileState::Closing => Some((SliceState::Writing, SliceState::Closing)),
                FileState::Imported => Some((SliceState::Uploaded, SliceState::Imported)),
                FileState::Writing | FileState::Importing => None,
            }
        };

        for slice in slices {
            let slice = match cascade {
                Some((from, to)) if slice.state == from => {
                    let moved = slice.with_state(ctx.now(), to)?;
                    repo.save_slice(ctx, Some(&slice), &moved).await?;
                    moved
                }
                _ => slice,
            };
            validate_file_and_slice_state(&slice.key, updated.state, slice.state)?;
        }
        Ok(())
    }
}

/// Rejects Slice saves that do not match the state of the File.
pub(crate) struct FileStateGuard;

#[async_trait]
impl SliceObserver for FileStateGuard {
    async fn on_slice_save(
        &self,
        repo: &Repository,
        ctx: &mut SaveContext,
        old: Option<&Slice>,
        updated: &Slice,
    ) -> Result<()> {
        if updated.deleted {
            return Ok(());
        }

        let file = repo.load_file(ctx, updated.key.file_key()).await?;
        if old.is_none() {
            file.expect_state(FileState::Writing)?;
        }
        validate_file_and_slice_state(&updated.key, file.state, updated.state)?;
        Ok(())
    }
}

/// Opens a File when a sink becomes active and closes it when it stops.
pub(crate) struct FileActivation;

#[async_trait]
impl SinkObserver for FileActivation {
    async fn on_sink_activation(
        &self,
        repo: &Repository,
        ctx: &mut SaveContext,
        sink: &Sink,
    ) -> Result<()> {
        close_writing_in(repo, ctx, &sink.key.key_prefix()).await?;
        open_in(repo, ctx, sink).await?;
        Ok(())
    }

    async fn on_sink_deactivation(
        &self,
        repo: &Repository,
        ctx: &mut SaveContext,
        sink: &Sink,
    ) -> Result<()> {
        close_writing_in(repo, ctx, &sink.key.key_prefix()).await?;
        Ok(())
    }
}
