use slicehouse_core::{
    assign_volumes, File, FileKey, FileState, KeyPrefix, Level, Sink, SinkKey, UtcTime,
    WriterVolume,
};
use tracing::{error, info};

use super::{load_in, load_required, Repository};
use crate::error::{MetadataError, Result};
use crate::schema::{self, WRITER_VOLUMES_PREFIX};
use crate::txn::SaveContext;

/// File operations.
pub struct FileRepository<'a> {
    repo: &'a Repository,
}

impl<'a> FileRepository<'a> {
    pub(crate) fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    pub async fn get(&self, key: &FileKey) -> Result<File> {
        self.repo.get(&key.to_string()).await
    }

    pub async fn list_all(&self) -> Result<Vec<File>> {
        self.repo.list(&schema::FILES.all()).await
    }

    /// Files under a project, branch, source or sink.
    pub async fn list_in(&self, parent: &impl KeyPrefix) -> Result<Vec<File>> {
        self.repo
            .list(&format!("{}{}", schema::FILES.all(), parent.key_prefix()))
            .await
    }

    pub async fn list_in_level(&self, parent: &impl KeyPrefix, level: Level) -> Result<Vec<File>> {
        self.repo
            .list(&format!("{}{}", schema::FILES.in_level(level), parent.key_prefix()))
            .await
    }

    pub async fn list_in_state(&self, parent: &impl KeyPrefix, state: FileState) -> Result<Vec<File>> {
        let files = self.list_in_level(parent, state.level()).await?;
        Ok(files.into_iter().filter(|f| f.state == state).collect())
    }

    /// Close the writing File of the sink and open a new one, atomically.
    ///
    /// The new File gets a Slice in every assigned volume.
    pub async fn rotate(&self, now: UtcTime, sink_key: &SinkKey) -> Result<File> {
        let repo = self.repo;
        repo.atomic(now, |mut ctx| async move {
            let sink: Sink = load_required(&mut ctx, &sink_key.to_string()).await?;
            if !sink.is_active() {
                return Err(MetadataError::InvalidOperation(format!(
                    "sink \"{}\" is not active, files cannot be rotated",
                    sink.key
                )));
            }
            close_writing_in(repo, &mut ctx, &sink_key.key_prefix()).await?;
            let file = open_in(repo, &mut ctx, &sink).await?;
            Ok((file, ctx))
        })
        .await
    }

    /// Rotate the Files of every active sink under the parent.
    pub async fn rotate_all_in(&self, now: UtcTime, parent: &impl KeyPrefix) -> Result<Vec<File>> {
        let repo = self.repo;
        let prefix = parent.key_prefix();
        let prefix = &prefix;
        repo.atomic(now, |mut ctx| async move {
            let sinks: Vec<Sink> =
                load_in(&mut ctx, &format!("{}{}", schema::SINKS.all(), prefix)).await?;
            let mut opened = Vec::new();
            for sink in sinks.iter().filter(|s| s.is_active()) {
                close_writing_in(repo, &mut ctx, &sink.key.key_prefix()).await?;
                opened.push(open_in(repo, &mut ctx, sink).await?);
            }
            Ok((opened, ctx))
        })
        .await
    }

    /// Close every writing File under the parent without opening new ones.
    pub async fn close_all_in(&self, now: UtcTime, parent: &impl KeyPrefix) -> Result<Vec<File>> {
        let repo = self.repo;
        let prefix = parent.key_prefix();
        let prefix = &prefix;
        repo.atomic(now, |mut ctx| async move {
            let closed = close_writing_in(repo, &mut ctx, prefix).await?;
            Ok((closed, ctx))
        })
        .await
    }

    /// Move the File from `from` to `to`.
    ///
    /// `closing` is reached only through rotation or closing, never directly.
    pub async fn state_transition(
        &self,
        now: UtcTime,
        key: &FileKey,
        from: FileState,
        to: FileState,
    ) -> Result<File> {
        if to == FileState::Closing {
            return Err(MetadataError::InvalidOperation(format!(
                "unexpected file transition to the state \"{}\", use Rotate* or Close* methods",
                FileState::Closing
            )));
        }

        let repo = self.repo;
        repo.atomic(now, |mut ctx| async move {
            let file: File = load_required(&mut ctx, &key.to_string()).await?;
            file.expect_state(from)?;
            let updated = file.with_state(ctx.now(), to)?;
            repo.save_file(&mut ctx, Some(&file), &updated).await?;
            Ok((updated, ctx))
        })
        .await
    }

    /// Record a failed attempt to move the File forward.
    pub async fn increment_retry_attempt(
        &self,
        now: UtcTime,
        key: &FileKey,
        reason: &str,
    ) -> Result<File> {
        let repo = self.repo;
        repo.atomic(now, |mut ctx| async move {
            let file: File = load_required(&mut ctx, &key.to_string()).await?;
            let mut updated = file.clone();
            updated.retryable.increment(repo.backoff(), ctx.now(), reason);
            repo.save_file(&mut ctx, Some(&file), &updated).await?;
            Ok((updated, ctx))
        })
        .await
    }

    /// Delete the File together with its Slices.
    pub async fn delete(&self, now: UtcTime, key: &FileKey) -> Result<()> {
        let repo = self.repo;
        repo.atomic(now, |mut ctx| async move {
            let file: File = load_required(&mut ctx, &key.to_string()).await?;
            let mut deleted = file.clone();
            deleted.deleted = true;
            repo.save_file(&mut ctx, Some(&file), &deleted).await?;
            Ok(((), ctx))
        })
        .await
    }
}

/// Close the writing Files whose key starts with the prefix.
pub(crate) async fn close_writing_in(
    repo: &Repository,
    ctx: &mut SaveContext,
    prefix: &str,
) -> Result<Vec<File>> {
    let files: Vec<File> = load_in(
        ctx,
        &format!("{}{}", schema::FILES.in_level(Level::Local), prefix),
    )
    .await?;
    let writing: Vec<File> = files
        .into_iter()
        .filter(|f| f.state == FileState::Writing)
        .collect();

    if writing.len() > 1 {
        error!(
            prefix = %prefix,
            count = writing.len(),
            "Found more than one writing file, closing all of them"
        );
    }

    let mut closed = Vec::with_capacity(writing.len());
    for file in writing {
        let updated = file.with_state(ctx.now(), FileState::Closing)?;
        repo.save_file(ctx, Some(&file), &updated).await?;
        info!(file_key = %updated.key, "Closed file");
        closed.push(updated);
    }
    Ok(closed)
}

/// Open a new writing File of the sink in the volumes assigned for it.
pub(crate) async fn open_in(repo: &Repository, ctx: &mut SaveContext, sink: &Sink) -> Result<File> {
    let volumes = ctx
        .range("volume", WRITER_VOLUMES_PREFIX)
        .await?
        .into_iter()
        .map(|(_, value)| serde_json::from_slice::<WriterVolume>(&value))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let now = ctx.now();
    let assigned = assign_volumes(&volumes, &sink.storage, now.timestamp_millis());
    let file = File::new(sink.key.file(now), assigned, sink.storage.encoding.clone())?;

    repo.save_file(ctx, None, &file).await?;
    info!(file_key = %file.key, volumes = file.volumes.len(), "Opened file");
    Ok(file)
}
