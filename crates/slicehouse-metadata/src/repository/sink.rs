use slicehouse_core::{KeyPrefix, Sink, SinkKey, UtcTime};
use tracing::info;

use super::{load_required, Repository};
use crate::error::Result;
use crate::schema;

/// Sink definitions.
///
/// Creating, enabling, disabling and deleting a sink runs the sink observers
/// in the same transaction, so the sink and its writing File always change
/// together.
pub struct SinkRepository<'a> {
    repo: &'a Repository,
}

impl<'a> SinkRepository<'a> {
    pub(crate) fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    pub async fn create(&self, now: UtcTime, sink: Sink) -> Result<Sink> {
        let repo = self.repo;
        let sink = &sink;
        repo.atomic(now, |mut ctx| async move {
            repo.save_sink(&mut ctx, None, sink).await?;
            Ok((sink.clone(), ctx))
        })
        .await?;

        info!(sink_key = %sink.key, enabled = sink.enabled, "Created sink");
        Ok(sink.clone())
    }

    pub async fn get(&self, key: &SinkKey) -> Result<Sink> {
        self.repo.get(&key.to_string()).await
    }

    pub async fn list_all(&self) -> Result<Vec<Sink>> {
        self.repo.list(&schema::SINKS.all()).await
    }

    pub async fn list_in(&self, parent: &impl KeyPrefix) -> Result<Vec<Sink>> {
        self.repo
            .list(&format!("{}{}", schema::SINKS.all(), parent.key_prefix()))
            .await
    }

    pub async fn enable(&self, now: UtcTime, key: &SinkKey) -> Result<Sink> {
        self.update(now, key, |sink| sink.enabled = true).await
    }

    pub async fn disable(&self, now: UtcTime, key: &SinkKey) -> Result<Sink> {
        self.update(now, key, |sink| sink.enabled = false).await
    }

    /// Delete the sink definition; its writing File is closed.
    pub async fn delete(&self, now: UtcTime, key: &SinkKey) -> Result<()> {
        self.update(now, key, |sink| sink.deleted = true).await?;
        info!(sink_key = %key, "Deleted sink");
        Ok(())
    }

    async fn update<F>(&self, now: UtcTime, key: &SinkKey, modify: F) -> Result<Sink>
    where
        F: Fn(&mut Sink) + Sync,
    {
        let repo = self.repo;
        let modify = &modify;
        repo.atomic(now, |mut ctx| async move {
            let sink: Sink = load_required(&mut ctx, &key.to_string()).await?;
            let mut updated = sink.clone();
            modify(&mut updated);
            if updated != sink {
                repo.save_sink(&mut ctx, Some(&sink), &updated).await?;
            }
            Ok((updated, ctx))
        })
        .await
    }
}
