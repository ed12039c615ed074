//! Node registrations.
//!
//! Disk-writer nodes register their volumes and source nodes register
//! themselves. Both lists are watched by the routers: volumes to maintain
//! the connections, source nodes to assign Slices.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use slicehouse_core::{NodeId, UtcTime, VolumeId, WriterVolume};
use tracing::info;

use super::Repository;
use crate::error::{MetadataError, Result};
use crate::schema::{self, SOURCE_NODES_PREFIX, WRITER_VOLUMES_PREFIX};

/// Registration record of a source node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceNode {
    pub node_id: NodeId,
}

pub struct VolumeRepository<'a> {
    repo: &'a Repository,
}

impl<'a> VolumeRepository<'a> {
    pub(crate) fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    /// Register or re-register a writer volume.
    pub async fn register(&self, volume: &WriterVolume) -> Result<()> {
        let mut ctx = self.repo.begin(UtcTime::now());
        ctx.put(
            schema::writer_volume_key(&volume.volume_id),
            Bytes::from(serde_json::to_vec(volume)?),
        );
        ctx.commit().await?;
        info!(volume_id = %volume.volume_id, node_id = %volume.node_id, "Registered writer volume");
        Ok(())
    }

    pub async fn unregister(&self, volume_id: &VolumeId) -> Result<()> {
        let mut ctx = self.repo.begin(UtcTime::now());
        ctx.delete(schema::writer_volume_key(volume_id));
        ctx.commit().await?;
        info!(volume_id = %volume_id, "Unregistered writer volume");
        Ok(())
    }

    /// All registered volumes, sorted by volume ID.
    pub async fn list(&self) -> Result<Vec<WriterVolume>> {
        self.repo
            .store()
            .range(WRITER_VOLUMES_PREFIX)
            .await?
            .into_iter()
            .map(|kv| serde_json::from_slice(&kv.value).map_err(MetadataError::from))
            .collect()
    }
}

pub struct SourceNodeRepository<'a> {
    repo: &'a Repository,
}

impl<'a> SourceNodeRepository<'a> {
    pub(crate) fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    pub async fn register(&self, node_id: &NodeId) -> Result<()> {
        let node = SourceNode {
            node_id: node_id.clone(),
        };
        let mut ctx = self.repo.begin(UtcTime::now());
        ctx.put(
            schema::source_node_key(node_id),
            Bytes::from(serde_json::to_vec(&node)?),
        );
        ctx.commit().await?;
        info!(node_id = %node_id, "Registered source node");
        Ok(())
    }

    pub async fn unregister(&self, node_id: &NodeId) -> Result<()> {
        let mut ctx = self.repo.begin(UtcTime::now());
        ctx.delete(schema::source_node_key(node_id));
        ctx.commit().await?;
        info!(node_id = %node_id, "Unregistered source node");
        Ok(())
    }

    /// All registered source nodes, sorted by node ID.
    pub async fn list(&self) -> Result<Vec<NodeId>> {
        self.repo
            .store()
            .range(SOURCE_NODES_PREFIX)
            .await?
            .into_iter()
            .map(|kv| {
                serde_json::from_slice::<SourceNode>(&kv.value)
                    .map(|n| n.node_id)
                    .map_err(MetadataError::from)
            })
            .collect()
    }
}
