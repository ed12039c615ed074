//! Writer Volumes
//!
//! Disk-writer nodes register each of their volumes in the metadata store.
//! Source nodes watch the registrations to know where to connect, and the
//! repository uses them to assign volumes to every newly opened File.
//!
//! ## Volume Assignment
//!
//! ```text
//! 1. shuffle all volumes with a PRNG seeded by the File's opened_at
//! 2. stable sort by type priority (preferred types first, in order)
//! 3. pick volumes on nodes not used yet
//! 4. if more are needed, pick the remaining volumes in the same order
//! ```
//!
//! The seed makes the choice deterministic for one File while different Files
//! of the same sink spread over different volumes.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::StorageConfig;
use crate::key::{NodeId, VolumeId};

/// Registration record of one disk-writer volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriterVolume {
    pub volume_id: VolumeId,
    pub node_id: NodeId,
    /// Network address of the owning disk-writer node.
    pub node_address: String,
    /// Volume type, for example `hdd` or `ssd`.
    #[serde(rename = "type", default)]
    pub volume_type: String,
    #[serde(default)]
    pub label: String,
}

impl WriterVolume {
    pub fn new(
        volume_id: impl Into<VolumeId>,
        node_id: impl Into<NodeId>,
        node_address: impl Into<String>,
        volume_type: impl Into<String>,
    ) -> Self {
        Self {
            volume_id: volume_id.into(),
            node_id: node_id.into(),
            node_address: node_address.into(),
            volume_type: volume_type.into(),
            label: String::new(),
        }
    }
}

/// Select volumes for a new File, result is sorted by volume ID.
pub fn assign_volumes(all: &[WriterVolume], config: &StorageConfig, seed: i64) -> Vec<VolumeId> {
    let mut candidates: Vec<&WriterVolume> = all.iter().collect();
    candidates.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));
    candidates.shuffle(&mut StdRng::seed_from_u64(seed as u64));

    let priority = |v: &WriterVolume| {
        config
            .preferred_volume_types
            .iter()
            .position(|t| *t == v.volume_type)
            .unwrap_or(config.preferred_volume_types.len())
    };
    candidates.sort_by_key(|v| priority(*v));

    let count = config.volumes_count.min(candidates.len());
    let mut used_nodes = HashSet::new();
    let mut selected: Vec<VolumeId> = Vec::with_capacity(count);

    for v in &candidates {
        if selected.len() == count {
            break;
        }
        if used_nodes.insert(v.node_id.clone()) {
            selected.push(v.volume_id.clone());
        }
    }
    for v in &candidates {
        if selected.len() == count {
            break;
        }
        if !selected.contains(&v.volume_id) {
            selected.push(v.volume_id.clone());
        }
    }

    selected.sort();
    selected
}
