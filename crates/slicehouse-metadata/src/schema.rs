//! Key layout in the metadata store.
//!
//! ```text
//! storage/file/all/<file key>
//! storage/file/level/<level>/<file key>
//! storage/slice/all/<slice key>
//! storage/slice/level/<level>/<slice key>
//! definition/sink/all/<sink key>
//! storage/volume/writer/<volume id>
//! runtime/source/node/<node id>
//! ```

use std::fmt::Display;

use slicehouse_core::Level;

/// Prefixes of one entity type.
#[derive(Debug, Clone, Copy)]
pub struct EntitySchema {
    root: &'static str,
}

pub const FILES: EntitySchema = EntitySchema::new("storage/file");
pub const SLICES: EntitySchema = EntitySchema::new("storage/slice");
pub const SINKS: EntitySchema = EntitySchema::new("definition/sink");

pub const WRITER_VOLUMES_PREFIX: &str = "storage/volume/writer/";
pub const SOURCE_NODES_PREFIX: &str = "runtime/source/node/";

impl EntitySchema {
    pub const fn new(root: &'static str) -> Self {
        Self { root }
    }

    /// Prefix of the canonical copies.
    pub fn all(&self) -> String {
        format!("{}/all/", self.root)
    }

    pub fn all_key(&self, key: &impl Display) -> String {
        format!("{}/all/{}", self.root, key)
    }

    /// Prefix of the copies in one storage level.
    pub fn in_level(&self, level: Level) -> String {
        format!("{}/level/{}/", self.root, level)
    }

    pub fn in_level_key(&self, level: Level, key: &impl Display) -> String {
        format!("{}/level/{}/{}", self.root, level, key)
    }
}

pub fn writer_volume_key(volume_id: &impl Display) -> String {
    format!("{WRITER_VOLUMES_PREFIX}{volume_id}")
}

pub fn source_node_key(node_id: &impl Display) -> String {
    format!("{SOURCE_NODES_PREFIX}{node_id}")
}
