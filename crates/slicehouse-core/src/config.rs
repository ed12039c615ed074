//! Storage Configuration Snapshot
//!
//! A File captures the storage configuration of its sink when it is opened.
//! The snapshot never changes afterwards; a configuration change takes effect
//! with the next rotation.
//!
//! ```ignore
//! let config = StorageConfig {
//!     volumes_count: 2,
//!     preferred_volume_types: vec!["ssd".into()],
//!     ..Default::default()
//! };
//! ```

use serde::{Deserialize, Serialize};

/// Compression applied to the slice data on the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zstd,
}

/// Where a write must be synced before it is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// No explicit sync, data is flushed when the slice is closed.
    Disabled,
    /// Sync to the OS disk cache.
    Cache,
    /// Sync to the physical disk.
    #[default]
    Disk,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub mode: SyncMode,
    /// Wait for the sync before the write is acknowledged.
    pub wait: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Disk,
            wait: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EncodingConfig {
    pub compression: Compression,
    pub sync: SyncConfig,
}

impl EncodingConfig {
    /// True if a successful write is durable when it returns.
    pub fn is_synchronous(&self) -> bool {
        self.sync.wait && self.sync.mode != SyncMode::Disabled
    }
}

/// Per-sink storage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    /// Number of volumes assigned to each new File.
    pub volumes_count: usize,
    /// Volume types tried first, in order.
    pub preferred_volume_types: Vec<String>,
    pub encoding: EncodingConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            volumes_count: 1,
            preferred_volume_types: Vec::new(),
            encoding: EncodingConfig::default(),
        }
    }
}
