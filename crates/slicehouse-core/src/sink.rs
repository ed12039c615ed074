use serde::{Deserialize, Serialize};

use crate::config::StorageConfig;
use crate::key::SinkKey;

/// Sink definition as seen by the storage layer.
///
/// Only the fields the write path needs are kept: whether the sink accepts
/// records and which storage configuration new Files snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sink {
    #[serde(flatten)]
    pub key: SinkKey,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_enabled() -> bool {
    true
}

impl Sink {
    pub fn new(key: SinkKey) -> Self {
        Self {
            key,
            enabled: true,
            deleted: false,
            storage: StorageConfig::default(),
        }
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// True if the sink accepts records and must have an open File.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.deleted
    }
}
