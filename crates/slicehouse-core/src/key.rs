//! Entity Keys
//!
//! Every entity is addressed by a key that embeds its parent key and adds one
//! component:
//!
//! ```text
//! Project -> Branch -> Source -> Sink -> File(openedAt) -> FileVolume(volumeId) -> Slice(openedAt)
//! ```
//!
//! The string form joins the components with `/`, for example:
//!
//! ```text
//! 123/456/my-source/my-sink/2000-01-01T19:00:00.000Z/my-volume/2000-01-01T20:00:00.000Z
//! ```
//!
//! Timestamps use the fixed-width [`UtcTime`] form, so a range read over a key
//! prefix returns all descendants in creation order. The derived `Ord` follows
//! the same component order.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::time::UtcTime;

pub type ProjectId = u64;
pub type BranchId = u64;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a source, unique within a branch.
    SourceId
);
string_id!(
    /// Identifier of a sink, unique within a source.
    SinkId
);
string_id!(
    /// Stable identifier of one disk-writer volume.
    VolumeId
);
string_id!(
    /// Identifier of a cluster node (source node or disk-writer node).
    NodeId
);

/// A key that can be used as a range prefix for its descendants.
pub trait KeyPrefix {
    /// String prefix matching all descendants, always ends with `/`.
    fn key_prefix(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchKey {
    pub project_id: ProjectId,
    pub branch_id: BranchId,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceKey {
    #[serde(flatten)]
    pub branch_key: BranchKey,
    pub source_id: SourceId,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkKey {
    #[serde(flatten)]
    pub source_key: SourceKey,
    pub sink_id: SinkId,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileKey {
    #[serde(flatten)]
    pub sink_key: SinkKey,
    #[serde(rename = "fileOpenedAt")]
    pub opened_at: UtcTime,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileVolumeKey {
    #[serde(flatten)]
    pub file_key: FileKey,
    pub volume_id: VolumeId,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceKey {
    #[serde(flatten)]
    pub file_volume_key: FileVolumeKey,
    #[serde(rename = "sliceOpenedAt")]
    pub opened_at: UtcTime,
}

impl BranchKey {
    pub fn new(project_id: ProjectId, branch_id: BranchId) -> Self {
        Self {
            project_id,
            branch_id,
        }
    }

    pub fn source(&self, source_id: impl Into<SourceId>) -> SourceKey {
        SourceKey {
            branch_key: self.clone(),
            source_id: source_id.into(),
        }
    }
}

impl SourceKey {
    pub fn sink(&self, sink_id: impl Into<SinkId>) -> SinkKey {
        SinkKey {
            source_key: self.clone(),
            sink_id: sink_id.into(),
        }
    }
}

impl SinkKey {
    pub fn file(&self, opened_at: UtcTime) -> FileKey {
        FileKey {
            sink_key: self.clone(),
            opened_at,
        }
    }
}

impl FileKey {
    pub fn volume(&self, volume_id: VolumeId) -> FileVolumeKey {
        FileVolumeKey {
            file_key: self.clone(),
            volume_id,
        }
    }
}

impl FileVolumeKey {
    pub fn slice(&self, opened_at: UtcTime) -> SliceKey {
        SliceKey {
            file_volume_key: self.clone(),
            opened_at,
        }
    }
}

impl SliceKey {
    pub fn file_key(&self) -> &FileKey {
        &self.file_volume_key.file_key
    }

    pub fn sink_key(&self) -> &SinkKey {
        &self.file_volume_key.file_key.sink_key
    }

    pub fn volume_id(&self) -> &VolumeId {
        &self.file_volume_key.volume_id
    }

    /// Directory of the slice relative to the volume root.
    ///
    /// The layout is `<sink key>/<file opened at>/<volume>/<slice opened at>`
    /// with `:` replaced by `-`, so the path is valid on every filesystem.
    pub fn local_dir(&self) -> String {
        let fv = &self.file_volume_key;
        let sink = &fv.file_key.sink_key;
        format!(
            "{}/{}/{}/{}",
            sink,
            fv.file_key.opened_at,
            fv.volume_id,
            self.opened_at
        )
        .replace(':', "-")
    }
}

impl fmt::Display for BranchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.branch_id)
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.branch_key, self.source_id)
    }
}

impl fmt::Display for SinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_key, self.sink_id)
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sink_key, self.opened_at)
    }
}

impl fmt::Display for FileVolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.file_key, self.volume_id)
    }
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.file_volume_key, self.opened_at)
    }
}

macro_rules! key_prefix {
    ($($name:ident),*) => {
        $(
            impl KeyPrefix for $name {
                fn key_prefix(&self) -> String {
                    format!("{}/", self)
                }
            }
        )*
    };
}

key_prefix!(BranchKey, SourceKey, SinkKey, FileKey, FileVolumeKey);
