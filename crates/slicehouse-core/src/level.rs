use std::fmt;

use serde::{Deserialize, Serialize};

/// Storage tier currently holding the data of a File or Slice.
///
/// The level is always derived from the entity state, see
/// [`FileState::level`](crate::FileState::level) and
/// [`SliceState::level`](crate::SliceState::level).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Data is on a disk-writer volume.
    Local,
    /// Data is uploaded to the staging storage.
    Staging,
    /// Data is imported to the target table.
    Target,
}

impl Level {
    pub const ALL: [Level; 3] = [Level::Local, Level::Staging, Level::Target];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Local => "local",
            Level::Staging => "staging",
            Level::Target => "target",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
