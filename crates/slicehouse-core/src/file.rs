//! File Entity
//!
//! A File is one logical import unit of a sink. It is opened in the `writing`
//! state and moves strictly forward:
//!
//! ```text
//! writing -> closing -> importing -> imported
//! ```
//!
//! Each transition populates the matching timestamp (`closing_at`,
//! `importing_at`, `imported_at`), so the set of non-empty timestamps always
//! mirrors the state. Reaching a new state clears the retry bookkeeping.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::EncodingConfig;
use crate::error::{Error, Result};
use crate::key::{FileKey, VolumeId};
use crate::level::Level;
use crate::retry::Retryable;
use crate::time::UtcTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    Writing,
    Closing,
    Importing,
    Imported,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Writing => "writing",
            FileState::Closing => "closing",
            FileState::Importing => "importing",
            FileState::Imported => "imported",
        }
    }

    /// The only state reachable from this one.
    pub fn next(&self) -> Option<FileState> {
        match self {
            FileState::Writing => Some(FileState::Closing),
            FileState::Closing => Some(FileState::Importing),
            FileState::Importing => Some(FileState::Imported),
            FileState::Imported => None,
        }
    }

    pub fn level(&self) -> Level {
        match self {
            FileState::Writing | FileState::Closing => Level::Local,
            FileState::Importing => Level::Staging,
            FileState::Imported => Level::Target,
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    #[serde(flatten)]
    pub key: FileKey,
    #[serde(flatten)]
    pub retryable: Retryable,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    pub state: FileState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importing_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<UtcTime>,
    /// Volumes assigned when the File was opened, sorted.
    pub volumes: Vec<VolumeId>,
    /// Encoding snapshot, immutable for the File's lifetime.
    pub encoding: EncodingConfig,
}

impl File {
    /// New File in the `writing` state.
    pub fn new(key: FileKey, volumes: Vec<VolumeId>, encoding: EncodingConfig) -> Result<Self> {
        if volumes.is_empty() {
            return Err(Error::NoVolumeAssigned(key.to_string()));
        }
        Ok(Self {
            key,
            retryable: Retryable::default(),
            deleted: false,
            state: FileState::Writing,
            closing_at: None,
            importing_at: None,
            imported_at: None,
            volumes,
            encoding,
        })
    }

    pub fn level(&self) -> Level {
        self.state.level()
    }

    /// Check the File is in the state the caller expects.
    pub fn expect_state(&self, expected: FileState) -> Result<()> {
        if self.state != expected {
            return Err(Error::StateMismatch {
                kind: "file",
                key: self.key.to_string(),
                actual: self.state.to_string(),
                expected: expected.to_string(),
            });
        }
        Ok(())
    }

    /// Copy of the File moved to the target state.
    pub fn with_state(&self, now: UtcTime, to: FileState) -> Result<File> {
        if self.state.next() != Some(to) {
            return Err(Error::StateTransition {
                kind: "file",
                key: self.key.to_string(),
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }

        let mut updated = self.clone();
        updated.state = to;
        match to {
            FileState::Writing => {}
            FileState::Closing => updated.closing_at = Some(now),
            FileState::Importing => updated.importing_at = Some(now),
            FileState::Imported => updated.imported_at = Some(now),
        }
        updated.retryable.reset();
        Ok(updated)
    }
}
