//! Slice Entity
//!
//! A Slice is the part of one File written to one volume during one
//! open/close cycle:
//!
//! ```text
//! writing -> closing -> uploading -> uploaded -> imported
//! ```
//!
//! The discipline is the same as for [`File`](crate::File): strictly forward,
//! one step at a time, each step stamps its timestamp and clears the retry
//! bookkeeping.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{Compression, EncodingConfig};
use crate::error::{Error, Result};
use crate::key::SliceKey;
use crate::level::Level;
use crate::retry::Retryable;
use crate::time::UtcTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SliceState {
    Writing,
    Closing,
    Uploading,
    Uploaded,
    Imported,
}

impl SliceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SliceState::Writing => "writing",
            SliceState::Closing => "closing",
            SliceState::Uploading => "uploading",
            SliceState::Uploaded => "uploaded",
            SliceState::Imported => "imported",
        }
    }

    pub fn next(&self) -> Option<SliceState> {
        match self {
            SliceState::Writing => Some(SliceState::Closing),
            SliceState::Closing => Some(SliceState::Uploading),
            SliceState::Uploading => Some(SliceState::Uploaded),
            SliceState::Uploaded => Some(SliceState::Imported),
            SliceState::Imported => None,
        }
    }

    pub fn level(&self) -> Level {
        match self {
            SliceState::Writing | SliceState::Closing | SliceState::Uploading => Level::Local,
            SliceState::Uploaded => Level::Staging,
            SliceState::Imported => Level::Target,
        }
    }
}

impl fmt::Display for SliceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slice {
    #[serde(flatten)]
    pub key: SliceKey,
    #[serde(flatten)]
    pub retryable: Retryable,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    pub state: SliceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploading_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<UtcTime>,
    /// Copied from the parent File.
    pub encoding: EncodingConfig,
}

impl Slice {
    /// New Slice in the `writing` state.
    pub fn new(key: SliceKey, encoding: EncodingConfig) -> Self {
        Self {
            key,
            retryable: Retryable::default(),
            deleted: false,
            state: SliceState::Writing,
            closing_at: None,
            uploading_at: None,
            uploaded_at: None,
            imported_at: None,
            encoding,
        }
    }

    pub fn level(&self) -> Level {
        self.state.level()
    }

    /// Directory of the slice data relative to the volume root.
    pub fn local_dir(&self) -> String {
        self.key.local_dir()
    }

    /// Name of the data file inside [`Slice::local_dir`].
    pub fn filename(&self) -> &'static str {
        match self.encoding.compression {
            Compression::None => "slice.jsonl",
            Compression::Gzip => "slice.jsonl.gz",
            Compression::Zstd => "slice.jsonl.zst",
        }
    }

    pub fn expect_state(&self, expected: SliceState) -> Result<()> {
        if self.state != expected {
            return Err(Error::StateMismatch {
                kind: "slice",
                key: self.key.to_string(),
                actual: self.state.to_string(),
                expected: expected.to_string(),
            });
        }
        Ok(())
    }

    /// Copy of the Slice moved to the target state.
    pub fn with_state(&self, now: UtcTime, to: SliceState) -> Result<Slice> {
        if self.state.next() != Some(to) {
            return Err(Error::StateTransition {
                kind: "slice",
                key: self.key.to_string(),
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }

        let mut updated = self.clone();
        updated.state = to;
        match to {
            SliceState::Writing => {}
            SliceState::Closing => updated.closing_at = Some(now),
            SliceState::Uploading => updated.uploading_at = Some(now),
            SliceState::Uploaded => updated.uploaded_at = Some(now),
            SliceState::Imported => updated.imported_at = Some(now),
        }
        updated.retryable.reset();
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{BranchKey, VolumeId};

    fn slice() -> Slice {
        let key = BranchKey::new(123, 456)
            .source("my-source")
            .sink("my-sink")
            .file(UtcTime::parse("2006-01-02T15:04:05.000Z").unwrap())
            .volume(VolumeId::new("volumeId"))
            .slice(UtcTime::parse("2006-01-02T20:04:05.000Z").unwrap());
        Slice::new(key, EncodingConfig::default())
    }

    #[test]
    fn test_slice_state_transitions() {
        let now = UtcTime::parse("2006-01-02T21:00:00.000Z").unwrap();
        let s = slice();
        let s = s.with_state(now, SliceState::Closing).unwrap();
        assert_eq!(s.closing_at, Some(now));
        let s = s.with_state(now, SliceState::Uploading).unwrap();
        assert_eq!(s.uploading_at, Some(now));
        assert_eq!(s.level(), Level::Local);
        let s = s.with_state(now, SliceState::Uploaded).unwrap();
        assert_eq!(s.uploaded_at, Some(now));
        assert_eq!(s.level(), Level::Staging);
        let s = s.with_state(now, SliceState::Imported).unwrap();
        assert_eq!(s.imported_at, Some(now));
        assert_eq!(s.level(), Level::Target);
        assert!(s.with_state(now, SliceState::Writing).is_err());
    }

    #[test]
    fn test_slice_invalid_transition() {
        let now = UtcTime::parse("2006-01-02T21:00:00.000Z").unwrap();
        let err = slice().with_state(now, SliceState::Uploading).unwrap_err();
        assert_eq!(
            err.to_string(),
            "unexpected slice \"123/456/my-source/my-sink/2006-01-02T15:04:05.000Z/volumeId/2006-01-02T20:04:05.000Z\" state transition from \"writing\" to \"uploading\""
        );
    }

    #[test]
    fn test_slice_expect_state() {
        let now = UtcTime::parse("2006-01-02T21:00:00.000Z").unwrap();
        let s = slice().with_state(now, SliceState::Closing).unwrap();
        let err = s.expect_state(SliceState::Writing).unwrap_err();
        assert_eq!(
            err.to_string(),
            "slice \"123/456/my-source/my-sink/2006-01-02T15:04:05.000Z/volumeId/2006-01-02T20:04:05.000Z\" is in \"closing\" state, expected \"writing\""
        );
    }

    #[test]
    fn test_slice_filename() {
        let mut s = slice();
        assert_eq!(s.filename(), "slice.jsonl");
        s.encoding.compression = Compression::Gzip;
        assert_eq!(s.filename(), "slice.jsonl.gz");
    }
}
