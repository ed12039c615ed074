//! File and Slice State Compatibility
//!
//! The states of a File and of its Slices are not independent. Every File
//! state permits only some Slice states:
//!
//! | File state         | Permitted Slice states                    |
//! |--------------------|-------------------------------------------|
//! | writing, closing   | writing, closing, uploading, uploaded     |
//! | importing          | uploaded                                  |
//! | imported           | imported                                  |
//!
//! The repository validates the pair on every File and every Slice save, so
//! an illegal combination never reaches the store.

use crate::error::{Error, Result};
use crate::file::FileState;
use crate::key::SliceKey;
use crate::slice::SliceState;

/// True if a Slice in `slice` state may belong to a File in `file` state.
pub fn is_compatible(file: FileState, slice: SliceState) -> bool {
    match file {
        FileState::Writing | FileState::Closing => matches!(
            slice,
            SliceState::Writing | SliceState::Closing | SliceState::Uploading | SliceState::Uploaded
        ),
        FileState::Importing => slice == SliceState::Uploaded,
        FileState::Imported => slice == SliceState::Imported,
    }
}

pub fn validate_file_and_slice_state(
    slice_key: &SliceKey,
    file: FileState,
    slice: SliceState,
) -> Result<()> {
    if is_compatible(file, slice) {
        return Ok(());
    }
    Err(Error::InvalidStateCombination {
        slice_key: slice_key.to_string(),
        file_state: file.to_string(),
        slice_state: slice.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{BranchKey, VolumeId};
    use crate::time::UtcTime;

    const FILE_STATES: [FileState; 4] = [
        FileState::Writing,
        FileState::Closing,
        FileState::Importing,
        FileState::Imported,
    ];
    const SLICE_STATES: [SliceState; 5] = [
        SliceState::Writing,
        SliceState::Closing,
        SliceState::Uploading,
        SliceState::Uploaded,
        SliceState::Imported,
    ];

    #[test]
    fn test_compatibility_table() {
        let allowed: Vec<(FileState, SliceState)> = FILE_STATES
            .iter()
            .flat_map(|f| SLICE_STATES.iter().map(move |s| (*f, *s)))
            .filter(|(f, s)| is_compatible(*f, *s))
            .collect();

        assert_eq!(
            allowed,
            vec![
                (FileState::Writing, SliceState::Writing),
                (FileState::Writing, SliceState::Closing),
                (FileState::Writing, SliceState::Uploading),
                (FileState::Writing, SliceState::Uploaded),
                (FileState::Closing, SliceState::Writing),
                (FileState::Closing, SliceState::Closing),
                (FileState::Closing, SliceState::Uploading),
                (FileState::Closing, SliceState::Uploaded),
                (FileState::Importing, SliceState::Uploaded),
                (FileState::Imported, SliceState::Imported),
            ]
        );
    }

    #[test]
    fn test_violation_names_slice_and_states() {
        let key = BranchKey::new(1, 2)
            .source("src")
            .sink("sink")
            .file(UtcTime::parse("2000-01-01T01:00:00.000Z").unwrap())
            .volume(VolumeId::new("vol"))
            .slice(UtcTime::parse("2000-01-01T02:00:00.000Z").unwrap());

        let err = validate_file_and_slice_state(&key, FileState::Importing, SliceState::Closing)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains(&key.to_string()));
        assert!(msg.contains("\"importing\""));
        assert!(msg.contains("\"closing\""));
    }
}
