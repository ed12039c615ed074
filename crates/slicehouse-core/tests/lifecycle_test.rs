//! Full File/Slice lifecycle walk
//!
//! Drives one File with two Slices from `writing` to `imported` the way the
//! repository cascades do, checking the compatibility table at every step.

use slicehouse_core::state::is_compatible;
use slicehouse_core::{
    BranchKey, EncodingConfig, File, FileState, Slice, SliceState, UtcTime, VolumeId,
};

fn at(s: &str) -> UtcTime {
    UtcTime::parse(s).unwrap()
}

fn assert_consistent(file: &File, slices: &[Slice]) {
    for slice in slices {
        assert!(
            is_compatible(file.state, slice.state),
            "file {} / slice {}",
            file.state,
            slice.state
        );
    }
}

#[test]
fn test_file_and_slices_full_lifecycle() {
    let opened = at("2000-01-01T01:00:00.000Z");
    let sink = BranchKey::new(123, 456).source("my-source").sink("my-sink");
    let volumes = vec![VolumeId::new("vol-1"), VolumeId::new("vol-2")];

    let mut file = File::new(sink.file(opened), volumes.clone(), EncodingConfig::default()).unwrap();
    let mut slices: Vec<Slice> = volumes
        .iter()
        .map(|v| Slice::new(file.key.volume(v.clone()).slice(opened), file.encoding.clone()))
        .collect();
    assert_consistent(&file, &slices);

    // Rotation closes the file and its slices
    let t = at("2000-01-01T02:00:00.000Z");
    file = file.with_state(t, FileState::Closing).unwrap();
    for s in slices.iter_mut() {
        *s = s.with_state(t, SliceState::Closing).unwrap();
    }
    assert_consistent(&file, &slices);

    // Slices are uploaded independently
    let t = at("2000-01-01T03:00:00.000Z");
    for s in slices.iter_mut() {
        *s = s.with_state(t, SliceState::Uploading).unwrap();
        assert_consistent(&file, std::slice::from_ref(s));
        *s = s.with_state(t, SliceState::Uploaded).unwrap();
    }
    assert_consistent(&file, &slices);

    // The file can be imported only when all slices are uploaded
    file = file.with_state(t, FileState::Importing).unwrap();
    assert_consistent(&file, &slices);

    let t = at("2000-01-01T04:00:00.000Z");
    file = file.with_state(t, FileState::Imported).unwrap();
    for s in slices.iter_mut() {
        *s = s.with_state(t, SliceState::Imported).unwrap();
    }
    assert_consistent(&file, &slices);

    assert_eq!(file.closing_at, Some(at("2000-01-01T02:00:00.000Z")));
    assert_eq!(file.importing_at, Some(at("2000-01-01T03:00:00.000Z")));
    assert_eq!(file.imported_at, Some(t));
    assert!(slices.iter().all(|s| s.imported_at == Some(t)));
}

#[test]
fn test_importing_file_rejects_unfinished_slices() {
    for state in [SliceState::Writing, SliceState::Closing, SliceState::Uploading] {
        assert!(!is_compatible(FileState::Importing, state));
    }
    assert!(!is_compatible(FileState::Imported, SliceState::Uploaded));
}
