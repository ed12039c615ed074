//! Storage model of the ingestion write path.
//!
//! Keys, File and Slice entities with their lifecycle state machines, the
//! File/Slice compatibility table, retry bookkeeping and the record producer
//! interface. Nothing in this crate performs I/O.

pub mod config;
pub mod error;
pub mod file;
pub mod key;
pub mod level;
pub mod record;
pub mod retry;
pub mod sink;
pub mod slice;
pub mod state;
pub mod time;
pub mod volume;

pub use config::{Compression, EncodingConfig, StorageConfig, SyncConfig, SyncMode};
pub use error::{Error, Result};
pub use file::{File, FileState};
pub use key::{
    BranchKey, FileKey, FileVolumeKey, KeyPrefix, NodeId, SinkId, SinkKey, SliceKey, SourceId,
    SourceKey, VolumeId,
};
pub use level::Level;
pub use record::{Record, RecordContext};
pub use retry::{ExponentialBackoff, RetryBackoff, Retryable};
pub use sink::Sink;
pub use slice::{Slice, SliceState};
pub use state::validate_file_and_slice_state;
pub use time::UtcTime;
pub use volume::{assign_volumes, WriterVolume};
