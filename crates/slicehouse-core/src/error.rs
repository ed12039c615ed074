//! Error Types for the Storage Model
//!
//! Every error in this crate is a validation error: it is caused by an illegal
//! request (state transition, state combination, key or timestamp) and is
//! never retried automatically.
//!
//! ## Error Categories
//!
//! ### State Machine Errors
//! - `StateTransition`: the requested target is not reachable from the current state
//! - `StateMismatch`: the entity is not in the state the caller expected
//! - `InvalidStateCombination`: File and Slice states are not compatible
//!
//! ### Input Errors
//! - `InvalidTime`: timestamp cannot be parsed
//! - `NoVolumeAssigned`: a File cannot be opened without at least one volume
//!
//! ## Example
//! ```ignore
//! match slice.with_state(now, SliceState::Uploading) {
//!     Err(Error::StateTransition { from, to, .. }) => warn!(%from, %to, "rejected"),
//!     other => other?,
//! }
//! ```

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("unexpected {kind} \"{key}\" state transition from \"{from}\" to \"{to}\"")]
    StateTransition {
        kind: &'static str,
        key: String,
        from: String,
        to: String,
    },

    #[error("{kind} \"{key}\" is in \"{actual}\" state, expected \"{expected}\"")]
    StateMismatch {
        kind: &'static str,
        key: String,
        actual: String,
        expected: String,
    },

    #[error("unexpected slice \"{slice_key}\" state: file state \"{file_state}\" is not compatible with slice state \"{slice_state}\"")]
    InvalidStateCombination {
        slice_key: String,
        file_state: String,
        slice_state: String,
    },

    #[error("invalid time \"{value}\": {reason}")]
    InvalidTime { value: String, reason: String },

    #[error("no volume is available for the file \"{0}\"")]
    NoVolumeAssigned(String),
}

pub type Result<T> = std::result::Result<T, Error>;
