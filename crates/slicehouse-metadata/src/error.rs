//! Metadata Error Types
//!
//! ## Error Categories
//!
//! ### Validation Errors (400)
//! - `Validation`: illegal state transition or File/Slice state combination
//! - `InvalidOperation`: the request is not allowed, e.g. a direct transition
//!   to `closing` instead of a rotation
//!
//! ### Not-Found / Conflict Errors (404 / 409)
//! - `NotFound`: the entity does not exist
//! - `AlreadyExists`: create precondition failed
//! - `Conflict`: the entity was modified since it was read, re-read and retry
//!
//! ### Infrastructure Errors (500)
//! - `Serialization`: stored value cannot be decoded
//! - `Store`: the backing store failed
//!
//! ## Usage
//!
//! ```ignore
//! match repo.files().get(&file_key).await {
//!     Ok(file) => println!("{}", file.state),
//!     Err(MetadataError::NotFound { .. }) => println!("gone"),
//!     Err(e) => return Err(e),
//! }
//! ```

use http::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetadataError>;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("{kind} \"{key}\" not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} \"{key}\" already exists")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("{kind} \"{key}\" was modified concurrently, re-read and retry")]
    Conflict { kind: &'static str, key: String },

    #[error(transparent)]
    Validation(#[from] slicehouse_core::Error),

    #[error("{0}")]
    InvalidOperation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(String),
}

impl MetadataError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            MetadataError::Validation(_) | MetadataError::InvalidOperation(_) => {
                StatusCode::BAD_REQUEST
            }
            MetadataError::NotFound { .. } => StatusCode::NOT_FOUND,
            MetadataError::AlreadyExists { .. } | MetadataError::Conflict { .. } => {
                StatusCode::CONFLICT
            }
            MetadataError::Serialization(_) | MetadataError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, MetadataError::Conflict { .. })
    }
}
