//! Router Error Types
//!
//! ## Error Categories
//!
//! ### Transient (503)
//! - `NoPipeline`: the sink has no slice pipeline at all
//! - `NoPipelineReady`: every slice pipeline of the sink is (re)connecting
//! - `PipelineNotReady`: one slice pipeline is not connected, the balancer
//!   treats it as a signal to try the next candidate
//! - `NoOpenSlices`: no writing slice is assigned to this node
//! - `ShutDown`: the router no longer accepts records
//!
//! ### Client (4xx)
//! - `SinkNotFound`, `SinkDisabled`
//! - `Metadata`: status of the wrapped repository error
//!
//! ### Internal (500)
//! - `Write`, `Network`, `InvalidConfig`
//!
//! Every error has a stable name reported to the client, `stream.in.<name>`.

use http::StatusCode;
use slicehouse_metadata::MetadataError;
use thiserror::Error;

pub const ERROR_NAME_PREFIX: &str = "stream.in.";

pub type Result<T> = std::result::Result<T, RouterError>;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no pipeline")]
    NoPipeline,

    #[error("no pipeline is ready")]
    NoPipelineReady,

    #[error("pipeline is not ready")]
    PipelineNotReady,

    #[error("sink \"{0}\" not found")]
    SinkNotFound(String),

    #[error("sink \"{0}\" is disabled")]
    SinkDisabled(String),

    #[error("no open slice is assigned to the sink \"{0}\"")]
    NoOpenSlices(String),

    #[error("the router is shutting down")]
    ShutDown,

    #[error("write failed: {0}")]
    Write(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

impl RouterError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RouterError::NoPipeline
            | RouterError::NoPipelineReady
            | RouterError::PipelineNotReady
            | RouterError::NoOpenSlices(_)
            | RouterError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
            RouterError::SinkNotFound(_) => StatusCode::NOT_FOUND,
            RouterError::SinkDisabled(_) => StatusCode::BAD_REQUEST,
            RouterError::Metadata(e) => e.status_code(),
            RouterError::Write(_) | RouterError::Network(_) | RouterError::InvalidConfig(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Name reported to the client, with the `stream.in.` prefix.
    pub fn error_name(&self) -> String {
        let name = match self {
            RouterError::NoPipeline => "noPipeline",
            RouterError::NoPipelineReady => "noPipelineReady",
            RouterError::PipelineNotReady => "pipelineNotReady",
            RouterError::SinkNotFound(_) => "sinkNotFound",
            RouterError::SinkDisabled(_) => "sinkDisabled",
            RouterError::NoOpenSlices(_) => "noOpenSlices",
            RouterError::ShutDown => "shutDown",
            RouterError::Write(_) => "writeFailed",
            RouterError::Network(_) => "networkError",
            RouterError::InvalidConfig(_) => "invalidConfig",
            RouterError::Metadata(MetadataError::NotFound { .. }) => "notFound",
            RouterError::Metadata(MetadataError::Conflict { .. })
            | RouterError::Metadata(MetadataError::AlreadyExists { .. }) => "conflict",
            RouterError::Metadata(_) => "genericError",
        };
        format!("{ERROR_NAME_PREFIX}{name}")
    }

    /// The pipeline cannot accept the record now, another candidate may.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, RouterError::PipelineNotReady)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_503() {
        for err in [
            RouterError::NoPipeline,
            RouterError::NoPipelineReady,
            RouterError::PipelineNotReady,
            RouterError::ShutDown,
        ] {
            assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        }
    }

    #[test]
    fn test_error_names() {
        assert_eq!(RouterError::NoPipelineReady.error_name(), "stream.in.noPipelineReady");
        assert_eq!(
            RouterError::SinkNotFound("1/2/src/sink".into()).error_name(),
            "stream.in.sinkNotFound"
        );
        let err = RouterError::from(MetadataError::NotFound {
            kind: "file",
            key: "k".into(),
        });
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
