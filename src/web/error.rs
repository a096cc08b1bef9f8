//! Error types for the relay.

use hyper::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Malformed worker frame: {0}")]
    Protocol(#[source] serde_json::Error),

    #[error("Model is not ready yet")]
    WorkerUnavailable,

    #[error("Failed to spawn worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("Worker restarted before replying")]
    WorkerRestarted,

    #[error("Transcode of {input} failed: {reason}")]
    TranscodeFailed { input: String, reason: String },

    #[error("No pending request with id {0}")]
    UnknownResponseId(u64),

    #[error("Request timeout")]
    Timeout,

    #[error("Request {0} expired without a worker reply")]
    Expired(u64),

    #[error("Invalid message: {0}")]
    InvalidClientInput(String),

    #[error("File operation on {path} failed: {source}")]
    FileIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl RelayError {
    pub fn file_io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::FileIo {
            path: path.display().to_string(),
            source,
        }
    }

    /// HTTP status used when this error ends a synchronous request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::WorkerUnavailable | Self::WorkerRestarted | Self::WorkerSpawn(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Timeout | Self::Expired(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::InvalidClientInput(_) => StatusCode::BAD_REQUEST,
            Self::UnknownResponseId(_) => StatusCode::NOT_FOUND,
            Self::Protocol(_)
            | Self::TranscodeFailed { .. }
            | Self::FileIo { .. }
            | Self::Serialize(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
