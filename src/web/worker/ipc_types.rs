//! IPC protocol types for server ↔ worker communication.
//!
//! Uses JSON Lines (one JSON object per line) over stdin/stdout pipes.

use serde::{Deserialize, Serialize};

use crate::web::error::RelayError;

/// Request sent from server to worker via stdin.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerRequest {
    /// Correlation id, echoed back in the matching `response` frame.
    pub id: u64,
    #[serde(rename = "audioPath")]
    pub audio_path: String,
}

/// Frames the worker writes to stdout.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerFrame {
    /// Model loaded; the worker accepts requests from now on.
    Ready {
        #[serde(default)]
        message: Option<String>,
    },
    /// Uncorrelated failure (model load, feature extraction, ...).
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    /// Reply to a request. `message` is a JSON-encoded `InferenceResult`
    /// or free text when prediction failed.
    Response { id: u64, message: String },
}

/// Encode a request as a single line (without the trailing newline).
pub fn encode_request(request: &WorkerRequest) -> Result<String, RelayError> {
    Ok(serde_json::to_string(request)?)
}

pub fn decode_frame(line: &str) -> Result<WorkerFrame, RelayError> {
    serde_json::from_str(line.trim()).map_err(RelayError::Protocol)
}
