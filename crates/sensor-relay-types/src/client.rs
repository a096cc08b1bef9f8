use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

/// Message a real-time client sends over the socket.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Audio(AudioSubmission),
    /// Any other `type`; ignored by the relay.
    #[serde(other)]
    Unknown,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AudioSubmission {
    #[serde(rename = "sensorId", default, skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<String>,
    /// Live monitoring chunk (compressed container) rather than a one-shot file.
    #[serde(rename = "isStreaming", default)]
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub data: AudioData,
}

/// Audio bytes as browsers and scripts tend to encode them in JSON.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum AudioData {
    /// `[82, 73, 70, 70, ...]`
    Bytes(Vec<u8>),
    /// Node's `Buffer#toJSON` form: `{"type":"Buffer","data":[...]}`.
    Buffer {
        #[serde(rename = "type")]
        kind: String,
        data: Vec<u8>,
    },
    Base64(String),
}

impl AudioData {
    pub fn into_bytes(self) -> Result<Vec<u8>, base64::DecodeError> {
        match self {
            Self::Bytes(bytes) | Self::Buffer { data: bytes, .. } => Ok(bytes),
            Self::Base64(encoded) => general_purpose::STANDARD.decode(encoded.trim()),
        }
    }
}

impl ClientMessage {
    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}
