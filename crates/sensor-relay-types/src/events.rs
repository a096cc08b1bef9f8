use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event fanned out to every connected real-time client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastEvent {
    Status {
        message: String,
    },
    Error {
        message: String,
    },
    /// Raw worker reply, published for every resolved request.
    Response {
        id: u64,
        message: String,
    },
    SensorUpdate {
        #[serde(rename = "sensorId")]
        sensor_id: String,
        prediction: Value,
        confidence: f64,
        timestamp: i64,
    },
    /// Tells observers to drop their per-sensor state.
    ResetSensors {
        message: String,
        timestamp: i64,
    },
}

impl BroadcastEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn response(id: u64, message: impl Into<String>) -> Self {
        Self::Response {
            id,
            message: message.into(),
        }
    }

    pub fn sensor_update(sensor_id: impl Into<String>, prediction: Value, confidence: f64) -> Self {
        Self::SensorUpdate {
            sensor_id: sensor_id.into(),
            prediction,
            confidence,
            timestamp: now_millis(),
        }
    }

    pub fn reset_sensors(message: impl Into<String>) -> Self {
        Self::ResetSensors {
            message: message.into(),
            timestamp: now_millis(),
        }
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Error { .. } => "error",
            Self::Response { .. } => "response",
            Self::SensorUpdate { .. } => "sensor_update",
            Self::ResetSensors { .. } => "reset_sensors",
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
