use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prediction record produced by the inference worker.
///
/// Arrives JSON-encoded inside the `message` field of a `response` frame.
/// Fields the relay does not know about are kept in `extra` so the HTTP
/// path can echo the record back unchanged.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct InferenceResult {
    /// Predicted label. Integer or string depending on the model.
    #[serde(default)]
    pub prediction: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probabilities: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classes: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_features: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rms_energy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amplitude: Option<f64>,
    /// Set when the worker replaced its own prediction (low-volume input).
    #[serde(default)]
    pub was_overridden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_prediction: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InferenceResult {
    /// Decode the JSON text carried by a worker `response` frame.
    pub fn decode(message: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(message)
    }

    pub fn has_prediction(&self) -> bool {
        !self.prediction.is_null()
    }

    /// Confidence as published in sensor updates; absent means 0.
    pub fn confidence_or_zero(&self) -> f64 {
        self.confidence.unwrap_or(0.0)
    }
}
