//! Shared wire types for the sensor relay.
//!
//! Everything here is plain serde data: what the worker returns, what
//! real-time clients send, and what the hub broadcasts back to them.

pub mod client;
pub mod events;
pub mod inference;

pub use client::{AudioData, AudioSubmission, ClientMessage};
pub use events::{now_millis, BroadcastEvent};
pub use inference::InferenceResult;
