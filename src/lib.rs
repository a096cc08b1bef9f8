//! Inference-worker supervisor and real-time sensor relay.
//!
//! The relay keeps one long-lived inference worker process alive, forwards
//! audio to it over a line-framed JSON pipe protocol, correlates replies
//! with the requests (and sensors) they belong to, and fans results out to
//! every connected real-time client.

pub mod web;

pub use sensor_relay_config as config;
pub use sensor_relay_types as types;
