// Relay server modules

pub mod audio_ingest;
pub mod broadcast;
pub mod error;
pub mod logger;
pub mod model_watcher;
pub mod request_parsing;
pub mod response_helpers;
pub mod routes;
pub mod transcode;
pub mod websocket;
pub mod websocket_utils;
pub mod worker;
