//! Out-of-process inference worker.
//!
//! The model runs in a separate child process for:
//! - Crash isolation: a model crash doesn't kill the relay
//! - Hot reload: kill the process and spawn a fresh one on new model files

pub mod correlator;
pub mod ipc_channel;
pub mod ipc_types;
pub mod process_manager;
pub mod worker_bridge;
