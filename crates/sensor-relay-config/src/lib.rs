//! Relay configuration.
//!
//! Loaded from an optional JSON file; every field falls back to a default so
//! an empty object (or no file at all) yields a working local setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_SAMPLE_RATE: u32 = 22_050;
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;
const WORKER_SCRIPT_NAME: &str = "model_server.py";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_address: String,
    pub port: u16,
    /// Directory holding the model files; passed to the worker and watched.
    pub model_dir: PathBuf,
    /// Interpreter or executable used to launch the worker.
    pub worker_program: String,
    /// Script handed to `worker_program`. Defaults to `<model_dir>/model_server.py`.
    pub worker_script: Option<PathBuf>,
    /// Scratch directory for uploads and transcodes.
    pub uploads_dir: PathBuf,
    pub transcoder_program: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub http_timeout_ms: u64,
    pub max_upload_bytes: usize,
    /// Age after which unanswered real-time requests are dropped. `None` keeps them forever.
    pub pending_expiry_ms: Option<u64>,
    /// Keep the streaming container around when its transcode fails.
    pub retain_failed_chunks: bool,
    pub watch_model_dir: bool,
    pub watch_interval_ms: u64,
    pub log_dir: PathBuf,
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            model_dir: PathBuf::from("AI_Model"),
            worker_program: "python3".to_string(),
            worker_script: None,
            uploads_dir: PathBuf::from("uploads"),
            transcoder_program: "ffmpeg".to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 1,
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            pending_expiry_ms: None,
            retain_failed_chunks: true,
            watch_model_dir: true,
            watch_interval_ms: 1000,
            log_dir: PathBuf::from("logs"),
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    pub fn worker_script_path(&self) -> PathBuf {
        self.worker_script
            .clone()
            .unwrap_or_else(|| self.model_dir.join(WORKER_SCRIPT_NAME))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn pending_expiry(&self) -> Option<Duration> {
        self.pending_expiry_ms.map(Duration::from_millis)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(invalid("port", "must be non-zero"));
        }
        if self.worker_program.trim().is_empty() {
            return Err(invalid("worker_program", "must not be empty"));
        }
        if self.transcoder_program.trim().is_empty() {
            return Err(invalid("transcoder_program", "must not be empty"));
        }
        if self.sample_rate == 0 {
            return Err(invalid("sample_rate", "must be non-zero"));
        }
        if self.channels == 0 {
            return Err(invalid("channels", "must be non-zero"));
        }
        if self.http_timeout_ms == 0 {
            return Err(invalid("http_timeout_ms", "must be non-zero"));
        }
        if self.max_upload_bytes == 0 {
            return Err(invalid("max_upload_bytes", "must be non-zero"));
        }
        if self.pending_expiry_ms == Some(0) {
            return Err(invalid("pending_expiry_ms", "must be non-zero when set"));
        }
        if self.watch_model_dir && self.watch_interval_ms == 0 {
            return Err(invalid("watch_interval_ms", "must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        message: message.to_string(),
    }
}

/// Load the configuration from `path`, or defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> Result<RelayConfig, ConfigError> {
    let config = match path {
        Some(path) => {
            let display = path.display().to_string();
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: display.clone(),
                source,
            })?;
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: display,
                source,
            })?
        }
        None => RelayConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = load_config(None).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.sample_rate, 22_050);
        assert_eq!(config.channels, 1);
        assert_eq!(config.http_timeout(), Duration::from_secs(30));
        assert_eq!(config.pending_expiry(), None);
        assert_eq!(
            config.worker_script_path(),
            PathBuf::from("AI_Model").join("model_server.py")
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 8080, "pending_expiry_ms": 60000, "worker_script": "/opt/worker.py"}}"#).unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.pending_expiry(), Some(Duration::from_secs(60)));
        assert_eq!(config.worker_script_path(), PathBuf::from("/opt/worker.py"));
        assert_eq!(config.transcoder_program, "ffmpeg");
        assert_eq!(config.listen_address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("nope.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ port: ").unwrap();
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_zero_values_are_rejected() {
        let config = RelayConfig {
            http_timeout_ms: 0,
            ..RelayConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("http_timeout_ms"));

        let config = RelayConfig {
            pending_expiry_ms: Some(0),
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
