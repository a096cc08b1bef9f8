//! Container to canonical WAV conversion through an external transcoder.

use std::path::Path;
use std::process::Stdio;

use log::{debug, warn};
use sensor_relay_config::RelayConfig;
use tokio::process::Command;

use crate::web::error::RelayError;

#[derive(Debug, Clone)]
pub struct Transcoder {
    program: String,
    sample_rate: u32,
    channels: u16,
}

impl Transcoder {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            program: config.transcoder_program.clone(),
            sample_rate: config.sample_rate,
            channels: config.channels,
        }
    }

    /// `-y -i <input> -ar <rate> -ac <channels> -f wav <output>`
    pub fn args(&self, input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
            "-ar".to_string(),
            self.sample_rate.to_string(),
            "-ac".to_string(),
            self.channels.to_string(),
            "-f".to_string(),
            "wav".to_string(),
            output.to_string_lossy().into_owned(),
        ]
    }

    /// Convert `input` into the canonical format at `output`. Spawn failure
    /// and a non-zero exit are both `TranscodeFailed`.
    pub async fn to_canonical(&self, input: &Path, output: &Path) -> Result<(), RelayError> {
        debug!(
            "[INGEST] Transcoding {} -> {}",
            input.display(),
            output.display()
        );

        let result = Command::new(&self.program)
            .args(self.args(input, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let output_status = match result {
            Ok(out) => out,
            Err(e) => {
                return Err(RelayError::TranscodeFailed {
                    input: input.display().to_string(),
                    reason: format!("could not run {}: {e}", self.program),
                })
            }
        };

        if output_status.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output_status.stderr);
        let tail = stderr.lines().last().unwrap_or("").trim().to_string();
        warn!(
            "[INGEST] {} exited with {} for {}: {tail}",
            self.program,
            output_status.status,
            input.display()
        );
        Err(RelayError::TranscodeFailed {
            input: input.display().to_string(),
            reason: format!("{} ({tail})", output_status.status),
        })
    }
}
