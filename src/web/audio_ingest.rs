//! Audio submissions from real-time clients and the HTTP bridge.
//!
//! One-shot uploads are written to the scratch directory and handed to the
//! worker as-is. Streaming chunks are written over the sensor's live
//! container, transcoded to canonical WAV, then issued. Each sensor runs at
//! most one streaming cycle at a time; see [`SensorSlots`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use sensor_relay_config::RelayConfig;
use sensor_relay_types::{now_millis, AudioSubmission, BroadcastEvent, ClientMessage};
use tokio::sync::oneshot;

use crate::web::broadcast::{ClientId, SharedBroadcastHub};
use crate::web::error::RelayError;
use crate::web::transcode::Transcoder;
use crate::web::worker::correlator::{ReplyWaiter, RequestOrigin};
use crate::web::worker::worker_bridge::SharedWorkerBridge;

pub const SAVE_FAILED_MESSAGE: &str = "Failed to save audio file.";
pub const NOT_READY_MESSAGE: &str = "Model is not ready yet.";
pub const INVALID_MESSAGE: &str = "Invalid message.";

const DEFAULT_UPLOAD_NAME: &str = "audio.wav";
const DEFAULT_SENSOR_NAME: &str = "unknown";

/// Replace anything outside `[A-Za-z0-9._-]` with `_` after dropping any
/// directory part. Empty or dot-only names become `fallback`.
pub fn sanitize_component(raw: &str, fallback: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        fallback.to_string()
    } else {
        cleaned
    }
}

/// Scratch directory holding transient audio artifacts.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
}

impl ScratchDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory if needed.
    pub fn ensure(&self) -> Result<(), RelayError> {
        std::fs::create_dir_all(&self.root).map_err(|e| RelayError::file_io(&self.root, e))
    }

    pub fn oneshot_path(&self, filename: Option<&str>) -> PathBuf {
        let name = sanitize_component(filename.unwrap_or(DEFAULT_UPLOAD_NAME), DEFAULT_UPLOAD_NAME);
        self.root.join(format!("{}-{name}", now_millis()))
    }

    pub fn http_upload_path(&self, sensor_id: &str) -> PathBuf {
        let sensor = sanitize_component(sensor_id, DEFAULT_SENSOR_NAME);
        self.root.join(format!("{}-api-{sensor}.wav", now_millis()))
    }

    pub fn live_container_path(&self, sensor_id: &str) -> PathBuf {
        let sensor = sanitize_component(sensor_id, DEFAULT_SENSOR_NAME);
        self.root.join(format!("{sensor}_live.webm"))
    }

    pub fn live_canonical_path(&self, sensor_id: &str) -> PathBuf {
        let sensor = sanitize_component(sensor_id, DEFAULT_SENSOR_NAME);
        self.root.join(format!("{sensor}_live.wav"))
    }
}

/// Slot and working-file key for a sensor. Ids that sanitize to the same
/// name share files, so they share a slot too.
pub fn stream_slot_key(sensor_id: &str) -> String {
    sanitize_component(sensor_id, DEFAULT_SENSOR_NAME)
}

/// A streaming chunk waiting for its sensor's slot.
#[derive(Debug, PartialEq, Eq)]
pub struct StreamChunk {
    pub client: ClientId,
    /// Sensor id as the client sent it, used for the reply linkage.
    pub sensor_id: String,
    pub bytes: Vec<u8>,
}

/// Per-sensor single-slot queue keyed by [`stream_slot_key`]. A key present
/// in the map has a cycle in flight; its value is the one chunk waiting
/// behind that cycle.
#[derive(Debug, Default)]
pub struct SensorSlots {
    slots: Mutex<HashMap<String, Option<StreamChunk>>>,
}

impl SensorSlots {
    /// Returns the chunk back when the caller should run a cycle for it
    /// now. Otherwise the chunk is parked, replacing any parked one.
    pub fn try_begin(&self, sensor_id: &str, chunk: StreamChunk) -> Option<StreamChunk> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.get_mut(sensor_id) {
            None => {
                slots.insert(sensor_id.to_string(), None);
                Some(chunk)
            }
            Some(waiting) => {
                if waiting.replace(chunk).is_some() {
                    debug!("[INGEST] Dropping superseded chunk for {sensor_id}");
                }
                None
            }
        }
    }

    /// End the current cycle. Returns the parked chunk, which keeps the
    /// slot busy, or frees the slot when nothing is waiting.
    pub fn finish(&self, sensor_id: &str) -> Option<StreamChunk> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.get_mut(sensor_id).and_then(Option::take) {
            Some(next) => Some(next),
            None => {
                slots.remove(sensor_id);
                None
            }
        }
    }

    pub fn in_flight(&self, sensor_id: &str) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(sensor_id)
    }
}

pub struct AudioIngestPipeline {
    scratch: ScratchDir,
    transcoder: Transcoder,
    bridge: SharedWorkerBridge,
    hub: SharedBroadcastHub,
    slots: SensorSlots,
    retain_failed_chunks: bool,
    /// Longest a streaming cycle waits for its reply.
    cycle_timeout: Duration,
}

impl AudioIngestPipeline {
    pub fn new(config: &RelayConfig, scratch: ScratchDir, bridge: SharedWorkerBridge) -> Arc<Self> {
        Arc::new(Self {
            scratch,
            transcoder: Transcoder::new(config),
            hub: bridge.hub().clone(),
            bridge,
            slots: SensorSlots::default(),
            retain_failed_chunks: config.retain_failed_chunks,
            cycle_timeout: config.http_timeout(),
        })
    }

    /// Handle one inbound real-time message from `client`. Audio work runs
    /// on spawned tasks so the socket reader never waits for it.
    pub fn handle_client_message(self: &Arc<Self>, client: ClientId, raw: &[u8]) {
        let submission = match ClientMessage::parse(raw) {
            Ok(ClientMessage::Audio(submission)) => submission,
            Ok(ClientMessage::Unknown) => {
                debug!("[INGEST] Ignoring non-audio message from client {client}");
                return;
            }
            Err(e) => {
                warn!("[INGEST] Unparseable message from client {client}: {e}");
                self.hub.send_to(client, &BroadcastEvent::error(INVALID_MESSAGE));
                return;
            }
        };

        if let Err(e) = self.accept(client, submission) {
            warn!("[INGEST] Rejected submission from client {client}: {e}");
            self.hub.send_to(client, &BroadcastEvent::error(INVALID_MESSAGE));
        }
    }

    fn accept(self: &Arc<Self>, client: ClientId, submission: AudioSubmission) -> Result<(), RelayError> {
        let AudioSubmission {
            sensor_id,
            is_streaming,
            filename,
            data,
        } = submission;
        let bytes = data
            .into_bytes()
            .map_err(|e| RelayError::InvalidClientInput(format!("bad audio data: {e}")))?;

        if is_streaming {
            let sensor_id = sensor_id.ok_or_else(|| {
                RelayError::InvalidClientInput("streaming audio without sensorId".to_string())
            })?;
            self.submit_stream_chunk(StreamChunk {
                client,
                sensor_id,
                bytes,
            });
        } else {
            let pipeline = Arc::clone(self);
            tokio::spawn(async move {
                pipeline
                    .submit_oneshot(client, sensor_id, filename.as_deref(), bytes)
                    .await;
            });
        }
        Ok(())
    }

    /// Save a complete upload and issue it. Returns the request id when one
    /// was issued.
    pub async fn submit_oneshot(
        &self,
        client: ClientId,
        sensor_id: Option<String>,
        filename: Option<&str>,
        bytes: Vec<u8>,
    ) -> Option<u64> {
        let path = self.scratch.oneshot_path(filename);
        if let Err(e) = tokio::fs::write(&path, &bytes).await {
            error!("[INGEST] Failed to save {}: {e}", path.display());
            self.hub.send_to(client, &BroadcastEvent::error(SAVE_FAILED_MESSAGE));
            return None;
        }
        info!("[INGEST] Saved {} bytes to {}", bytes.len(), path.display());
        self.issue_realtime(&path, sensor_id, None)
    }

    /// Queue a streaming chunk behind its sensor's slot, starting a cycle
    /// task when the slot is free.
    pub fn submit_stream_chunk(self: &Arc<Self>, chunk: StreamChunk) {
        let key = stream_slot_key(&chunk.sensor_id);
        if let Some(chunk) = self.slots.try_begin(&key, chunk) {
            let pipeline = Arc::clone(self);
            tokio::spawn(async move {
                pipeline.run_stream_cycles(key, chunk).await;
            });
        }
    }

    /// Run cycles for the slot `key` until nothing is waiting in it.
    pub async fn run_stream_cycles(&self, key: String, first: StreamChunk) {
        let mut next = Some(first);
        while let Some(chunk) = next {
            self.stream_cycle(&key, chunk).await;
            next = self.slots.finish(&key);
        }
    }

    /// Write, transcode, issue, then wait until the request leaves the
    /// pending table (reply, drain or expiry) or the cycle times out. The
    /// worker reports a failed prediction with an uncorrelated error frame,
    /// so without the timeout such a cycle would hold the slot forever.
    async fn stream_cycle(&self, key: &str, chunk: StreamChunk) {
        let sensor_id = chunk.sensor_id.as_str();
        let container = self.scratch.live_container_path(key);
        let canonical = self.scratch.live_canonical_path(key);

        if let Err(e) = tokio::fs::write(&container, &chunk.bytes).await {
            error!("[INGEST] Failed to save {}: {e}", container.display());
            self.hub.send_to(chunk.client, &BroadcastEvent::error(SAVE_FAILED_MESSAGE));
            return;
        }

        if let Err(e) = self.transcoder.to_canonical(&container, &canonical).await {
            warn!("[INGEST] Dropping chunk for {sensor_id}: {e}");
            if !self.retain_failed_chunks {
                remove_quietly(&container).await;
            }
            return;
        }
        remove_quietly(&container).await;

        let (tx, rx) = oneshot::channel();
        let Some(id) = self.issue_realtime(&canonical, Some(sensor_id.to_string()), Some(tx))
        else {
            return;
        };
        match tokio::time::timeout(self.cycle_timeout, rx).await {
            Ok(Ok(Ok(_))) => debug!("[INGEST] Cycle for {sensor_id} resolved"),
            Ok(Ok(Err(e))) => debug!("[INGEST] Cycle for {sensor_id} ended without reply: {e}"),
            Ok(Err(_)) => debug!("[INGEST] Cycle for {sensor_id} lost its waiter"),
            Err(_) => {
                if self.bridge.discard(id) {
                    warn!(
                        "[INGEST] No reply to request {id} for {sensor_id} within {:?}, moving on",
                        self.cycle_timeout
                    );
                }
            }
        }
    }

    fn issue_realtime(
        &self,
        path: &Path,
        sensor_id: Option<String>,
        waiter: Option<ReplyWaiter>,
    ) -> Option<u64> {
        match self.bridge.issue(path, sensor_id, RequestOrigin::Realtime, waiter) {
            Ok(id) => Some(id),
            Err(RelayError::WorkerUnavailable) => {
                warn!("[INGEST] Worker not ready, dropping {}", path.display());
                self.hub.publish(&BroadcastEvent::error(NOT_READY_MESSAGE));
                None
            }
            Err(e) => {
                error!("[INGEST] Failed to issue {}: {e}", path.display());
                None
            }
        }
    }

    /// Store an HTTP body for the synchronous bridge.
    pub async fn save_http_upload(&self, sensor_id: &str, bytes: &[u8]) -> Result<PathBuf, RelayError> {
        let path = self.scratch.http_upload_path(sensor_id);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| RelayError::file_io(&path, e))?;
        info!("[HTTP] Saved {} bytes to {}", bytes.len(), path.display());
        Ok(path)
    }

    pub fn stream_in_flight(&self, sensor_id: &str) -> bool {
        self.slots.in_flight(&stream_slot_key(sensor_id))
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!("[INGEST] Could not remove {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::broadcast::{BroadcastHub, ClientHandle};
    use crate::web::worker::worker_bridge::WorkerBridge;
    use serde_json::Value;

    fn chunk(client: ClientId, byte: u8) -> StreamChunk {
        sensor_chunk(client, "s1", byte)
    }

    fn sensor_chunk(client: ClientId, sensor_id: &str, byte: u8) -> StreamChunk {
        StreamChunk {
            client,
            sensor_id: sensor_id.to_string(),
            bytes: vec![byte],
        }
    }

    fn events(client: &mut ClientHandle) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = client.rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[test]
    fn test_sanitize_keeps_names_inside_scratch_dir() {
        assert_eq!(sanitize_component("clip 01.webm", "x"), "clip_01.webm");
        assert_eq!(sanitize_component("../../etc/passwd", "x"), "passwd");
        assert_eq!(sanitize_component("..\\evil.wav", "x"), "evil.wav");
        assert_eq!(sanitize_component("..", "audio.wav"), "audio.wav");
        assert_eq!(sanitize_component("", "unknown"), "unknown");
        assert_eq!(sanitize_component("dir/", "unknown"), "unknown");
    }

    #[test]
    fn test_scratch_paths() {
        let scratch = ScratchDir::new("uploads");
        assert_eq!(
            scratch.live_container_path("mic/1"),
            PathBuf::from("uploads/1_live.webm")
        );
        assert_eq!(
            scratch.live_canonical_path("kitchen"),
            PathBuf::from("uploads/kitchen_live.wav")
        );

        let name = scratch.http_upload_path("sensor A").file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("-api-sensor_A.wav"), "{name}");
        let name = scratch.oneshot_path(None).file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("-audio.wav"), "{name}");
    }

    #[test]
    fn test_second_chunk_waits_and_third_supersedes_it() {
        let slots = SensorSlots::default();
        assert_eq!(slots.try_begin("s1", chunk(1, 1)), Some(chunk(1, 1)));
        assert!(slots.try_begin("s1", chunk(1, 2)).is_none());
        assert!(slots.try_begin("s1", chunk(1, 3)).is_none());

        // Other sensors are independent.
        assert!(slots.try_begin("s2", chunk(1, 9)).is_some());

        assert_eq!(slots.finish("s1"), Some(chunk(1, 3)));
        assert!(slots.in_flight("s1"));
        assert_eq!(slots.finish("s1"), None);
        assert!(!slots.in_flight("s1"));
    }

    #[test]
    fn test_ids_sharing_working_files_share_a_slot() {
        assert_eq!(stream_slot_key("mic/1"), stream_slot_key("1"));
        assert_eq!(stream_slot_key("a b"), stream_slot_key("a_b"));
        assert_eq!(stream_slot_key(""), DEFAULT_SENSOR_NAME);

        let dir = tempfile::tempdir().unwrap();
        let bridge = WorkerBridge::new(&RelayConfig::default(), Arc::new(BroadcastHub::new()));
        let pipeline = pipeline_for(dir.path(), "ffmpeg", bridge, true);

        let key = stream_slot_key("mic/1");
        assert!(pipeline.slots.try_begin(&key, sensor_chunk(1, "mic/1", 1)).is_some());
        assert!(pipeline.stream_in_flight("1"));
        assert!(pipeline
            .slots
            .try_begin(&stream_slot_key("1"), sensor_chunk(2, "1", 2))
            .is_none());

        // The parked chunk keeps the id its client sent.
        let parked = pipeline.slots.finish(&key).unwrap();
        assert_eq!(parked.sensor_id, "1");
        assert_eq!(pipeline.scratch.live_container_path(&key), dir.path().join("1_live.webm"));
    }

    fn pipeline_for(
        dir: &Path,
        transcoder: &str,
        bridge: SharedWorkerBridge,
        retain_failed_chunks: bool,
    ) -> Arc<AudioIngestPipeline> {
        let config = RelayConfig {
            transcoder_program: transcoder.to_string(),
            retain_failed_chunks,
            ..RelayConfig::default()
        };
        AudioIngestPipeline::new(&config, ScratchDir::new(dir), bridge)
    }

    #[tokio::test]
    async fn test_oneshot_while_not_ready_announces_error() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(BroadcastHub::new());
        let mut client = hub.register();
        let bridge = WorkerBridge::new(&RelayConfig::default(), hub);
        let pipeline = pipeline_for(dir.path(), "ffmpeg", bridge.clone(), true);

        let id = pipeline
            .submit_oneshot(client.id, Some("s1".to_string()), Some("clip.wav"), vec![1, 2, 3])
            .await;

        assert!(id.is_none());
        assert_eq!(bridge.pending_count(), 0);
        let events = events(&mut client);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "error");
        assert_eq!(events[0]["message"], NOT_READY_MESSAGE);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_unwritable_scratch_reports_to_submitter_only() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(BroadcastHub::new());
        let mut submitter = hub.register();
        let mut other = hub.register();
        let bridge = WorkerBridge::new(&RelayConfig::default(), hub);
        let pipeline = pipeline_for(&dir.path().join("missing"), "ffmpeg", bridge, true);

        pipeline.submit_oneshot(submitter.id, None, None, vec![0]).await;

        assert_eq!(events(&mut submitter)[0]["message"], SAVE_FAILED_MESSAGE);
        assert!(events(&mut other).is_empty());
    }

    #[tokio::test]
    async fn test_streaming_without_sensor_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(BroadcastHub::new());
        let mut client = hub.register();
        let bridge = WorkerBridge::new(&RelayConfig::default(), hub);
        let pipeline = pipeline_for(dir.path(), "ffmpeg", bridge, true);

        pipeline.handle_client_message(client.id, br#"{"type":"audio","isStreaming":true,"data":[1,2]}"#);
        pipeline.handle_client_message(client.id, b"{{not json");
        pipeline.handle_client_message(client.id, br#"{"type":"ping"}"#);

        let events = events(&mut client);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e["message"] == INVALID_MESSAGE));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_transcode_issues_nothing() {
        use crate::web::worker::process_manager::WorkerState;
        use crate::web::worker::worker_bridge::test_support::{
            bridge_with_script, wait_for_state, SILENT_WORKER,
        };

        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(BroadcastHub::new());
        let bridge = bridge_with_script(dir.path(), SILENT_WORKER, hub.clone());
        bridge.start().unwrap();
        wait_for_state(&bridge, WorkerState::Ready).await;

        let mut client = hub.register();
        let scratch = dir.path().join("uploads");
        std::fs::create_dir_all(&scratch).unwrap();
        let pipeline = pipeline_for(&scratch, "false", bridge.clone(), true);

        pipeline
            .run_stream_cycles("s1".to_string(), chunk(client.id, 7))
            .await;

        assert_eq!(bridge.pending_count(), 0);
        assert!(events(&mut client).is_empty());
        assert!(!pipeline.stream_in_flight("s1"));
        // Retained for inspection.
        assert!(scratch.join("s1_live.webm").exists());
        bridge.shutdown();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_transcode_can_delete_container() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(BroadcastHub::new());
        let bridge = WorkerBridge::new(&RelayConfig::default(), hub);
        let pipeline = pipeline_for(dir.path(), "false", bridge, false);

        pipeline
            .run_stream_cycles("s1".to_string(), chunk(1, 7))
            .await;

        assert!(!dir.path().join("s1_live.webm").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stream_cycle_reaches_sensor_update() {
        use crate::web::worker::process_manager::WorkerState;
        use crate::web::worker::worker_bridge::test_support::{
            bridge_with_script, wait_for_state, ECHO_WORKER,
        };

        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(BroadcastHub::new());
        let bridge = bridge_with_script(dir.path(), ECHO_WORKER, hub.clone());
        bridge.start().unwrap();
        wait_for_state(&bridge, WorkerState::Ready).await;

        let mut client = hub.register();
        let pipeline = pipeline_for(dir.path(), "true", bridge.clone(), true);

        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            pipeline.run_stream_cycles("s1".to_string(), chunk(client.id, 7)),
        )
        .await
        .expect("cycle never finished");

        let events = events(&mut client);
        let update = events.iter().find(|e| e["type"] == "sensor_update").unwrap();
        assert_eq!(update["sensorId"], "s1");
        assert!(!dir.path().join("s1_live.webm").exists());
        bridge.shutdown();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sensor_recovers_after_worker_error_frame() {
        use crate::web::worker::process_manager::WorkerState;
        use crate::web::worker::worker_bridge::test_support::{
            bridge_with_script, wait_for_state, FAILS_FIRST_WORKER,
        };

        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(BroadcastHub::new());
        let bridge = bridge_with_script(dir.path(), FAILS_FIRST_WORKER, hub.clone());
        bridge.start().unwrap();
        wait_for_state(&bridge, WorkerState::Ready).await;

        let mut client = hub.register();
        let config = RelayConfig {
            transcoder_program: "true".to_string(),
            http_timeout_ms: 200,
            ..RelayConfig::default()
        };
        let pipeline = AudioIngestPipeline::new(&config, ScratchDir::new(dir.path()), bridge.clone());

        // The first chunk gets the error frame, the second waits behind it.
        pipeline.submit_stream_chunk(sensor_chunk(client.id, "s1", 1));
        pipeline.submit_stream_chunk(sensor_chunk(client.id, "s1", 2));

        let mut seen = Vec::new();
        for _ in 0..250 {
            seen.extend(events(&mut client));
            if !pipeline.stream_in_flight("s1")
                && seen.iter().any(|e| e["type"] == "sensor_update")
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        assert!(seen
            .iter()
            .any(|e| e["type"] == "error" && e["message"] == "Prediction failed"));
        let update = seen.iter().find(|e| e["type"] == "sensor_update").unwrap();
        assert_eq!(update["sensorId"], "s1");
        assert!(!pipeline.stream_in_flight("s1"));
        assert_eq!(bridge.pending_count(), 0);
        bridge.shutdown();
    }
}
