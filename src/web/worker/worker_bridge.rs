//! Server-side abstraction for communicating with the worker process.
//!
//! Owns the supervisor, the stdin queue of the current worker, and the
//! pending-request table behind a single lock. Every reaction (frame,
//! exit, issue, restart, sweep) runs as one short critical section that is
//! never held across an await, so the table is only ever mutated by one
//! reaction at a time.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use sensor_relay_config::RelayConfig;
use sensor_relay_types::BroadcastEvent;
use tokio::sync::{mpsc, oneshot};

use super::correlator::{ReplyOutcome, ReplyWaiter, RequestCorrelator, RequestOrigin};
use super::ipc_channel::{read_frames, stderr_log_task, stdin_writer_task};
use super::ipc_types::{encode_request, WorkerFrame, WorkerRequest};
use super::process_manager::{watch_worker, ProcessSupervisor, WorkerExit, WorkerState};
use crate::web::broadcast::SharedBroadcastHub;
use crate::web::error::RelayError;

const DEFAULT_READY_MESSAGE: &str = "Model ready.";
const DEFAULT_ERROR_MESSAGE: &str = "Model error.";

/// Shared reference to the WorkerBridge.
pub type SharedWorkerBridge = Arc<WorkerBridge>;

struct RelayState {
    supervisor: ProcessSupervisor,
    /// Sends encoded request lines to the current worker's stdin writer.
    cmd_tx: Option<mpsc::UnboundedSender<String>>,
    correlator: RequestCorrelator,
}

/// Server-side handle to the worker process.
pub struct WorkerBridge {
    state: Mutex<RelayState>,
    hub: SharedBroadcastHub,
}

impl WorkerBridge {
    pub fn new(config: &RelayConfig, hub: SharedBroadcastHub) -> SharedWorkerBridge {
        Arc::new(Self {
            state: Mutex::new(RelayState {
                supervisor: ProcessSupervisor::new(config),
                cmd_tx: None,
                correlator: RequestCorrelator::new(hub.clone()),
            }),
            hub,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// (Re)start the worker as a controlled drain: kill the old process,
    /// fail everything still pending, then spawn the replacement.
    pub fn start(self: &Arc<Self>) -> Result<(), RelayError> {
        let worker = {
            let mut state = self.lock_state();
            state.supervisor.stop();
            state.cmd_tx = None;
            state.correlator.drain();

            let worker = state.supervisor.begin_start()?;
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<String>();
            state.cmd_tx = Some(cmd_tx);
            tokio::spawn(stdin_writer_task(cmd_rx, worker.stdin));
            (worker.generation, worker.stdout, worker.stderr, worker.child, worker.kill_rx)
        };
        let (generation, stdout, stderr, child, kill_rx) = worker;

        let reader_bridge = Arc::clone(self);
        tokio::spawn(async move {
            read_frames(stdout, |frame| reader_bridge.handle_frame(generation, frame)).await;
        });
        tokio::spawn(stderr_log_task(stderr));

        let exit_bridge = Arc::clone(self);
        tokio::spawn(async move {
            let exit = watch_worker(child, kill_rx).await;
            exit_bridge.handle_exit(generation, &exit);
        });

        Ok(())
    }

    /// Kill the worker without replacing it.
    pub fn shutdown(&self) {
        let mut state = self.lock_state();
        state.supervisor.stop();
        state.cmd_tx = None;
        state.correlator.drain();
    }

    /// React to one decoded frame from the worker of `generation`.
    pub fn handle_frame(&self, generation: u64, frame: WorkerFrame) {
        let mut state = self.lock_state();
        if state.supervisor.generation() != generation {
            debug!("[BRIDGE] Ignoring frame from superseded worker generation {generation}");
            return;
        }

        match frame {
            WorkerFrame::Ready { message } => {
                if state.supervisor.mark_ready(generation) {
                    let message = message.unwrap_or_else(|| DEFAULT_READY_MESSAGE.to_string());
                    info!("[BRIDGE] Worker ready: {message}");
                    self.hub.publish(&BroadcastEvent::status(message));
                } else {
                    warn!("[BRIDGE] Ready frame while worker is {}", state.supervisor.state());
                }
            }
            WorkerFrame::Error { message } => {
                let message = message.unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string());
                error!("[BRIDGE] Worker error: {message}");
                self.hub.publish(&BroadcastEvent::error(message));
            }
            WorkerFrame::Response { id, message } => {
                // Unknown ids are logged by the correlator and dropped.
                let _ = state.correlator.resolve(id, message);
            }
        }
    }

    fn handle_exit(&self, generation: u64, exit: &WorkerExit) {
        let mut state = self.lock_state();
        if state.supervisor.mark_exited(generation, exit) {
            state.cmd_tx = None;
            warn!(
                "[BRIDGE] Worker generation {generation} is down ({})",
                state.supervisor.state()
            );
        }
    }

    /// Send one inference request. The sensor linkage is recorded together
    /// with the entry, before the frame is queued.
    pub fn issue(
        &self,
        audio_path: &Path,
        sensor_id: Option<String>,
        origin: RequestOrigin,
        waiter: Option<ReplyWaiter>,
    ) -> Result<u64, RelayError> {
        let mut state = self.lock_state();
        if !state.supervisor.is_ready() {
            return Err(RelayError::WorkerUnavailable);
        }
        let Some(cmd_tx) = state.cmd_tx.clone() else {
            return Err(RelayError::WorkerUnavailable);
        };

        let id = state.correlator.register(sensor_id, origin, waiter);
        let line = match encode_request(&WorkerRequest {
            id,
            audio_path: audio_path.to_string_lossy().into_owned(),
        }) {
            Ok(line) => line,
            Err(e) => {
                state.correlator.discard(id);
                return Err(e);
            }
        };

        if cmd_tx.send(line).is_err() {
            state.correlator.discard(id);
            return Err(RelayError::WorkerUnavailable);
        }
        debug!("[BRIDGE] Issued request {id} for {}", audio_path.display());
        Ok(id)
    }

    /// Issue a request and wait for its reply, the HTTP way: a hard
    /// timeout races the reply and exactly one of them wins.
    pub async fn request_and_wait(
        &self,
        audio_path: &Path,
        sensor_id: Option<String>,
        timeout: Duration,
    ) -> ReplyOutcome {
        let (tx, rx) = oneshot::channel();
        let id = self.issue(audio_path, sensor_id, RequestOrigin::Http, Some(tx))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RelayError::WorkerRestarted),
            Err(_) => {
                if self.discard(id) {
                    warn!("[BRIDGE] Request {id} timed out after {timeout:?}");
                }
                Err(RelayError::Timeout)
            }
        }
    }

    /// Drop stale real-time entries. Returns the expired ids.
    pub fn expire_pending(&self, max_age: Duration) -> Vec<u64> {
        self.lock_state().correlator.expire(max_age, Instant::now())
    }

    /// Periodically expire real-time requests older than `max_age`.
    pub fn spawn_expiry_sweep(self: &Arc<Self>, max_age: Duration) -> tokio::task::JoinHandle<()> {
        let bridge = Arc::clone(self);
        let period = (max_age / 2).max(Duration::from_secs(1));
        info!("[BRIDGE] Pending requests expire after {max_age:?} (sweep every {period:?})");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                bridge.expire_pending(max_age);
            }
        })
    }

    pub fn worker_state(&self) -> WorkerState {
        self.lock_state().supervisor.state()
    }

    pub fn is_ready(&self) -> bool {
        self.lock_state().supervisor.is_ready()
    }

    pub fn generation(&self) -> u64 {
        self.lock_state().supervisor.generation()
    }

    pub fn restart_count(&self) -> u32 {
        self.lock_state().supervisor.restart_count()
    }

    /// Forget a pending request whose caller stopped waiting. Returns
    /// whether it was still pending.
    pub fn discard(&self, id: u64) -> bool {
        self.lock_state().correlator.discard(id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock_state().correlator.len()
    }

    pub fn hub(&self) -> &SharedBroadcastHub {
        &self.hub
    }
}

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use std::path::Path;
    use std::time::Duration;

    use sensor_relay_config::RelayConfig;

    use super::{SharedWorkerBridge, WorkerBridge};
    use crate::web::broadcast::SharedBroadcastHub;
    use crate::web::worker::process_manager::WorkerState;

    /// Answers every request with prediction 1 / confidence 0.75.
    pub const ECHO_WORKER: &str = r##"echo '{"type":"ready","message":"Loaded model: fake.pkl"}'
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/^{"id":\([0-9]*\),.*$/\1/p')
  printf '{"type":"response","id":%s,"message":"{\\"prediction\\":1,\\"confidence\\":0.75}"}\n' "$id"
done
"##;

    /// Fails the first request with an uncorrelated error frame, then
    /// answers like [`ECHO_WORKER`].
    pub const FAILS_FIRST_WORKER: &str = r##"echo '{"type":"ready"}'
n=0
while IFS= read -r line; do
  n=$((n+1))
  id=$(printf '%s' "$line" | sed -n 's/^{"id":\([0-9]*\),.*$/\1/p')
  if [ "$n" -eq 1 ]; then
    echo '{"type":"error","message":"Prediction failed"}'
  else
    printf '{"type":"response","id":%s,"message":"{\\"prediction\\":1,\\"confidence\\":0.75}"}\n' "$id"
  fi
done
"##;

    /// Becomes ready and then never answers.
    pub const SILENT_WORKER: &str = r##"echo '{"type":"ready"}'
while IFS= read -r line; do :; done
"##;

    pub fn bridge_with_script(
        dir: &Path,
        script: &str,
        hub: SharedBroadcastHub,
    ) -> SharedWorkerBridge {
        let script_path = dir.join("worker.sh");
        std::fs::write(&script_path, script).unwrap();
        let config = RelayConfig {
            worker_program: "sh".to_string(),
            worker_script: Some(script_path),
            model_dir: dir.to_path_buf(),
            ..RelayConfig::default()
        };
        WorkerBridge::new(&config, hub)
    }

    pub async fn wait_for_state(bridge: &WorkerBridge, wanted: WorkerState) {
        for _ in 0..250 {
            if bridge.worker_state() == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("worker never reached {wanted}, still {}", bridge.worker_state());
    }
}
