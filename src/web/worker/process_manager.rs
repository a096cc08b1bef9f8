//! Worker process lifecycle management.
//!
//! Spawns the inference worker as a child process, tracks its state, and
//! kills it on restart. Restarts are only ever requested from outside
//! (model reload); a crashed worker stays down.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use log::{error, info, warn};
use sensor_relay_config::RelayConfig;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;

use crate::web::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Starting,
    Ready,
    Stopped,
    Crashed,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a worker process ended.
#[derive(Debug)]
pub enum WorkerExit {
    /// We asked for it (restart or shutdown).
    Killed,
    Exited(ExitStatus),
    WaitFailed(std::io::Error),
}

/// A freshly spawned worker with its pipes taken out.
pub struct SpawnedWorker {
    pub generation: u64,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub child: Child,
    /// Resolves (sent or dropped) when the supervisor wants the child gone.
    pub kill_rx: oneshot::Receiver<()>,
}

/// Owns the worker's lifecycle state. Lives inside the bridge's state lock.
pub struct ProcessSupervisor {
    program: String,
    script: PathBuf,
    model_dir: PathBuf,
    state: WorkerState,
    generation: u64,
    kill_switch: Option<oneshot::Sender<()>>,
    restart_count: u32,
}

impl ProcessSupervisor {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            program: config.worker_program.clone(),
            script: config.worker_script_path(),
            model_dir: config.model_dir.clone(),
            state: WorkerState::NotStarted,
            generation: 0,
            kill_switch: None,
            restart_count: 0,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == WorkerState::Ready
    }

    /// Generation of the current (or last) worker process.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Kill the current worker, if any, and mark it stopped.
    pub fn stop(&mut self) {
        if let Some(kill) = self.kill_switch.take() {
            info!("[PROCESS_MGR] Killing worker (generation {})", self.generation);
            let _ = kill.send(());
        }
        if matches!(self.state, WorkerState::Starting | WorkerState::Ready) {
            self.state = WorkerState::Stopped;
        }
    }

    /// Tear down any existing worker and spawn a replacement.
    pub fn begin_start(&mut self) -> Result<SpawnedWorker, RelayError> {
        let had_worker = self.state != WorkerState::NotStarted;
        self.stop();

        self.generation += 1;
        if had_worker {
            self.restart_count += 1;
        }
        self.state = WorkerState::Starting;

        let mut child = match spawn_worker(&self.program, &self.script, &self.model_dir) {
            Ok(child) => child,
            Err(e) => {
                self.state = WorkerState::Crashed;
                return Err(RelayError::WorkerSpawn(e));
            }
        };

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            self.state = WorkerState::Crashed;
            let _ = child.start_kill();
            return Err(RelayError::WorkerSpawn(std::io::Error::other(
                "worker pipes not available",
            )));
        };

        let (kill_tx, kill_rx) = oneshot::channel();
        self.kill_switch = Some(kill_tx);

        info!(
            "[PROCESS_MGR] Worker spawned (generation {}, pid {:?}, restart #{})",
            self.generation,
            child.id(),
            self.restart_count
        );

        Ok(SpawnedWorker {
            generation: self.generation,
            stdin,
            stdout,
            stderr,
            child,
            kill_rx,
        })
    }

    /// `ready` frame received. Only a starting worker of the current
    /// generation becomes ready.
    pub fn mark_ready(&mut self, generation: u64) -> bool {
        if generation == self.generation && self.state == WorkerState::Starting {
            self.state = WorkerState::Ready;
            true
        } else {
            false
        }
    }

    /// Process exited. Returns false for exits of superseded generations.
    pub fn mark_exited(&mut self, generation: u64, exit: &WorkerExit) -> bool {
        if generation != self.generation {
            return false;
        }
        self.kill_switch = None;
        self.state = match exit {
            WorkerExit::Killed => WorkerState::Stopped,
            WorkerExit::Exited(status) if status.success() => WorkerState::Stopped,
            WorkerExit::Exited(_) | WorkerExit::WaitFailed(_) => WorkerState::Crashed,
        };
        true
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait for the child to exit, or kill it when the kill switch fires.
pub async fn watch_worker(mut child: Child, kill_rx: oneshot::Receiver<()>) -> WorkerExit {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => {
                warn!("[PROCESS_MGR] Worker process exited: {status}");
                WorkerExit::Exited(status)
            }
            Err(e) => {
                error!("[PROCESS_MGR] Failed to wait on worker: {e}");
                WorkerExit::WaitFailed(e)
            }
        },
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                warn!("[PROCESS_MGR] Kill failed (already exited?): {e}");
            }
            WorkerExit::Killed
        }
    }
}

/// Spawn `<program> <script> <model_dir>` with all three pipes captured.
fn spawn_worker(program: &str, script: &Path, model_dir: &Path) -> std::io::Result<Child> {
    info!(
        "[PROCESS_MGR] Spawning worker: {program} {} {}",
        script.display(),
        model_dir.display()
    );

    Command::new(program)
        .arg(script)
        .arg(model_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}
