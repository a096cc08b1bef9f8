//! Polls the model directory and restarts the worker when its files change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, error, info, warn};
use sensor_relay_types::BroadcastEvent;
use walkdir::WalkDir;

use crate::web::worker::worker_bridge::SharedWorkerBridge;

pub const RELOAD_MESSAGE: &str = "Model files changed. Reloading...";

/// `(mtime, size)` for every file under a directory.
pub type DirSnapshot = BTreeMap<PathBuf, (Option<SystemTime>, u64)>;

pub fn snapshot_dir(root: &Path) -> DirSnapshot {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("[WATCHER] Skipping entry: {e}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            Some((entry.into_path(), (meta.modified().ok(), meta.len())))
        })
        .collect()
}

/// Change detector with a one-tick debounce: a change fires only once the
/// directory has stayed the same for a whole tick.
#[derive(Debug, Default)]
pub struct ChangeDebouncer {
    last: Option<DirSnapshot>,
    dirty: bool,
}

impl ChangeDebouncer {
    pub fn new(initial: DirSnapshot) -> Self {
        Self {
            last: Some(initial),
            dirty: false,
        }
    }

    /// Feed one snapshot; returns true when a reload should happen now.
    pub fn observe(&mut self, snapshot: DirSnapshot) -> bool {
        let changed = self.last.as_ref() != Some(&snapshot);
        self.last = Some(snapshot);
        if changed {
            self.dirty = true;
            false
        } else if self.dirty {
            self.dirty = false;
            true
        } else {
            false
        }
    }
}

pub fn spawn_model_watcher(
    bridge: SharedWorkerBridge,
    model_dir: PathBuf,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "[WATCHER] Watching {} every {interval:?}",
            model_dir.display()
        );
        let mut debouncer = ChangeDebouncer::new(snapshot_of(&model_dir).await);
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if !debouncer.observe(snapshot_of(&model_dir).await) {
                continue;
            }

            warn!("[WATCHER] Model files changed, restarting worker");
            bridge.hub().publish(&BroadcastEvent::status(RELOAD_MESSAGE));
            if let Err(e) = bridge.start() {
                error!("[WATCHER] Worker restart failed: {e}");
                bridge.hub().publish(&BroadcastEvent::error(e.to_string()));
            }
        }
    })
}

async fn snapshot_of(dir: &Path) -> DirSnapshot {
    let dir = dir.to_path_buf();
    match tokio::task::spawn_blocking(move || snapshot_dir(&dir)).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!("[WATCHER] Snapshot task failed: {e}");
            DirSnapshot::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_lists_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.pkl"), b"abc").unwrap();
        std::fs::create_dir(dir.path().join("scalers")).unwrap();
        std::fs::write(dir.path().join("scalers").join("scaler.pkl"), b"de").unwrap();

        let snapshot = snapshot_dir(dir.path());
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&dir.path().join("model.pkl")].1, 3);
    }

    #[test]
    fn test_missing_dir_is_empty_snapshot() {
        assert!(snapshot_dir(Path::new("/nonexistent/model-dir")).is_empty());
    }

    #[test]
    fn test_change_fires_after_one_quiet_tick() {
        let mut a = DirSnapshot::new();
        a.insert(PathBuf::from("m.pkl"), (None, 1));
        let mut b = a.clone();
        b.insert(PathBuf::from("m.pkl"), (None, 2));
        let mut c = b.clone();
        c.insert(PathBuf::from("labels.json"), (None, 5));

        let mut debouncer = ChangeDebouncer::new(a.clone());
        assert!(!debouncer.observe(a));
        assert!(!debouncer.observe(b));
        // Still being written.
        assert!(!debouncer.observe(c.clone()));
        assert!(debouncer.observe(c.clone()));
        assert!(!debouncer.observe(c));
    }
}
