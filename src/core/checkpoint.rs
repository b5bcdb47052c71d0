//! LD-013: Checkpoint store — load, save (atomic + fsync), clear, run lock.
//!
//! Layout: `<state_dir>/<run_key>/{checkpoint.json, events.jsonl, run.lock}`.

use super::error::CheckpointError;
use super::types::{CheckpointState, Operation, RunKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CHECKPOINT_FILE: &str = "checkpoint.json";
const LOCK_FILE: &str = "run.lock";
const SCHEMA: &str = "1.0";

/// Contents of `run.lock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Held while a run mutates remote state. Removes the lock file on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "cannot release run lock");
        }
    }
}

/// Durable per-run-key progress records.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    state_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn run_dir(&self, key: &RunKey) -> PathBuf {
        self.state_dir.join(key.as_str())
    }

    pub fn checkpoint_path(&self, key: &RunKey) -> PathBuf {
        self.run_dir(key).join(CHECKPOINT_FILE)
    }

    pub fn lock_path(&self, key: &RunKey) -> PathBuf {
        self.run_dir(key).join(LOCK_FILE)
    }

    /// Load the checkpoint for a run key. `Ok(None)` when absent; `Corrupt`
    /// when present but unreadable, unparseable, or written for another key.
    pub fn load(&self, key: &RunKey) -> Result<Option<CheckpointState>, CheckpointError> {
        let path = self.checkpoint_path(key);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CheckpointError::Corrupt {
                    path,
                    reason: format!("unreadable: {}", e),
                })
            }
        };
        let state: CheckpointState =
            serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if &state.run_key != key {
            return Err(CheckpointError::Corrupt {
                path,
                reason: format!("written for run key {}, expected {}", state.run_key, key),
            });
        }
        debug!(
            run_key = %key,
            completed = state.completed_action_ids.len(),
            pending = state.pending_actions.len(),
            "loaded checkpoint"
        );
        Ok(Some(state))
    }

    /// Save atomically: write temp, fsync, rename. Stamps `last_updated`.
    pub fn save(&self, state: &mut CheckpointState) -> Result<(), CheckpointError> {
        state.last_updated = Utc::now();
        let path = self.checkpoint_path(&state.run_key);
        let dir = self.run_dir(&state.run_key);
        std::fs::create_dir_all(&dir).map_err(|source| CheckpointError::Io {
            path: dir.clone(),
            source,
        })?;

        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| CheckpointError::Serialize(e.to_string()))?;

        let tmp_path = path.with_extension("json.tmp");
        let io_err = |source| CheckpointError::Io {
            path: tmp_path.clone(),
            source,
        };
        let mut file = std::fs::File::create(&tmp_path).map_err(io_err)?;
        file.write_all(&json).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        std::fs::rename(&tmp_path, &path).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Remove the checkpoint and any leftover temp file. Returns whether a
    /// checkpoint existed.
    pub fn clear(&self, key: &RunKey) -> Result<bool, CheckpointError> {
        let path = self.checkpoint_path(key);
        let _ = std::fs::remove_file(path.with_extension("json.tmp"));
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CheckpointError::Io { path, source }),
        }
    }

    /// Take the exclusive run lock. A lock left behind by a dead process on
    /// this host is taken over.
    pub fn lock(&self, key: &RunKey) -> Result<RunLock, CheckpointError> {
        let dir = self.run_dir(key);
        std::fs::create_dir_all(&dir).map_err(|source| CheckpointError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = self.lock_path(key);
        match self.try_create_lock(&path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => match stale_lock(&path) {
                Some(stale) => self.take_over(key, path, &stale),
                None => Err(CheckpointError::RunLocked {
                    run_key: key.to_string(),
                    path,
                }),
            },
            Err(source) => Err(CheckpointError::Io { path, source }),
        }
    }

    /// Replace a lock judged stale. The old file is renamed aside first so
    /// that only one contender can claim it; if what was moved is no longer
    /// the stale lock, another process got there first and its lock is put
    /// back.
    fn take_over(&self, key: &RunKey, path: PathBuf, stale: &LockInfo) -> Result<RunLock, CheckpointError> {
        let locked = |path: PathBuf| CheckpointError::RunLocked {
            run_key: key.to_string(),
            path,
        };
        let aside = path.with_extension(format!("lock.stale-{}", std::process::id()));
        match std::fs::rename(&path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(CheckpointError::Io { path, source }),
        }
        if read_lock(&aside).is_some_and(|moved| moved != *stale) {
            // hard_link never clobbers, so a lock created meanwhile wins.
            let _ = std::fs::hard_link(&aside, &path);
            let _ = std::fs::remove_file(&aside);
            return Err(locked(path));
        }
        let _ = std::fs::remove_file(&aside);

        warn!(path = %path.display(), stale_pid = stale.pid, "taking over stale run lock");
        match self.try_create_lock(&path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(locked(path)),
            Err(source) => Err(CheckpointError::Io { path, source }),
        }
    }

    fn try_create_lock(&self, path: &Path) -> std::io::Result<RunLock> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let json = serde_json::to_string(&info).map_err(std::io::Error::other)?;
        file.write_all(json.as_bytes())?;
        Ok(RunLock {
            path: path.to_path_buf(),
        })
    }

    /// Remove a run lock unconditionally. Returns whether one existed.
    pub fn unlock(&self, key: &RunKey) -> Result<bool, CheckpointError> {
        let path = self.lock_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CheckpointError::Io { path, source }),
        }
    }

    pub fn is_locked(&self, key: &RunKey) -> bool {
        self.lock_path(key).exists()
    }

    /// Every run directory holding a checkpoint, keyed by run key. Corrupt
    /// checkpoints are listed with their error.
    pub fn list(&self) -> Result<BTreeMap<RunKey, Result<CheckpointState, CheckpointError>>, String> {
        let mut out = BTreeMap::new();
        let entries = match std::fs::read_dir(&self.state_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(format!("cannot read {}: {}", self.state_dir.display(), e)),
        };
        for entry in entries.filter_map(|e| e.ok()) {
            if !entry.path().join(CHECKPOINT_FILE).exists() {
                continue;
            }
            let key = RunKey::from_raw(&entry.file_name().to_string_lossy());
            let loaded = self.load(&key).and_then(|s| {
                s.ok_or_else(|| CheckpointError::Corrupt {
                    path: self.checkpoint_path(&key),
                    reason: "vanished while listing".to_string(),
                })
            });
            out.insert(key, loaded);
        }
        Ok(out)
    }
}

fn read_lock(path: &Path) -> Option<LockInfo> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// The lock at `path` if its owner is gone. Unreadable locks are never stale.
fn stale_lock(path: &Path) -> Option<LockInfo> {
    read_lock(path).filter(|info| !process_alive(info.pid))
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Fresh checkpoint for a run key.
pub fn new_checkpoint(key: &RunKey, operation: Operation, run_id: &str) -> CheckpointState {
    let now = Utc::now();
    CheckpointState {
        schema: SCHEMA.to_string(),
        run_id: run_id.to_string(),
        run_key: key.clone(),
        operation,
        completed_action_ids: BTreeSet::new(),
        pending_actions: Vec::new(),
        classifications: BTreeMap::new(),
        created_at: now,
        last_updated: now,
        generator: format!("larder {}", env!("CARGO_PKG_VERSION")),
    }
}
