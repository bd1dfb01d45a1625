//! Per-task retry counters (`<state>/state/retries.json`).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    /// Agent finished but left uncommitted work.
    Commit,
    /// Conflict-resolution agent failed.
    Conflict,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryCounts {
    #[serde(default)]
    pub commit: u32,
    #[serde(default)]
    pub conflict: u32,
}

impl RetryCounts {
    pub fn count(&self, kind: RetryKind) -> u32 {
        match kind {
            RetryKind::Commit => self.commit,
            RetryKind::Conflict => self.conflict,
        }
    }

    fn get_mut(&mut self, kind: RetryKind) -> &mut u32 {
        match kind {
            RetryKind::Commit => &mut self.commit,
            RetryKind::Conflict => &mut self.conflict,
        }
    }

    fn is_zero(&self) -> bool {
        self.commit == 0 && self.conflict == 0
    }
}

/// Persisted counters keyed by task id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryState {
    #[serde(default)]
    pub tasks: BTreeMap<String, RetryCounts>,
}

/// File-backed counters; mutations reload and rewrite the file.
#[derive(Debug)]
pub struct RetryStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl RetryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn get(&self, task_id: &str, kind: RetryKind) -> Result<u32> {
        let state = load_retry_state(&self.path)?;
        Ok(state
            .tasks
            .get(task_id)
            .map_or(0, |counts| counts.count(kind)))
    }

    /// Increment and return the new count.
    pub fn increment(&self, task_id: &str, kind: RetryKind) -> Result<u32> {
        self.mutate(|state| {
            let counter = state.tasks.entry(task_id.to_string()).or_default().get_mut(kind);
            *counter += 1;
            *counter
        })
    }

    pub fn reset(&self, task_id: &str, kind: RetryKind) -> Result<()> {
        self.mutate(|state| {
            if let Some(counts) = state.tasks.get_mut(task_id) {
                *counts.get_mut(kind) = 0;
                if counts.is_zero() {
                    state.tasks.remove(task_id);
                }
            }
        })
    }

    pub fn clear(&self, task_id: &str) -> Result<()> {
        self.mutate(|state| {
            state.tasks.remove(task_id);
        })
    }

    fn mutate<T>(&self, apply: impl FnOnce(&mut RetryState) -> T) -> Result<T> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("retry store lock poisoned"))?;
        let mut state = load_retry_state(&self.path)?;
        let value = apply(&mut state);
        write_retry_state(&self.path, &state)?;
        Ok(value)
    }
}

/// Load counters; a missing file means no retries yet.
pub fn load_retry_state(path: &Path) -> Result<RetryState> {
    if !path.exists() {
        return Ok(RetryState::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read retry state {}", path.display()))?;
    let state: RetryState = serde_json::from_str(&contents)
        .with_context(|| format!("parse retry state {}", path.display()))?;
    Ok(state)
}

/// Atomically write counters to disk (temp file + rename).
pub fn write_retry_state(path: &Path, state: &RetryState) -> Result<()> {
    debug!(path = %path.display(), tasks = state.tasks.len(), "writing retry state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("retry state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension(format!("json.{}.tmp", std::process::id()));
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp retry state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace retry state {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_reset_and_survive_reload() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("retries.json");
        let store = RetryStore::new(&path);

        assert_eq!(store.get("t", RetryKind::Commit).expect("get"), 0);
        assert_eq!(store.increment("t", RetryKind::Commit).expect("inc"), 1);
        assert_eq!(store.increment("t", RetryKind::Commit).expect("inc"), 2);
        assert_eq!(store.increment("t", RetryKind::Conflict).expect("inc"), 1);

        let reopened = RetryStore::new(&path);
        assert_eq!(reopened.get("t", RetryKind::Commit).expect("get"), 2);

        reopened.reset("t", RetryKind::Commit).expect("reset");
        assert_eq!(reopened.get("t", RetryKind::Commit).expect("get"), 0);
        assert_eq!(reopened.get("t", RetryKind::Conflict).expect("get"), 1);

        reopened.clear("t").expect("clear");
        assert_eq!(load_retry_state(&path).expect("load"), RetryState::default());
    }
}
