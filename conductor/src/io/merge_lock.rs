//! Filesystem merge lock, one per (repository, target branch).
//!
//! Acquisition is an exclusive create of a JSON record, so it is atomic for
//! every process sharing the filesystem. A record is stale when its heartbeat
//! is older than the threshold or its pid no longer exists on this host; stale
//! records are reclaimed by renaming them aside and checking that the record
//! moved is the one judged stale.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// Floor for the heartbeat period so tiny thresholds do not spin.
const MIN_REFRESH: Duration = Duration::from_millis(10);

/// Persisted lock holder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRecord {
    pub holder: String,
    pub repo: String,
    pub source_branch: String,
    pub target_branch: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub pid: u32,
}

impl LockRecord {
    fn same_owner(&self, other: &LockRecord) -> bool {
        self.holder == other.holder && self.pid == other.pid && self.acquired_at == other.acquired_at
    }
}

/// Outcome of a bounded wait; a timeout is not an error.
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(LockGuard),
    TimedOut { holder: String },
}

/// Lock for one (repo, target) pair.
#[derive(Debug, Clone)]
pub struct MergeLock {
    path: PathBuf,
    repo: String,
    target: String,
    stale_after: Duration,
}

impl MergeLock {
    pub fn new(locks_dir: &Path, repo: &str, target: &str, stale_after: Duration) -> Self {
        let file_name = format!("{}@{}.json", escape(repo), escape(target));
        Self {
            path: locks_dir.join(file_name),
            repo: repo.to_string(),
            target: target.to_string(),
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current live holder, if any. Stale records are reported as `None`.
    pub fn holder(&self) -> Result<Option<LockRecord>> {
        match read_record(&self.path)? {
            Some(record) if !self.is_stale(&record, Utc::now()) => Ok(Some(record)),
            _ => Ok(None),
        }
    }

    /// Try once. `Ok(None)` means a live holder exists.
    #[instrument(skip_all, fields(repo = %self.repo, target = %self.target, holder = %holder))]
    pub fn try_acquire(&self, holder: &str, source_branch: &str) -> Result<Option<LockGuard>> {
        let parent = self
            .path
            .parent()
            .with_context(|| format!("lock path missing parent {}", self.path.display()))?;
        fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;

        // A reclaim can race another reclaimer or a fresh holder; retry a few times.
        for _ in 0..3 {
            let now = Utc::now();
            let record = LockRecord {
                holder: holder.to_string(),
                repo: self.repo.clone(),
                source_branch: source_branch.to_string(),
                target_branch: self.target.clone(),
                acquired_at: now,
                heartbeat_at: now,
                pid: std::process::id(),
            };
            if self.create_exclusive(&record)? {
                debug!("merge lock acquired");
                return Ok(Some(LockGuard {
                    path: self.path.clone(),
                    record,
                    refresh_every: (self.stale_after / 4).max(MIN_REFRESH),
                    released: false,
                }));
            }

            match read_record(&self.path)? {
                // Released between our create and read.
                None if !self.path.exists() => continue,
                // Unreadable record: a creator is mid-write unless the file is old.
                None => {
                    if !self.file_is_old()? {
                        return Ok(None);
                    }
                    warn!(path = %self.path.display(), "reclaiming unreadable merge lock");
                    self.reclaim(None)?;
                }
                Some(existing) if self.is_stale(&existing, now) => {
                    info!(stale_holder = %existing.holder, pid = existing.pid, "reclaiming stale merge lock");
                    self.reclaim(Some(&existing))?;
                }
                Some(_) => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Poll until acquired or `max_wait` elapses, calling `on_wait(holder, waited)`
    /// after every unsuccessful poll.
    pub fn acquire_with_wait(
        &self,
        holder: &str,
        source_branch: &str,
        max_wait: Duration,
        poll_interval: Duration,
        on_wait: &mut dyn FnMut(&str, Duration),
    ) -> Result<LockAttempt> {
        let started = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire(holder, source_branch)? {
                return Ok(LockAttempt::Acquired(guard));
            }
            let current = self
                .holder()?
                .map_or_else(|| "unknown".to_string(), |record| record.holder);
            let waited = started.elapsed();
            if waited >= max_wait {
                warn!(holder = %current, waited_secs = waited.as_secs(), "merge lock wait timed out");
                return Ok(LockAttempt::TimedOut { holder: current });
            }
            on_wait(&current, waited);
            thread::sleep(poll_interval.min(max_wait - waited));
        }
    }

    fn is_stale(&self, record: &LockRecord, now: DateTime<Utc>) -> bool {
        let age = now
            .signed_duration_since(record.heartbeat_at)
            .to_std()
            .unwrap_or_default();
        age > self.stale_after || !process_alive(record.pid)
    }

    fn file_is_old(&self) -> Result<bool> {
        let modified = match fs::metadata(&self.path).and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                return Err(err).with_context(|| format!("stat lock {}", self.path.display()));
            }
        };
        Ok(modified.elapsed().unwrap_or_default() > self.stale_after)
    }

    fn create_exclusive(&self, record: &LockRecord) -> Result<bool> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => {
                return Err(err).with_context(|| format!("create lock {}", self.path.display()));
            }
        };
        let buf = serde_json::to_vec_pretty(record).context("serialize lock record")?;
        let written = file.write_all(&buf).and_then(|()| file.sync_all());
        if let Err(err) = written {
            let _ = fs::remove_file(&self.path);
            return Err(err).with_context(|| format!("write lock {}", self.path.display()));
        }
        Ok(true)
    }

    /// Move the record aside and drop it if it is still the one judged stale.
    fn reclaim(&self, observed: Option<&LockRecord>) -> Result<()> {
        let aside = self.path.with_extension(format!(
            "stale.{}.{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            // Another reclaimer or the holder got there first.
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("move stale lock {}", self.path.display()));
            }
        }
        let moved = read_record(&aside)?;
        let matches = match (observed, moved.as_ref()) {
            (Some(expected), Some(actual)) => expected == actual,
            (None, None) => true,
            _ => false,
        };
        if !matches {
            warn!(path = %self.path.display(), "lock changed during reclaim, restoring");
            if let Err(err) = fs::hard_link(&aside, &self.path) {
                warn!(err = %err, "restore merge lock failed");
            }
        }
        fs::remove_file(&aside).with_context(|| format!("remove stale lock {}", aside.display()))?;
        Ok(())
    }
}

/// Held merge lock; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    record: LockRecord,
    refresh_every: Duration,
    released: bool,
}

impl LockGuard {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Bump the heartbeat so long-running holders are not judged stale.
    pub fn refresh(&mut self) -> Result<()> {
        let current = read_record(&self.path)?;
        if !current.is_some_and(|current| current.same_owner(&self.record)) {
            warn!(path = %self.path.display(), "merge lock no longer ours, not refreshing");
            return Ok(());
        }
        self.record.heartbeat_at = Utc::now();
        let mut buf = serde_json::to_string_pretty(&self.record).context("serialize lock record")?;
        buf.push('\n');
        let tmp_path = self
            .path
            .with_extension(format!("json.{}.tmp", std::process::id()));
        fs::write(&tmp_path, buf)
            .with_context(|| format!("write temp lock {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replace lock {}", self.path.display()))?;
        Ok(())
    }

    /// Run `work` while a background thread refreshes the heartbeat every
    /// quarter of the stale threshold, however long `work` stays silent.
    pub fn hold_while<T>(&mut self, work: impl FnOnce() -> T) -> T {
        let every = self.refresh_every;
        let (stop, stopped) = mpsc::channel::<()>();
        thread::scope(|scope| {
            let guard = &mut *self;
            scope.spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(every) {
                    if let Err(err) = guard.refresh() {
                        warn!(err = %format!("{err:#}"), "merge lock heartbeat failed");
                    }
                }
            });
            let value = work();
            drop(stop);
            value
        })
    }

    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match read_record(&self.path)? {
            Some(current) if current.same_owner(&self.record) => {
                fs::remove_file(&self.path)
                    .with_context(|| format!("remove lock {}", self.path.display()))?;
                debug!(path = %self.path.display(), "merge lock released");
            }
            _ => warn!(path = %self.path.display(), "merge lock was reclaimed by another holder"),
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(err = %err, "release merge lock failed");
        }
    }
}

/// Read a lock record; `None` when missing or not (yet) valid JSON.
fn read_record(path: &Path) -> Result<Option<LockRecord>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read lock {}", path.display())),
    };
    Ok(serde_json::from_str(&contents).ok())
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(pid: u32) -> bool {
    use std::process::{Command, Stdio};
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(true)
}
