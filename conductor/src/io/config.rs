//! Conductor configuration stored in `conductor.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Conductor configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// values that work for a single local repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConductorConfig {
    /// Task store, relative to the workspace root unless absolute.
    pub tasks_file: PathBuf,

    /// Directory for locks, retry counters, questions and worktrees.
    pub state_dir: PathBuf,

    /// Sleep between polls when no task is available.
    pub poll_interval_secs: u64,

    /// Provider used when neither the task nor its lane names one.
    pub default_provider: String,

    pub lanes: BTreeMap<String, LaneConfig>,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub repos: BTreeMap<String, RepoConfig>,
    pub merge: MergeConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LaneConfig {
    /// Default provider for tasks claimed by this lane.
    pub provider: Option<String>,
}

/// Subprocess-backed agent provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Program and fixed arguments; the prompt is written to stdin.
    pub command: Vec<String>,
    /// Extra arguments when resuming; `{session_id}` is substituted.
    pub resume_args: Vec<String>,
    /// Extra arguments carrying the system prompt; `{system_prompt}` is substituted.
    pub system_prompt_args: Vec<String>,
    /// Regex with one capture group extracting the session id from stdout.
    pub session_pattern: Option<String>,
    pub timeout_secs: u64,
    /// Keep at most this many bytes of stdout/stderr in memory.
    pub output_limit_bytes: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            resume_args: Vec::new(),
            system_prompt_args: Vec::new(),
            session_pattern: None,
            timeout_secs: 60 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

/// A named repository tasks can refer to via `repo`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RepoConfig {
    /// Main checkout of the repository.
    pub path: PathBuf,
    /// Falls back to the remote HEAD, then `main`.
    pub default_branch: Option<String>,
    pub remote: String,
    /// Where task worktrees are created; defaults under the state dir.
    pub worktrees_dir: Option<PathBuf>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            default_branch: None,
            remote: "origin".to_string(),
            worktrees_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MergeConfig {
    /// Longest time to wait for another holder's merge lock.
    pub lock_wait_secs: u64,
    pub lock_poll_secs: u64,
    /// Lock records whose heartbeat is older than this are reclaimed.
    pub lock_stale_secs: u64,
    /// Failed commit-resume rounds before a task is forced to `blocked`.
    pub commit_retry_limit: u32,
    /// Failed conflict resolutions before `blocked`; unset leaves recovery manual.
    pub conflict_retry_limit: Option<u32>,
    /// Push the merge target after a successful merge (requires `git.push_to_remote`).
    pub push_target: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            lock_wait_secs: 10 * 60,
            lock_poll_secs: 5,
            lock_stale_secs: 10 * 60,
            commit_retry_limit: 3,
            conflict_retry_limit: None,
            push_target: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Additional case-insensitive regexes that mark a session as unusable.
    pub corruption_patterns: Vec<String>,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            tasks_file: PathBuf::from("tasks.json"),
            state_dir: PathBuf::from(".conductor"),
            poll_interval_secs: 10,
            default_provider: "default".to_string(),
            lanes: BTreeMap::new(),
            providers: BTreeMap::new(),
            repos: BTreeMap::new(),
            merge: MergeConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl ConductorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_provider.trim().is_empty() {
            return Err(anyhow!("default_provider must not be empty"));
        }
        if self.merge.lock_poll_secs == 0 {
            return Err(anyhow!("merge.lock_poll_secs must be > 0"));
        }
        if self.merge.lock_stale_secs == 0 {
            return Err(anyhow!("merge.lock_stale_secs must be > 0"));
        }
        if self.merge.commit_retry_limit == 0 {
            return Err(anyhow!("merge.commit_retry_limit must be > 0"));
        }
        if self.merge.conflict_retry_limit == Some(0) {
            return Err(anyhow!("merge.conflict_retry_limit must be > 0 when set"));
        }
        for (name, provider) in &self.providers {
            if provider.command.is_empty() || provider.command[0].trim().is_empty() {
                return Err(anyhow!(
                    "providers.{name}.command must be a non-empty array"
                ));
            }
            if provider.timeout_secs == 0 {
                return Err(anyhow!("providers.{name}.timeout_secs must be > 0"));
            }
        }
        for (name, repo) in &self.repos {
            if repo.path.as_os_str().is_empty() {
                return Err(anyhow!("repos.{name}.path must be set"));
            }
        }
        Ok(())
    }

    /// Provider for a task: task override, then lane default, then the global default.
    pub fn provider_for<'a>(&'a self, task_override: Option<&'a str>, lane: &str) -> &'a str {
        task_override
            .or_else(|| {
                self.lanes
                    .get(lane)
                    .and_then(|lane| lane.provider.as_deref())
            })
            .unwrap_or(&self.default_provider)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ConductorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ConductorConfig> {
    if !path.exists() {
        let cfg = ConductorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ConductorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ConductorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
