//! Explicit run context shared by every command and work loop.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::core::events::{EventSink, LoopEvent};
use crate::core::session::CorruptionDetector;
use crate::io::agent::AgentRegistry;
use crate::io::checkpoint::{CheckpointQueue, FileCheckpointQueue};
use crate::io::config::{ConductorConfig, load_config};
use crate::io::merge_lock::MergeLock;
use crate::io::paths::ConductorPaths;
use crate::io::prompt::Prompts;
use crate::io::retries::RetryStore;
use crate::io::task_store::TaskStore;
use crate::io::workspace::{GitProvisioner, Provisioner, RepoHandle};
use crate::logging::TracingSink;

/// Configuration file looked up under the workspace root.
pub const CONFIG_FILE: &str = "conductor.toml";

/// Everything an operation needs; there is no process-wide state.
pub struct RunContext {
    pub paths: ConductorPaths,
    pub config: ConductorConfig,
    pub store: TaskStore,
    pub retries: RetryStore,
    pub agents: AgentRegistry,
    pub provisioner: Arc<dyn Provisioner>,
    pub checkpoints: Arc<dyn CheckpointQueue>,
    pub events: Arc<dyn EventSink>,
    pub detector: CorruptionDetector,
    pub prompts: Prompts,
    /// Serializes priming passes of the loops sharing this context.
    prime_lock: Mutex<()>,
}

impl RunContext {
    pub fn new(
        root: &Path,
        config: ConductorConfig,
        agents: AgentRegistry,
        provisioner: Arc<dyn Provisioner>,
        checkpoints: Arc<dyn CheckpointQueue>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        let paths = ConductorPaths::new(root, &config);
        let detector = CorruptionDetector::new(&config.session.corruption_patterns)
            .context("compile session corruption patterns")?;
        Ok(Self {
            store: TaskStore::new(&paths.tasks_path),
            retries: RetryStore::new(&paths.retries_path),
            agents,
            provisioner,
            checkpoints,
            events,
            detector,
            prompts: Prompts::new()?,
            prime_lock: Mutex::new(()),
            config,
            paths,
        })
    }

    /// Production wiring: config from `config_path` (default `<root>/conductor.toml`),
    /// command providers, the git provisioner and file-backed questions.
    pub fn from_root(root: &Path, config_path: Option<&Path>) -> Result<Self> {
        let default_config = root.join(CONFIG_FILE);
        let config_path = config_path.unwrap_or(&default_config);
        let config = load_config(config_path)?;
        let agents = AgentRegistry::from_config(&config, root)?;
        let questions_dir = ConductorPaths::new(root, &config).questions_dir;
        Self::new(
            root,
            config,
            agents,
            Arc::new(GitProvisioner),
            Arc::new(FileCheckpointQueue::new(questions_dir)),
            Arc::new(TracingSink),
        )
    }

    pub fn emit(&self, agent: &str, event: LoopEvent) {
        self.events.emit(agent, &event);
    }

    /// Held for a whole priming pass so one checkpoint is asked once.
    pub fn lock_priming(&self) -> Result<MutexGuard<'_, ()>> {
        self.prime_lock
            .lock()
            .map_err(|_| anyhow!("priming lock poisoned"))
    }

    pub fn merge_lock(&self, repo: &RepoHandle, target: &str) -> MergeLock {
        MergeLock::new(
            &self.paths.locks_dir,
            &repo.lock_key(),
            target,
            Duration::from_secs(self.config.merge.lock_stale_secs),
        )
    }
}
