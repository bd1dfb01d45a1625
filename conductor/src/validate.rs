//! Validation of the configuration and task file as a pair.
//!
//! Loading already enforces the task schema and the structural invariants; this
//! adds the cross-checks that need both documents, such as every task's repo
//! and provider resolving against the configuration.

use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::io::config::{ConductorConfig, load_config};
use crate::io::paths::ConductorPaths;
use crate::io::task_store::TaskStore;
use crate::io::workspace::is_literal_path;

/// High-level validation outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateOutcome {
    pub tasks: usize,
    pub checkpoints: usize,
}

/// Load `conductor.toml` (defaults when missing) and the task file, then cross-check them.
pub fn validate_workspace(root: &Path, config_path: &Path) -> Result<ValidateOutcome> {
    let config = load_config(config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;
    let paths = ConductorPaths::new(root, &config);
    validate_against(&config, &TaskStore::new(&paths.tasks_path))
}

/// Cross-check a loaded configuration against the task store.
pub fn validate_against(config: &ConductorConfig, store: &TaskStore) -> Result<ValidateOutcome> {
    config.validate()?;
    let (_, graph) = store.load_graph()?;

    let mut problems = Vec::new();
    if !config.providers.is_empty() && !config.providers.contains_key(&config.default_provider) {
        problems.push(format!(
            "default_provider '{}' is not a configured provider",
            config.default_provider
        ));
    }
    for (lane, lane_config) in &config.lanes {
        if let Some(provider) = lane_config.provider.as_deref()
            && !config.providers.contains_key(provider)
        {
            problems.push(format!("lanes.{lane}.provider '{provider}' is not configured"));
        }
    }

    let mut checkpoints = 0;
    for task in graph.preorder() {
        if task.checkpoint {
            checkpoints += 1;
        }
        if let Some(repo) = task.repo.as_deref()
            && !is_literal_path(repo)
            && !config.repos.contains_key(repo)
        {
            problems.push(format!("task '{}': repo '{repo}' is not configured", task.id));
        }
        if let Some(provider) = task.agent.as_deref()
            && !config.providers.contains_key(provider)
        {
            problems.push(format!(
                "task '{}': provider '{provider}' is not configured",
                task.id
            ));
        }
    }

    if !problems.is_empty() {
        bail!("invalid workspace:\n  {}", problems.join("\n  "));
    }
    Ok(ValidateOutcome {
        tasks: graph.len(),
        checkpoints,
    })
}
