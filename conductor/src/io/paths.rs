//! Canonical locations of conductor-owned files.

use std::path::{Path, PathBuf};

use crate::io::config::ConductorConfig;

/// All paths derived from a workspace root and its configuration.
#[derive(Debug, Clone)]
pub struct ConductorPaths {
    pub root: PathBuf,
    pub tasks_path: PathBuf,
    pub state_dir: PathBuf,
    pub retries_path: PathBuf,
    pub locks_dir: PathBuf,
    pub questions_dir: PathBuf,
    pub worktrees_dir: PathBuf,
}

impl ConductorPaths {
    pub fn new(root: impl Into<PathBuf>, config: &ConductorConfig) -> Self {
        let root = root.into();
        let tasks_path = resolve(&root, &config.tasks_file);
        let state_dir = resolve(&root, &config.state_dir);
        Self {
            tasks_path,
            retries_path: state_dir.join("state").join("retries.json"),
            locks_dir: state_dir.join("locks"),
            questions_dir: state_dir.join("questions"),
            worktrees_dir: state_dir.join("worktrees"),
            state_dir,
            root,
        }
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
