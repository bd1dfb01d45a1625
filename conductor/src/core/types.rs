//! Shared contracts between the scheduler core and its collaborators.
//!
//! These types carry no behavior; they describe what crosses the agent and
//! workspace seams so the core can be tested without spawning processes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub system_prompt: String,
    pub prompt: String,
    /// Working directory the agent starts in.
    pub workdir: PathBuf,
    /// Session to resume, when continuing an earlier conversation.
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    /// Lane the invocation runs for.
    pub agent_name: Option<String>,
}

/// Outcome reported by an agent provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    /// Session token to resume this conversation later.
    pub session_id: Option<String>,
}

impl AgentResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            session_id: None,
        }
    }
}

/// Files reported by `git status`, grouped by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorktreeStatus {
    pub modified: Vec<String>,
    pub staged: Vec<String>,
    pub untracked: Vec<String>,
    pub conflicted: Vec<String>,
}

impl WorktreeStatus {
    pub fn is_clean(&self) -> bool {
        self.modified.is_empty()
            && self.staged.is_empty()
            && self.untracked.is_empty()
            && self.conflicted.is_empty()
    }

    /// Short human-readable summary, e.g. `2 modified, 1 untracked`.
    pub fn summary(&self) -> String {
        let parts: Vec<String> = [
            (self.modified.len(), "modified"),
            (self.staged.len(), "staged"),
            (self.untracked.len(), "untracked"),
            (self.conflicted.len(), "conflicted"),
        ]
        .into_iter()
        .filter(|(count, _)| *count > 0)
        .map(|(count, label)| format!("{count} {label}"))
        .collect();
        if parts.is_empty() {
            "clean".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Result of merging a branch into the checked-out target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Merged,
    Conflict { files: Vec<String> },
}

/// A `git worktree list` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    /// Short branch name; `None` for detached or bare entries.
    pub branch: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worktree_status_summary_lists_non_empty_groups() {
        let status = WorktreeStatus {
            modified: vec!["a".to_string(), "b".to_string()],
            untracked: vec!["c".to_string()],
            ..WorktreeStatus::default()
        };
        assert!(!status.is_clean());
        assert_eq!(status.summary(), "2 modified, 1 untracked");
        assert_eq!(WorktreeStatus::default().summary(), "clean");
    }
}
