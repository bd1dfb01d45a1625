//! Lifecycle events emitted by the work loop.
//!
//! Events are a rendering feed (logs, dashboards), not a protocol: sinks must
//! not influence scheduling.

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    TaskFound { task_id: String },
    TaskStarted { task_id: String },
    TaskCompleted { task_id: String },
    TaskFailed { task_id: String, error: String },
    TaskBlocked { task_id: String, reason: String },
    StepStarted { task_id: String, step_id: String },
    StepCompleted { task_id: String, step_id: String },
    WorktreeCreated { task_id: String, branch: String, path: String },
    GitPulled { repo: String, branch: String },
    MergeWaiting { task_id: String, target: String, holder: String, waited: Duration },
    MergeConflictResolving { task_id: String, target: String, files: Vec<String> },
    MergeConflictResolved { task_id: String, target: String },
    SessionCorrupted { task_id: String, reason: String },
    CommitRetry { task_id: String, attempt: u32, limit: u32 },
}

impl LoopEvent {
    pub fn task_id(&self) -> Option<&str> {
        match self {
            LoopEvent::GitPulled { .. } => None,
            LoopEvent::TaskFound { task_id }
            | LoopEvent::TaskStarted { task_id }
            | LoopEvent::TaskCompleted { task_id }
            | LoopEvent::TaskFailed { task_id, .. }
            | LoopEvent::TaskBlocked { task_id, .. }
            | LoopEvent::StepStarted { task_id, .. }
            | LoopEvent::StepCompleted { task_id, .. }
            | LoopEvent::WorktreeCreated { task_id, .. }
            | LoopEvent::MergeWaiting { task_id, .. }
            | LoopEvent::MergeConflictResolving { task_id, .. }
            | LoopEvent::MergeConflictResolved { task_id, .. }
            | LoopEvent::SessionCorrupted { task_id, .. }
            | LoopEvent::CommitRetry { task_id, .. } => Some(task_id),
        }
    }
}

impl fmt::Display for LoopEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopEvent::TaskFound { task_id } => write!(f, "found task {task_id}"),
            LoopEvent::TaskStarted { task_id } => write!(f, "started task {task_id}"),
            LoopEvent::TaskCompleted { task_id } => write!(f, "completed task {task_id}"),
            LoopEvent::TaskFailed { task_id, error } => {
                write!(f, "task {task_id} failed: {error}")
            }
            LoopEvent::TaskBlocked { task_id, reason } => {
                write!(f, "task {task_id} blocked: {reason}")
            }
            LoopEvent::StepStarted { task_id, step_id } => {
                write!(f, "task {task_id} step {step_id} started")
            }
            LoopEvent::StepCompleted { task_id, step_id } => {
                write!(f, "task {task_id} step {step_id} completed")
            }
            LoopEvent::WorktreeCreated { branch, path, .. } => {
                write!(f, "created worktree for {branch} at {path}")
            }
            LoopEvent::GitPulled { repo, branch } => write!(f, "pulled {repo} {branch}"),
            LoopEvent::MergeWaiting {
                target,
                holder,
                waited,
                ..
            } => write!(
                f,
                "waiting for merge lock on {target} held by {holder} ({}s)",
                waited.as_secs()
            ),
            LoopEvent::MergeConflictResolving { task_id, target, files } => write!(
                f,
                "task {task_id}: resolving {} conflicted file(s) merging into {target}",
                files.len()
            ),
            LoopEvent::MergeConflictResolved { task_id, target } => {
                write!(f, "task {task_id}: conflict into {target} resolved")
            }
            LoopEvent::SessionCorrupted { task_id, reason } => {
                write!(f, "task {task_id}: session discarded ({reason})")
            }
            LoopEvent::CommitRetry {
                task_id,
                attempt,
                limit,
            } => write!(f, "task {task_id}: uncommitted work, retry {attempt}/{limit}"),
        }
    }
}

/// Receives lifecycle events from one or more work loops.
pub trait EventSink: Send + Sync {
    fn emit(&self, agent: &str, event: &LoopEvent);
}
