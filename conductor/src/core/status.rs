//! Task status state machine plus the priming, recovery and reset passes.

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};

use crate::core::graph::TaskGraph;
use crate::task::{StepStatus, Task, TaskStatus};

/// True when the engine may move a task from `from` to `to`.
///
/// Operator resets are not transitions; see [`reset_task`].
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus as S;
    matches!(
        (from, to),
        (S::Todo, S::ReadyForAgent | S::Assigned | S::InProgress)
            | (
                S::ReadyForAgent,
                S::Assigned | S::InProgress | S::Blocked | S::Done
            )
            | (S::Assigned, S::InProgress | S::Blocked)
            | (S::InProgress, S::InProgress | S::DonePendingMerge | S::Blocked)
            | (S::DonePendingMerge, S::DonePendingMerge | S::Done | S::Blocked)
    )
}

/// Apply a status transition and stamp timestamps.
pub fn transition(task: &mut Task, to: TaskStatus, now: DateTime<Utc>) -> Result<()> {
    if !can_transition(task.status, to) {
        bail!(
            "task '{}': illegal status transition {} -> {}",
            task.id,
            task.status,
            to
        );
    }
    task.status = to;
    match to {
        TaskStatus::InProgress if task.started_at.is_none() => task.started_at = Some(now),
        TaskStatus::Done => task.completed_at = Some(now),
        _ => {}
    }
    Ok(())
}

/// Claim a task for `identity`: stamp the lane when unset and move it to `in_progress`.
pub fn claim(task: &mut Task, identity: &str, now: DateTime<Utc>) -> Result<()> {
    match task.agent_name.as_deref() {
        None => task.agent_name = Some(identity.to_string()),
        Some(owner) if owner == identity => {}
        Some(owner) => bail!("task '{}' is claimed by '{owner}'", task.id),
    }
    transition(task, TaskStatus::InProgress, now)
}

/// Promote dependency-satisfied `todo` tasks to `ready_for_agent`.
///
/// Returns promoted ids in traversal order. Checkpoint tasks are promoted too;
/// the caller raises their human question.
pub fn prime(graph: &mut TaskGraph, now: DateTime<Utc>) -> Result<Vec<String>> {
    let ready: Vec<String> = graph
        .preorder()
        .filter(|task| task.status == TaskStatus::Todo && graph.dependencies_done(task))
        .map(|task| task.id.clone())
        .collect();
    for id in &ready {
        let task = graph
            .get_mut(id)
            .ok_or_else(|| anyhow!("task '{id}' vanished while priming"))?;
        transition(task, TaskStatus::ReadyForAgent, now)?;
    }
    Ok(ready)
}

/// Return orphaned `in_progress` tasks to `ready_for_agent`.
///
/// Only tasks owned by one of `lanes` (or unowned) are touched; an empty filter
/// recovers every lane.
pub fn recover_orphans(graph: &mut TaskGraph, lanes: &[String]) -> Vec<String> {
    let orphaned: Vec<String> = graph
        .preorder()
        .filter(|task| task.status == TaskStatus::InProgress)
        .filter(|task| match task.agent_name.as_deref() {
            _ if lanes.is_empty() => true,
            None => true,
            Some(owner) => lanes.iter().any(|lane| lane == owner),
        })
        .map(|task| task.id.clone())
        .collect();
    for id in &orphaned {
        if let Some(task) = graph.get_mut(id) {
            task.status = TaskStatus::ReadyForAgent;
            reset_unfinished_steps(task);
        }
    }
    orphaned
}

/// Operator reset: any non-`done` task goes back to `ready_for_agent` with a fresh session.
pub fn reset_task(task: &mut Task) -> Result<()> {
    if task.status == TaskStatus::Done {
        bail!("task '{}' is done and cannot be reset", task.id);
    }
    task.status = TaskStatus::ReadyForAgent;
    task.clear_session();
    reset_unfinished_steps(task);
    Ok(())
}

fn reset_unfinished_steps(task: &mut Task) {
    for step in &mut task.steps {
        if step.status == StepStatus::InProgress {
            step.status = StepStatus::Todo;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{step, task};

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn transitions_follow_lifecycle() {
        use TaskStatus as S;
        assert!(can_transition(S::Todo, S::ReadyForAgent));
        assert!(can_transition(S::InProgress, S::DonePendingMerge));
        assert!(can_transition(S::DonePendingMerge, S::Done));
        assert!(can_transition(S::ReadyForAgent, S::Blocked));
        assert!(!can_transition(S::Done, S::InProgress));
        assert!(!can_transition(S::Blocked, S::InProgress));
        assert!(!can_transition(S::Todo, S::Done));
        assert!(!can_transition(S::InProgress, S::Done));
    }

    #[test]
    fn transition_stamps_timestamps_once() {
        let mut t = task("t");
        let first = now();
        transition(&mut t, TaskStatus::InProgress, first).expect("start");
        assert_eq!(t.started_at, Some(first));

        transition(&mut t, TaskStatus::InProgress, now()).expect("resume");
        assert_eq!(t.started_at, Some(first), "started_at is set once");

        transition(&mut t, TaskStatus::DonePendingMerge, now()).expect("dpm");
        assert!(t.completed_at.is_none());
        transition(&mut t, TaskStatus::Done, now()).expect("done");
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn claim_rejects_foreign_lane() {
        let mut t = task("t");
        claim(&mut t, "a", now()).expect("claim");
        assert_eq!(t.agent_name.as_deref(), Some("a"));
        assert_eq!(t.status, TaskStatus::InProgress);

        let mut other = task("o");
        other.agent_name = Some("a".to_string());
        let err = claim(&mut other, "b", now()).expect_err("foreign");
        assert!(err.to_string().contains("claimed by 'a'"));
    }

    #[test]
    fn prime_promotes_only_when_dependencies_done() {
        let mut dep = task("dep");
        dep.status = TaskStatus::DonePendingMerge;
        let mut waiting = task("waiting");
        waiting.depends_on = vec!["dep".to_string()];
        let free = task("free");
        let mut graph = TaskGraph::from_tree(vec![dep, waiting, free]).expect("graph");

        let primed = prime(&mut graph, now()).expect("prime");
        assert_eq!(primed, vec!["free".to_string()]);
        assert_eq!(
            graph.get("waiting").map(|t| t.status),
            Some(TaskStatus::Todo)
        );

        graph.get_mut("dep").expect("dep").status = TaskStatus::Done;
        let primed = prime(&mut graph, now()).expect("prime");
        assert_eq!(primed, vec!["waiting".to_string()]);
    }

    #[test]
    fn recovery_respects_lane_filter() {
        let mut mine = task("mine");
        mine.status = TaskStatus::InProgress;
        mine.agent_name = Some("a".to_string());
        mine.steps = vec![step("s1")];
        mine.steps[0].status = StepStatus::InProgress;
        let mut theirs = task("theirs");
        theirs.status = TaskStatus::InProgress;
        theirs.agent_name = Some("b".to_string());
        let mut graph = TaskGraph::from_tree(vec![mine, theirs]).expect("graph");

        let recovered = recover_orphans(&mut graph, &["a".to_string()]);
        assert_eq!(recovered, vec!["mine".to_string()]);
        let mine = graph.get("mine").expect("mine");
        assert_eq!(mine.status, TaskStatus::ReadyForAgent);
        assert_eq!(mine.steps[0].status, StepStatus::Todo);
        assert_eq!(
            graph.get("theirs").map(|t| t.status),
            Some(TaskStatus::InProgress)
        );

        let recovered = recover_orphans(&mut graph, &[]);
        assert_eq!(recovered, vec!["theirs".to_string()]);
    }

    #[test]
    fn reset_clears_session_and_refuses_done() {
        let mut t = task("t");
        t.status = TaskStatus::Blocked;
        t.session_id = Some("s".to_string());
        t.session_provider = Some("p".to_string());
        reset_task(&mut t).expect("reset");
        assert_eq!(t.status, TaskStatus::ReadyForAgent);
        assert!(t.session_id.is_none());
        assert!(t.session_provider.is_none());

        t.status = TaskStatus::Done;
        assert!(reset_task(&mut t).is_err());
    }
}
