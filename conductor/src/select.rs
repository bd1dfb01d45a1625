//! Read-only preview of what an identity would pick up next.

use anyhow::Result;

use crate::core::availability::{Pickup, find_available};
use crate::core::graph::TaskGraph;
use crate::io::task_store::TaskStore;
use crate::task::TaskStatus;

/// Structured selection outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Every task is `done`.
    Complete,
    /// Nothing is available to this identity right now.
    Idle,
    Available(SelectedTask),
}

/// Minimal selected task metadata for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedTask {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub pickup: Pickup,
    pub depth: usize,
}

/// Select from an in-memory graph without claiming anything.
pub fn select_task(graph: &TaskGraph, identity: &str) -> SelectOutcome {
    if let Some((task, pickup)) = find_available(graph, identity) {
        return SelectOutcome::Available(SelectedTask {
            id: task.id.clone(),
            title: task.title.clone(),
            status: task.status,
            pickup,
            depth: graph.depth(&task.id).unwrap_or_default(),
        });
    }
    if graph.preorder().all(|task| task.status == TaskStatus::Done) {
        SelectOutcome::Complete
    } else {
        SelectOutcome::Idle
    }
}

/// Load the task file and preview the selection for `identity`.
pub fn select_from_store(store: &TaskStore, identity: &str) -> Result<SelectOutcome> {
    let (_, graph) = store.load_graph()?;
    Ok(select_task(&graph, identity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{task, task_with_subtasks};

    fn graph(tasks: Vec<crate::task::Task>) -> TaskGraph {
        TaskGraph::from_tree(tasks).expect("graph")
    }

    #[test]
    fn select_returns_first_available_with_depth() {
        let mut done = task("setup");
        done.status = TaskStatus::Done;
        let graph = graph(vec![
            done,
            task_with_subtasks("epic", vec![task("leaf")]),
        ]);
        let SelectOutcome::Available(selected) = select_task(&graph, "lane-a") else {
            panic!("expected a task");
        };
        assert_eq!(selected.id, "epic");
        assert_eq!(selected.pickup, Pickup::Fresh);
        assert_eq!(selected.depth, 0);
    }

    #[test]
    fn select_skips_other_lanes_and_reports_idle() {
        let mut theirs = task("theirs");
        theirs.agent_name = Some("lane-b".to_string());
        let graph = graph(vec![theirs]);
        assert_eq!(select_task(&graph, "lane-a"), SelectOutcome::Idle);
    }

    #[test]
    fn select_returns_complete_when_everything_done() {
        let mut only = task("only");
        only.status = TaskStatus::Done;
        assert_eq!(select_task(&graph(vec![only]), "lane-a"), SelectOutcome::Complete);
    }
}
