//! Which task a scheduling identity should pick up next.

use crate::core::graph::TaskGraph;
use crate::task::{Task, TaskStatus};

/// How the selected task should be entered by the work loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pickup {
    /// Unclaimed (or lane-assigned) work that has not started.
    Fresh,
    /// Work this identity already claimed; resume the agent.
    Resume,
    /// The agent already finished; retry integration only.
    MergeOnly,
}

/// Return the first available task for `identity` in pre-order, with how to enter it.
///
/// A task is available when all dependencies are exactly `done`, it is not a
/// checkpoint, no other identity claims it, and its status is either
/// `todo`/`ready_for_agent`, or `assigned`/`in_progress`/`done_pending_merge`
/// already claimed by `identity`.
pub fn find_available<'a>(graph: &'a TaskGraph, identity: &str) -> Option<(&'a Task, Pickup)> {
    graph.preorder().find_map(|task| {
        let pickup = pickup_for(task, identity)?;
        if !graph.dependencies_done(task) {
            return None;
        }
        Some((task, pickup))
    })
}

fn pickup_for(task: &Task, identity: &str) -> Option<Pickup> {
    if task.checkpoint {
        return None;
    }
    let claimed_by_self = match task.agent_name.as_deref() {
        None => false,
        Some(owner) if owner == identity => true,
        Some(_) => return None,
    };
    match task.status {
        TaskStatus::Todo | TaskStatus::ReadyForAgent => Some(Pickup::Fresh),
        TaskStatus::Assigned if claimed_by_self => Some(Pickup::Fresh),
        TaskStatus::InProgress if claimed_by_self => Some(Pickup::Resume),
        TaskStatus::DonePendingMerge if claimed_by_self => Some(Pickup::MergeOnly),
        _ => None,
    }
}
