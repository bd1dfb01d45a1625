//! Per-task step state machine.
//!
//! Steps are worked strictly in order. The agent records a step as done
//! out-of-band (`conductor step-done`); after each agent run the work loop
//! reloads the task and asks [`advance`] what happened.

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};

use crate::task::{Step, StepStatus, Task};

/// What the work loop should do after an agent run on a stepped task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAdvance {
    /// Every step is done; `completed` lists the steps this run finished, in order.
    AllDone { completed: Vec<String> },
    /// `completed` finished (one run may finish several) and `next` is the new
    /// first open step.
    Advanced { completed: Vec<String>, next: String },
    /// The worked step is still the first open step: the agent ran out of turns.
    Stalled { step: String },
}

pub fn first_open_step(task: &Task) -> Option<&Step> {
    task.steps.iter().find(|step| step.status != StepStatus::Done)
}

/// Steps already done, in order; these are the only ones shown as prior context.
pub fn done_steps(task: &Task) -> Vec<&Step> {
    task.steps
        .iter()
        .filter(|step| step.status == StepStatus::Done)
        .collect()
}

/// Mark a step as started, stamping `started_at` on first entry.
pub fn start_step(task: &mut Task, step_id: &str, now: DateTime<Utc>) -> Result<()> {
    let task_id = task.id.clone();
    let step = task
        .step_mut(step_id)
        .ok_or_else(|| anyhow!("task '{task_id}' has no step '{step_id}'"))?;
    match step.status {
        StepStatus::Done => bail!("task '{task_id}' step '{step_id}' is already done"),
        StepStatus::InProgress => {}
        StepStatus::Todo => {
            step.status = StepStatus::InProgress;
            if step.started_at.is_none() {
                step.started_at = Some(now);
            }
        }
    }
    Ok(())
}

/// Mark a step as done. Earlier steps must already be done.
pub fn complete_step(task: &mut Task, step_id: &str, now: DateTime<Utc>) -> Result<()> {
    let task_id = task.id.clone();
    let position = task
        .steps
        .iter()
        .position(|step| step.id == step_id)
        .ok_or_else(|| anyhow!("task '{task_id}' has no step '{step_id}'"))?;
    if let Some(open) = task.steps[..position]
        .iter()
        .find(|step| step.status != StepStatus::Done)
    {
        bail!(
            "task '{task_id}': step '{}' must be done before '{step_id}'",
            open.id
        );
    }
    let step = &mut task.steps[position];
    if step.status == StepStatus::Done {
        return Ok(());
    }
    step.status = StepStatus::Done;
    step.started_at.get_or_insert(now);
    step.completed_at = Some(now);
    Ok(())
}

/// Decide how to continue after the agent worked on `worked_step`.
pub fn advance(task: &Task, worked_step: &str) -> StepAdvance {
    let open = first_open_step(task);
    if let Some(open) = open
        && open.id == worked_step
    {
        return StepAdvance::Stalled {
            step: worked_step.to_string(),
        };
    }
    let from = task
        .steps
        .iter()
        .position(|step| step.id == worked_step)
        .unwrap_or(0);
    let completed = task.steps[from..]
        .iter()
        .take_while(|step| step.status == StepStatus::Done)
        .map(|step| step.id.clone())
        .collect();
    match open {
        None => StepAdvance::AllDone { completed },
        Some(open) => StepAdvance::Advanced {
            completed,
            next: open.id.clone(),
        },
    }
}
