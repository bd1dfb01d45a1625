//! Priming, checkpoint answers, orphan recovery and operator reset.

use std::collections::HashSet;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::context::RunContext;
use crate::core::status::{self, recover_orphans, reset_task, transition};
use crate::io::checkpoint::{Question, QuestionAction, QuestionMeta};
use crate::task::TaskStatus;

/// Question kind raised for checkpoint tasks.
pub const CHECKPOINT_KIND: &str = "checkpoint";

/// Identity recorded as the asker of checkpoint questions.
const PRIMING_AGENT: &str = "conductor";

/// What one priming pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimeReport {
    /// Task ids promoted from `todo` to `ready_for_agent`.
    pub promoted: Vec<String>,
    /// Question ids raised for checkpoint tasks.
    pub questions: Vec<String>,
    /// Question ids whose answers were applied.
    pub applied: Vec<String>,
}

/// Apply answered questions, promote ready tasks and raise checkpoint questions.
#[instrument(skip_all)]
pub fn prime(ctx: &RunContext) -> Result<PrimeReport> {
    let _priming = ctx.lock_priming()?;
    let mut report = PrimeReport::default();
    let questions = ctx.checkpoints.list()?;
    for question in questions.iter().filter(|q| q.is_actionable()) {
        apply_answer(ctx, question)?;
        report.applied.push(question.id.clone());
    }

    report.promoted = ctx
        .store
        .update(|graph, _| status::prime(graph, Utc::now()))?;
    if !report.promoted.is_empty() {
        info!(promoted = ?report.promoted, "primed tasks");
    }

    let pending: HashSet<&str> = questions
        .iter()
        .filter(|q| q.answer.is_none() || !q.applied)
        .filter(|q| !report.applied.contains(&q.id))
        .map(|q| q.meta.task_id.as_str())
        .collect();
    let (_, graph) = ctx.store.load_graph()?;
    for task in graph.preorder() {
        let waiting = task.checkpoint
            && task.status == TaskStatus::ReadyForAgent
            && graph.dependencies_done(task)
            && !pending.contains(task.id.as_str());
        if !waiting {
            continue;
        }
        let meta = QuestionMeta {
            task_id: task.id.clone(),
            kind: CHECKPOINT_KIND.to_string(),
            action: QuestionAction::SetStatus {
                yes: TaskStatus::Done,
                no: TaskStatus::Blocked,
            },
        };
        let id = ctx.checkpoints.ask(
            PRIMING_AGENT,
            &format!("Approve checkpoint '{}': {}?", task.id, task.title),
            meta,
        )?;
        info!(task_id = %task.id, question = %id, "raised checkpoint question");
        report.questions.push(id);
    }
    Ok(report)
}

/// Apply one answered question and mark it applied.
///
/// A vanished task or a transition the task no longer allows is logged and the
/// question is still retired, so it is never retried forever.
fn apply_answer(ctx: &RunContext, question: &Question) -> Result<()> {
    let Some(answer) = question.answer else {
        return Ok(());
    };
    let target = question.meta.action.status_for(answer);
    let task_id = &question.meta.task_id;
    let applied = ctx.store.update(|graph, _| {
        let Some(task) = graph.get_mut(task_id) else {
            return Ok(Err(anyhow!("task '{task_id}' not found")));
        };
        Ok(transition(task, target, Utc::now()))
    })?;
    match applied {
        Ok(()) => info!(task_id = %task_id, status = %target, question = %question.id, "applied answer"),
        Err(err) => warn!(question = %question.id, err = %err, "answer could not be applied"),
    }
    ctx.checkpoints.mark_applied(&question.id)
}

/// Answer a question and apply it right away.
pub fn answer(ctx: &RunContext, question_id: &str, yes: bool) -> Result<()> {
    let _priming = ctx.lock_priming()?;
    ctx.checkpoints.answer(question_id, yes)?;
    let question = ctx
        .checkpoints
        .get(question_id)?
        .ok_or_else(|| anyhow!("question '{question_id}' not found"))?;
    apply_answer(ctx, &question)
}

/// Return orphaned `in_progress` tasks of `lanes` (all lanes when empty) to the queue.
#[instrument(skip_all)]
pub fn recover(ctx: &RunContext, lanes: &[String]) -> Result<Vec<String>> {
    let recovered = ctx
        .store
        .update(|graph, _| Ok(recover_orphans(graph, lanes)))?;
    for id in &recovered {
        warn!(task_id = %id, "recovered orphaned task");
    }
    Ok(recovered)
}

/// Operator reset: back to `ready_for_agent` with no session and fresh retry counters.
pub fn reset(ctx: &RunContext, task_id: &str) -> Result<()> {
    ctx.store.update_task(task_id, reset_task)?;
    ctx.retries.clear(task_id)?;
    info!(task_id, "task reset");
    Ok(())
}
