//! The per-identity work loop.
//!
//! Each iteration claims the first available task (persisting the claim
//! before any work), materializes its workspace, drives the agent through the
//! task's steps and hands finished work to [`crate::merge`]. A single task's
//! failure never escapes an iteration; it becomes an [`IterationOutcome`].

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use tracing::{error, info, instrument, trace, warn};

use crate::context::RunContext;
use crate::core::availability::{Pickup, find_available};
use crate::core::events::LoopEvent;
use crate::core::session::FailureKind;
use crate::core::status::claim;
use crate::core::steps::{StepAdvance, advance, complete_step, first_open_step, start_step};
use crate::core::types::{AgentRequest, AgentResult};
use crate::io::agent::Agent;
use crate::io::task_store::TaskStore;
use crate::io::workspace::{RepoHandle, ensure_worktree, resolve_repo};
use crate::merge::{IntegrationOutcome, integrate};
use crate::prime::prime;
use crate::task::Task;

/// Result of one work-loop iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Nothing available for this identity.
    Idle,
    Completed { task_id: String },
    /// Left at `done_pending_merge` after a failed conflict resolution.
    PendingMerge { task_id: String, reason: String },
    /// The agent stopped before finishing its current step.
    StepsIncomplete { task_id: String, step_id: String },
    Failed { task_id: String, error: String },
    /// Merge lock wait timed out.
    Deferred { task_id: String, holder: String },
    CommitRetry { task_id: String, attempt: u32 },
    Blocked { task_id: String, reason: String },
}

impl IterationOutcome {
    pub fn task_id(&self) -> Option<&str> {
        match self {
            IterationOutcome::Idle => None,
            IterationOutcome::Completed { task_id }
            | IterationOutcome::PendingMerge { task_id, .. }
            | IterationOutcome::StepsIncomplete { task_id, .. }
            | IterationOutcome::Failed { task_id, .. }
            | IterationOutcome::Deferred { task_id, .. }
            | IterationOutcome::CommitRetry { task_id, .. }
            | IterationOutcome::Blocked { task_id, .. } => Some(task_id),
        }
    }

    /// Whether the loop should sleep before the next poll.
    fn wants_pause(&self) -> bool {
        matches!(
            self,
            IterationOutcome::Idle
                | IterationOutcome::Failed { .. }
                | IterationOutcome::Deferred { .. }
                | IterationOutcome::PendingMerge { .. }
        )
    }

    fn from_integration(task_id: String, outcome: IntegrationOutcome) -> Self {
        match outcome {
            IntegrationOutcome::Completed => IterationOutcome::Completed { task_id },
            IntegrationOutcome::PendingMerge { reason } => {
                IterationOutcome::PendingMerge { task_id, reason }
            }
            IntegrationOutcome::Deferred { holder } => IterationOutcome::Deferred { task_id, holder },
            IntegrationOutcome::CommitRetry { attempt } => {
                IterationOutcome::CommitRetry { task_id, attempt }
            }
            IntegrationOutcome::Blocked { reason } => IterationOutcome::Blocked { task_id, reason },
            IntegrationOutcome::Failed { error } => IterationOutcome::Failed { task_id, error },
        }
    }
}

/// Where a task's agent runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskWorkspace {
    pub workdir: PathBuf,
    /// `None` for tasks without a repository.
    pub repo: Option<RepoHandle>,
}

/// One claimed task being worked by one identity.
pub struct TaskRun {
    pub identity: String,
    pub task_id: String,
    pub provider: String,
    pub agent: Arc<dyn Agent>,
    pub workspace: TaskWorkspace,
    /// Session to resume; only ever one produced by `provider`.
    pub session: Option<String>,
}

impl TaskRun {
    /// Take over the session an invocation left behind.
    pub fn adopt(&mut self, invocation: &Invocation) {
        if invocation.corrupted.is_some() {
            self.session = None;
        } else if let Some(session) = &invocation.result.session_id {
            self.session = Some(session.clone());
        }
    }
}

/// A finished agent invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub result: AgentResult,
    /// Why the session must be discarded, when it must.
    pub corrupted: Option<String>,
}

/// Run the agent once. A provider that cannot start counts as a failed run.
pub fn invoke(
    ctx: &RunContext,
    run: &TaskRun,
    request: &AgentRequest,
    on_output: &mut dyn FnMut(&str),
) -> Invocation {
    let result = match run.agent.run(request, on_output) {
        Ok(result) => result,
        Err(err) => AgentResult::failure(format!("{err:#}")),
    };
    if result.success {
        return Invocation {
            result,
            corrupted: None,
        };
    }
    let corrupted = match ctx
        .detector
        .classify_failure(&result, request.session_id.is_some())
    {
        FailureKind::SessionCorrupted { reason } => {
            warn!(task_id = %run.task_id, reason = %reason, "discarding agent session");
            ctx.emit(
                &run.identity,
                LoopEvent::SessionCorrupted {
                    task_id: run.task_id.clone(),
                    reason: reason.clone(),
                },
            );
            Some(reason)
        }
        FailureKind::Ordinary => None,
    };
    Invocation { result, corrupted }
}

/// Store the run's session (or its absence) on the task.
pub fn persist_session(ctx: &RunContext, run: &TaskRun) -> Result<()> {
    ctx.store.update_task(&run.task_id, |task| {
        match &run.session {
            Some(session) => {
                task.session_id = Some(session.clone());
                task.session_provider = Some(run.provider.clone());
            }
            None => task.clear_session(),
        }
        Ok(())
    })
}

/// Claim and work the next available task for `identity`.
#[instrument(skip_all, fields(identity = %identity))]
pub fn run_iteration(ctx: &RunContext, identity: &str) -> Result<IterationOutcome> {
    let Some((task, pickup)) = claim_next(ctx, identity)? else {
        return Ok(IterationOutcome::Idle);
    };
    let task_id = task.id.clone();
    ctx.emit(
        identity,
        LoopEvent::TaskFound {
            task_id: task_id.clone(),
        },
    );
    info!(task_id = %task_id, ?pickup, "claimed task");

    let outcome = match work_task(ctx, identity, task, pickup) {
        Ok(outcome) => outcome,
        Err(err) => IterationOutcome::Failed {
            task_id,
            error: format!("{err:#}"),
        },
    };
    report(ctx, identity, &outcome);
    Ok(outcome)
}

/// Re-check availability and claim inside one store update.
fn claim_next(ctx: &RunContext, identity: &str) -> Result<Option<(Task, Pickup)>> {
    let (_, graph) = ctx.store.load_graph()?;
    if find_available(&graph, identity).is_none() {
        return Ok(None);
    }
    ctx.store.update(|graph, _| {
        let Some((task, pickup)) = find_available(graph, identity) else {
            return Ok(None);
        };
        let id = task.id.clone();
        let task = graph
            .get_mut(&id)
            .ok_or_else(|| anyhow!("task '{id}' vanished while claiming"))?;
        if pickup == Pickup::Fresh {
            claim(task, identity, Utc::now())?;
        }
        Ok(Some((task.clone(), pickup)))
    })
}

fn work_task(
    ctx: &RunContext,
    identity: &str,
    task: Task,
    pickup: Pickup,
) -> Result<IterationOutcome> {
    let workspace = prepare_workspace(ctx, identity, &task)?;
    let provider = ctx
        .config
        .provider_for(task.agent.as_deref(), identity)
        .to_string();
    let agent = ctx.agents.get(&provider)?;
    let session = task
        .session_id
        .clone()
        .filter(|_| task.session_provider.as_deref() == Some(provider.as_str()));
    let mut run = TaskRun {
        identity: identity.to_string(),
        task_id: task.id.clone(),
        provider,
        agent,
        workspace,
        session,
    };

    if pickup != Pickup::MergeOnly {
        ctx.emit(
            identity,
            LoopEvent::TaskStarted {
                task_id: task.id.clone(),
            },
        );
        if let Some(outcome) = drive_agent(ctx, &mut run, &task)? {
            return Ok(outcome);
        }
    }
    let outcome = integrate(ctx, &mut run)?;
    Ok(IterationOutcome::from_integration(task.id, outcome))
}

/// Resolve the working directory, pulling and creating worktrees as needed.
fn prepare_workspace(ctx: &RunContext, identity: &str, task: &Task) -> Result<TaskWorkspace> {
    let Some(repo_name) = task.repo.as_deref() else {
        return Ok(TaskWorkspace {
            workdir: ctx.paths.root.clone(),
            repo: None,
        });
    };
    let repo = resolve_repo(repo_name, &ctx.config, &ctx.paths)?;
    let workdir = if repo.literal {
        repo.root.clone()
    } else {
        let pulled = ctx
            .provisioner
            .pull_default_branch(&repo)
            .with_context(|| format!("pull default branch of {}", repo.name))?;
        if let Some(branch) = pulled {
            ctx.emit(
                identity,
                LoopEvent::GitPulled {
                    repo: repo.name.clone(),
                    branch,
                },
            );
        }
        match task.branch.as_deref() {
            Some(branch) => {
                let checkout = ensure_worktree(
                    ctx.provisioner.as_ref(),
                    &repo,
                    branch,
                    task.base_branch.as_deref(),
                )?;
                if checkout.created {
                    ctx.emit(
                        identity,
                        LoopEvent::WorktreeCreated {
                            task_id: task.id.clone(),
                            branch: branch.to_string(),
                            path: checkout.path.display().to_string(),
                        },
                    );
                }
                checkout.path
            }
            None => repo.root.clone(),
        }
    };
    if !workdir.is_dir() {
        bail!("working directory {} does not exist", workdir.display());
    }
    Ok(TaskWorkspace {
        workdir,
        repo: Some(repo),
    })
}

/// Run the agent until the task (or every step) is done.
///
/// `Some` ends the iteration early; `None` means integration should follow.
fn drive_agent(
    ctx: &RunContext,
    run: &mut TaskRun,
    task: &Task,
) -> Result<Option<IterationOutcome>> {
    let workdir = run.workspace.workdir.clone();
    let system_prompt = ctx
        .prompts
        .system(&run.identity, task, &workdir, task.branch.as_deref())?;

    let mut current = first_open_step(task).map(|step| step.id.clone());
    let mut prompt = match &current {
        Some(step_id) => {
            let task = begin_step(ctx, run, step_id)?;
            ctx.prompts.task(&task, task.step(step_id))?
        }
        // Every step is already recorded done; only integration is left.
        None if !task.steps.is_empty() => return Ok(None),
        None => ctx.prompts.task(task, None)?,
    };

    loop {
        let request = AgentRequest {
            system_prompt: system_prompt.clone(),
            prompt,
            workdir: workdir.clone(),
            session_id: run.session.clone(),
            task_id: Some(run.task_id.clone()),
            agent_name: Some(run.identity.clone()),
        };
        let invocation = invoke(ctx, run, &request, &mut |line| trace!(line, "agent output"));
        run.adopt(&invocation);
        persist_session(ctx, run)?;

        if !invocation.result.success {
            let error = invocation
                .result
                .error
                .unwrap_or_else(|| "agent reported failure".to_string());
            return Ok(Some(IterationOutcome::Failed {
                task_id: run.task_id.clone(),
                error,
            }));
        }

        let Some(worked) = current.take() else {
            return Ok(None);
        };
        let task = ctx.store.task(&run.task_id)?;
        match advance(&task, &worked) {
            StepAdvance::AllDone { completed } => {
                for step_id in &completed {
                    step_completed(ctx, run, step_id);
                }
                return Ok(None);
            }
            StepAdvance::Stalled { step } => {
                info!(task_id = %run.task_id, step = %step, "agent stopped before finishing the step");
                return Ok(Some(IterationOutcome::StepsIncomplete {
                    task_id: run.task_id.clone(),
                    step_id: step,
                }));
            }
            StepAdvance::Advanced { completed, next } => {
                for step_id in &completed {
                    step_completed(ctx, run, step_id);
                }
                let task = begin_step(ctx, run, &next)?;
                let next_step = task
                    .step(&next)
                    .ok_or_else(|| anyhow!("task '{}' lost step '{next}'", run.task_id))?;
                let last = completed.last().map_or(worked.as_str(), String::as_str);
                prompt = ctx.prompts.continuation(&task, last, next_step)?;
                current = Some(next);
            }
        }
    }
}

fn begin_step(ctx: &RunContext, run: &TaskRun, step_id: &str) -> Result<Task> {
    let task = ctx.store.update_task(&run.task_id, |task| {
        start_step(task, step_id, Utc::now())?;
        Ok(task.clone())
    })?;
    ctx.emit(
        &run.identity,
        LoopEvent::StepStarted {
            task_id: run.task_id.clone(),
            step_id: step_id.to_string(),
        },
    );
    Ok(task)
}

fn step_completed(ctx: &RunContext, run: &TaskRun, step_id: &str) {
    ctx.emit(
        &run.identity,
        LoopEvent::StepCompleted {
            task_id: run.task_id.clone(),
            step_id: step_id.to_string(),
        },
    );
}

fn report(ctx: &RunContext, identity: &str, outcome: &IterationOutcome) {
    let event = match outcome {
        IterationOutcome::Completed { task_id } => {
            info!(task_id = %task_id, "task completed");
            LoopEvent::TaskCompleted {
                task_id: task_id.clone(),
            }
        }
        IterationOutcome::Failed { task_id, error }
        | IterationOutcome::PendingMerge {
            task_id,
            reason: error,
        } => {
            warn!(task_id = %task_id, error = %error, "task failed this round");
            LoopEvent::TaskFailed {
                task_id: task_id.clone(),
                error: error.clone(),
            }
        }
        IterationOutcome::Blocked { task_id, reason } => {
            warn!(task_id = %task_id, reason = %reason, "task blocked");
            LoopEvent::TaskBlocked {
                task_id: task_id.clone(),
                reason: reason.clone(),
            }
        }
        IterationOutcome::Deferred { task_id, holder } => {
            info!(task_id = %task_id, holder = %holder, "merge deferred, lock busy");
            return;
        }
        IterationOutcome::Idle
        | IterationOutcome::StepsIncomplete { .. }
        | IterationOutcome::CommitRetry { .. } => return,
    };
    ctx.emit(identity, event);
}

/// Record a step as done on behalf of the agent working it.
pub fn record_step_done(store: &TaskStore, task_id: &str, step_id: &str) -> Result<Task> {
    store.update_task(task_id, |task| {
        complete_step(task, step_id, Utc::now())?;
        Ok(task.clone())
    })
}

/// Bounds for [`run_loop`]; the default runs forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopLimits {
    pub max_iterations: Option<u32>,
    /// Return as soon as an iteration finds nothing to do.
    pub until_idle: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub iterations: u32,
    pub completed: u32,
    pub errors: u32,
}

/// Prime, iterate and sleep, forever or until `limits` say stop.
///
/// Iteration errors are logged and followed by a poll-interval sleep; they
/// never end the loop.
pub fn run_loop(
    ctx: &RunContext,
    identity: &str,
    limits: LoopLimits,
    mut on_iteration: impl FnMut(&IterationOutcome),
) -> LoopSummary {
    let mut summary = LoopSummary::default();
    loop {
        if let Err(err) = prime(ctx) {
            warn!(identity, err = %format!("{err:#}"), "priming pass failed");
        }
        let pause = match run_iteration(ctx, identity) {
            Ok(outcome) => {
                on_iteration(&outcome);
                if matches!(outcome, IterationOutcome::Completed { .. }) {
                    summary.completed += 1;
                }
                if outcome == IterationOutcome::Idle && limits.until_idle {
                    return summary;
                }
                outcome.wants_pause()
            }
            Err(err) => {
                error!(identity, err = %format!("{err:#}"), "iteration failed");
                summary.errors += 1;
                true
            }
        };
        summary.iterations += 1;
        if limits
            .max_iterations
            .is_some_and(|max| summary.iterations >= max)
        {
            return summary;
        }
        if pause {
            thread::sleep(ctx.config.poll_interval());
        }
    }
}
