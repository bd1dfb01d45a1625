//! Post-task integration.
//!
//! After the agent finishes a task with a git destination the coordinator
//! verifies the work is committed, marks the task `done_pending_merge`, pushes
//! the branch when configured and then either opens a pull request, merges
//! into the target under the merge lock, or finishes directly. Conflicts are
//! handed back to the agent inside the target checkout.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::context::RunContext;
use crate::core::events::LoopEvent;
use crate::core::status::transition;
use crate::core::types::{AgentRequest, MergeResult};
use crate::io::merge_lock::LockAttempt;
use crate::io::retries::RetryKind;
use crate::io::workspace::{PullRequest, RepoHandle, cleanup_merged_branches, ensure_worktree};
use crate::scheduler::{TaskRun, invoke, persist_session};
use crate::task::{GitConfig, Task, TaskStatus};

/// How an integration attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationOutcome {
    Completed,
    /// Conflict resolution failed; the task waits at `done_pending_merge`.
    PendingMerge { reason: String },
    /// The merge lock stayed busy; a later pass retries.
    Deferred { holder: String },
    /// Work was left uncommitted; the next pass starts a fresh session.
    CommitRetry { attempt: u32 },
    Blocked { reason: String },
    /// Push or target checkout trouble; the task is retried merge-only.
    Failed { error: String },
}

/// Integrate a task whose agent work is finished.
#[instrument(skip_all, fields(task_id = %run.task_id, identity = %run.identity))]
pub fn integrate(ctx: &RunContext, run: &mut TaskRun) -> Result<IntegrationOutcome> {
    let (git, graph) = ctx.store.load_graph()?;
    let task = graph
        .get(&run.task_id)
        .cloned()
        .with_context(|| format!("task '{}' not found", run.task_id))?;

    let (Some(repo), Some(branch)) = (run.workspace.repo.clone(), task.branch.clone()) else {
        debug!("no git destination, finishing");
        finish(ctx, &task.id, None)?;
        return Ok(IntegrationOutcome::Completed);
    };

    if let Some(outcome) = verify_committed(ctx, run, &task)? {
        return Ok(outcome);
    }

    ctx.store.update_task(&task.id, |t| {
        if t.status != TaskStatus::DonePendingMerge {
            transition(t, TaskStatus::DonePendingMerge, Utc::now())?;
        }
        Ok(())
    })?;

    if git.push_to_remote
        && let Err(err) = ctx
            .provisioner
            .push_branch(&repo, &run.workspace.workdir, &branch)
    {
        return Ok(IntegrationOutcome::Failed {
            error: format!("push {branch}: {err:#}"),
        });
    }

    if task.open_pr {
        return open_pull_request(ctx, run, &task, &repo, &branch);
    }
    match task.distinct_merge_target() {
        Some(target) => locked_merge(ctx, run, &task, &git, &repo, &branch, target),
        None => {
            finish(ctx, &task.id, None)?;
            Ok(IntegrationOutcome::Completed)
        }
    }
}

/// `None` when the worktree is clean, possibly after one commit-resume.
fn verify_committed(
    ctx: &RunContext,
    run: &mut TaskRun,
    task: &Task,
) -> Result<Option<IntegrationOutcome>> {
    let workdir = run.workspace.workdir.clone();
    let status = ctx.provisioner.worktree_status(&workdir)?;
    if status.is_clean() {
        ctx.retries.reset(&task.id, RetryKind::Commit)?;
        return Ok(None);
    }

    info!(changes = %status.summary(), "uncommitted work, asking the agent to commit");
    let request = AgentRequest {
        system_prompt: ctx
            .prompts
            .system(&run.identity, task, &workdir, task.branch.as_deref())?,
        prompt: ctx.prompts.commit(task, &status)?,
        workdir: workdir.clone(),
        session_id: run.session.clone(),
        task_id: Some(task.id.clone()),
        agent_name: Some(run.identity.clone()),
    };
    let invocation = invoke(ctx, run, &request, &mut |_| {});
    run.adopt(&invocation);
    persist_session(ctx, run)?;

    let status = ctx.provisioner.worktree_status(&workdir)?;
    if status.is_clean() {
        ctx.retries.reset(&task.id, RetryKind::Commit)?;
        return Ok(None);
    }

    let limit = ctx.config.merge.commit_retry_limit;
    let attempt = ctx.retries.increment(&task.id, RetryKind::Commit)?;
    ctx.emit(
        &run.identity,
        LoopEvent::CommitRetry {
            task_id: task.id.clone(),
            attempt,
            limit,
        },
    );
    run.session = None;

    if attempt >= limit {
        let reason = format!(
            "uncommitted changes after {attempt} commit attempts ({})",
            status.summary()
        );
        ctx.store.update_task(&task.id, |t| {
            transition(t, TaskStatus::Blocked, Utc::now())?;
            t.clear_session();
            t.append_note(format!("blocked: {reason}"));
            Ok(())
        })?;
        ctx.retries.reset(&task.id, RetryKind::Commit)?;
        warn!(attempt, limit, "commit retries exhausted");
        return Ok(Some(IntegrationOutcome::Blocked { reason }));
    }

    ctx.store.update_task(&task.id, |t| {
        t.clear_session();
        t.append_note(format!(
            "commit retry {attempt}/{limit}: uncommitted changes ({})",
            status.summary()
        ));
        Ok(())
    })?;
    Ok(Some(IntegrationOutcome::CommitRetry { attempt }))
}

/// Tried once; the task is done whether or not the pull request was created.
fn open_pull_request(
    ctx: &RunContext,
    run: &TaskRun,
    task: &Task,
    repo: &RepoHandle,
    branch: &str,
) -> Result<IntegrationOutcome> {
    let base = match task.distinct_merge_target() {
        Some(target) => target.to_string(),
        None => ctx.provisioner.default_branch(repo)?,
    };
    let request = PullRequest {
        head: branch.to_string(),
        base,
        title: task.title.clone(),
        body: pull_request_body(task),
    };
    let note = match ctx
        .provisioner
        .create_pull_request(repo, &run.workspace.workdir, &request)
    {
        Ok(url) => format!("pull request: {url}"),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "pull request creation failed");
            format!("pull request into {} not created: {err:#}", request.base)
        }
    };
    finish(ctx, &task.id, Some(note))?;
    Ok(IntegrationOutcome::Completed)
}

fn pull_request_body(task: &Task) -> String {
    let mut body = task.instructions.trim().to_string();
    if !task.acceptance_criteria.is_empty() {
        if !body.is_empty() {
            body.push_str("\n\n");
        }
        body.push_str("Acceptance criteria:\n");
        for item in &task.acceptance_criteria {
            body.push_str(&format!("- {item}\n"));
        }
    }
    if body.is_empty() {
        body = format!("Task {}", task.id);
    }
    body
}

#[instrument(skip_all, fields(source = %source, target = %target))]
fn locked_merge(
    ctx: &RunContext,
    run: &mut TaskRun,
    task: &Task,
    git: &GitConfig,
    repo: &RepoHandle,
    source: &str,
    target: &str,
) -> Result<IntegrationOutcome> {
    let merge = &ctx.config.merge;
    let lock = ctx.merge_lock(repo, target);
    let attempt = lock.acquire_with_wait(
        &run.identity,
        source,
        Duration::from_secs(merge.lock_wait_secs),
        Duration::from_secs(merge.lock_poll_secs),
        &mut |holder, waited| {
            ctx.emit(
                &run.identity,
                LoopEvent::MergeWaiting {
                    task_id: task.id.clone(),
                    target: target.to_string(),
                    holder: holder.to_string(),
                    waited,
                },
            );
        },
    )?;
    let mut guard = match attempt {
        LockAttempt::Acquired(guard) => guard,
        LockAttempt::TimedOut { holder } => {
            ctx.store.update_task(&task.id, |t| {
                t.append_note(format!("merge into {target} deferred: lock held by {holder}"));
                Ok(())
            })?;
            return Ok(IntegrationOutcome::Deferred { holder });
        }
    };

    let outcome = guard.hold_while(|| merge_under_lock(ctx, run, task, git, repo, source, target))?;
    guard.release()?;
    if outcome == IntegrationOutcome::Completed {
        info!("merged");
    }
    Ok(outcome)
}

/// The merge itself; the caller holds the lock for (repo, target).
fn merge_under_lock(
    ctx: &RunContext,
    run: &mut TaskRun,
    task: &Task,
    git: &GitConfig,
    repo: &RepoHandle,
    source: &str,
    target: &str,
) -> Result<IntegrationOutcome> {
    let checkout = ensure_worktree(ctx.provisioner.as_ref(), repo, target, None)?;
    let target_status = ctx.provisioner.worktree_status(&checkout.path)?;
    if !target_status.is_clean() {
        return Ok(IntegrationOutcome::Failed {
            error: format!(
                "target checkout {} is not clean ({})",
                checkout.path.display(),
                target_status.summary()
            ),
        });
    }

    let mut resolved_conflict = false;
    if let MergeResult::Conflict { files } = ctx.provisioner.merge_branch(&checkout.path, source)? {
        let escalation = Escalation {
            task,
            source,
            target,
            workdir: &checkout.path,
            files: &files,
        };
        if let Some(outcome) = resolve_conflict(ctx, run, &escalation)? {
            return Ok(outcome);
        }
        resolved_conflict = true;
    }

    if git.push_to_remote
        && ctx.config.merge.push_target
        && let Err(err) = ctx.provisioner.push_branch(repo, &checkout.path, target)
    {
        return Ok(IntegrationOutcome::Failed {
            error: format!("push {target}: {err:#}"),
        });
    }

    finish(ctx, &task.id, None)?;
    if resolved_conflict {
        ctx.emit(
            &run.identity,
            LoopEvent::MergeConflictResolved {
                task_id: task.id.clone(),
                target: target.to_string(),
            },
        );
    }
    if git.auto_cleanup_merged {
        match cleanup_merged_branches(ctx.provisioner.as_ref(), repo, target) {
            Ok(deleted) => debug!(?deleted, "cleaned up merged branches"),
            Err(err) => warn!(err = %format!("{err:#}"), "cleanup of merged branches failed"),
        }
    }
    Ok(IntegrationOutcome::Completed)
}

#[derive(Clone, Copy)]
struct Escalation<'a> {
    task: &'a Task,
    source: &'a str,
    target: &'a str,
    workdir: &'a Path,
    files: &'a [String],
}

/// `None` when the agent resolved and committed the merge.
fn resolve_conflict(
    ctx: &RunContext,
    run: &mut TaskRun,
    escalation: &Escalation<'_>,
) -> Result<Option<IntegrationOutcome>> {
    let Escalation {
        task,
        source,
        target,
        workdir,
        files,
    } = *escalation;
    ctx.emit(
        &run.identity,
        LoopEvent::MergeConflictResolving {
            task_id: task.id.clone(),
            target: target.to_string(),
            files: files.to_vec(),
        },
    );

    // Fresh session: the task conversation belongs to the task checkout.
    let request = AgentRequest {
        system_prompt: ctx
            .prompts
            .system(&run.identity, task, workdir, Some(target))?,
        prompt: ctx.prompts.conflict(task, source, target, files)?,
        workdir: workdir.to_path_buf(),
        session_id: None,
        task_id: Some(task.id.clone()),
        agent_name: Some(run.identity.clone()),
    };
    let invocation = invoke(ctx, run, &request, &mut |_| {});

    let error = if invocation.result.success {
        let status = ctx.provisioner.worktree_status(workdir)?;
        if !status.is_clean() {
            format!("conflict resolution left {} in {target}", status.summary())
        } else if !ctx.provisioner.merge_landed(workdir, source)? {
            format!("conflict resolution did not merge {source} into {target}")
        } else {
            return Ok(None);
        }
    } else {
        invocation
            .result
            .error
            .clone()
            .unwrap_or_else(|| "conflict resolution agent failed".to_string())
    };

    if invocation.corrupted.is_some() {
        run.session = None;
        persist_session(ctx, run)?;
    }
    if let Err(err) = ctx.provisioner.abort_merge(workdir) {
        warn!(err = %format!("{err:#}"), "abort merge failed");
    }

    let attempts = ctx.retries.increment(&task.id, RetryKind::Conflict)?;
    if let Some(limit) = ctx.config.merge.conflict_retry_limit
        && attempts >= limit
    {
        let reason = format!(
            "merge conflict into {target} unresolved after {attempts} attempts: {error}"
        );
        ctx.store.update_task(&task.id, |t| {
            transition(t, TaskStatus::Blocked, Utc::now())?;
            t.append_note(format!("blocked: {reason}"));
            Ok(())
        })?;
        ctx.retries.reset(&task.id, RetryKind::Conflict)?;
        return Ok(Some(IntegrationOutcome::Blocked { reason }));
    }

    let reason = format!("conflict resolution into {target} failed: {error}");
    ctx.store.update_task(&task.id, |t| {
        t.append_note(reason.clone());
        Ok(())
    })?;
    warn!(attempts, "conflict resolution failed, task left pending merge");
    Ok(Some(IntegrationOutcome::PendingMerge { reason }))
}

/// Move the task to `done` (through `done_pending_merge`) and forget its retries.
fn finish(ctx: &RunContext, task_id: &str, note: Option<String>) -> Result<()> {
    ctx.store.update_task(task_id, |t| {
        let now = Utc::now();
        if t.status != TaskStatus::DonePendingMerge {
            transition(t, TaskStatus::DonePendingMerge, now)?;
        }
        transition(t, TaskStatus::Done, now)?;
        if let Some(note) = note {
            t.append_note(note);
        }
        Ok(())
    })?;
    ctx.retries.clear(task_id)
}
