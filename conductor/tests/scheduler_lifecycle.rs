//! Loop-level tests for the scheduler and merge coordinator.
//!
//! These drive `run_iteration` (and `run_loop`) against a temporary task file
//! with a scripted agent and a fake provisioner, plus one end-to-end merge in
//! a real git repository.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use conductor::context::RunContext;
use conductor::core::events::LoopEvent;
use conductor::core::types::{AgentResult, MergeResult};
use conductor::io::agent::AgentRegistry;
use conductor::io::checkpoint::FileCheckpointQueue;
use conductor::io::merge_lock::LockAttempt;
use conductor::io::retries::RetryKind;
use conductor::io::workspace::{GitProvisioner, resolve_repo};
use conductor::prime::{answer, prime, reset};
use conductor::scheduler::{IterationOutcome, LoopLimits, run_iteration, run_loop};
use conductor::task::{GitConfig, StepStatus, Task, TaskStatus};
use conductor::test_support::{
    ScriptedAgent, TestEnv, TestRepo, commit_file_in, mark_step_done, run_git, success, task,
    task_in_repo, task_with_steps,
};

const LANE: &str = "lane-a";

fn merging_task(id: &str) -> Task {
    Task {
        merge_into: Some("main".to_string()),
        ..task_in_repo(id, "app", &format!("feature/{id}"))
    }
}

fn completed(id: &str) -> IterationOutcome {
    IterationOutcome::Completed {
        task_id: id.to_string(),
    }
}

/// Three steps finish in one iteration: each run marks its step done and the
/// next run gets a continuation prompt in the same session.
#[test]
fn steps_continue_in_order_within_one_session() {
    let env = TestEnv::new(vec![task_with_steps("t1", &["plan", "build", "verify"])]);
    let mut agent = ScriptedAgent::new();
    for step in ["plan", "build", "verify"] {
        let tasks_path = env.tasks_path();
        agent = agent.then_run(move |_| {
            mark_step_done(&tasks_path, "t1", step)?;
            Ok(success(Some("s-1")))
        });
    }
    let agent = Arc::new(agent);
    let ctx = env.ctx(agent.clone());

    let outcome = run_iteration(&ctx, LANE).expect("iteration");
    assert_eq!(outcome, completed("t1"));

    let requests = agent.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].session_id, None);
    assert!(requests[0].prompt.contains("Work only on step `plan`"));
    assert_eq!(requests[1].session_id.as_deref(), Some("s-1"));
    assert!(requests[1].prompt.contains("Step `plan`"));
    assert!(requests[1].prompt.contains("<step id=\"build\">"));
    assert!(requests[2].prompt.contains("- build: Carry out build."));

    let steps: Vec<LoopEvent> = env
        .sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, LoopEvent::StepStarted { .. } | LoopEvent::StepCompleted { .. }))
        .collect();
    let expected: Vec<LoopEvent> = ["plan", "build", "verify"]
        .iter()
        .flat_map(|step| {
            [
                LoopEvent::StepStarted {
                    task_id: "t1".to_string(),
                    step_id: step.to_string(),
                },
                LoopEvent::StepCompleted {
                    task_id: "t1".to_string(),
                    step_id: step.to_string(),
                },
            ]
        })
        .collect();
    assert_eq!(steps, expected);

    let task = env.task("t1");
    assert_eq!(task.status, TaskStatus::Done);
    assert!(task.steps.iter().all(|s| s.status == StepStatus::Done));
    assert_eq!(task.session_id.as_deref(), Some("s-1"));
}

#[test]
fn one_run_finishing_several_steps_reports_each() {
    let env = TestEnv::new(vec![task_with_steps("t1", &["s1", "s2", "s3"])]);
    let first_path = env.tasks_path();
    let last_path = env.tasks_path();
    let agent = Arc::new(
        ScriptedAgent::new()
            .then_run(move |_| {
                mark_step_done(&first_path, "t1", "s1")?;
                mark_step_done(&first_path, "t1", "s2")?;
                Ok(success(Some("s-1")))
            })
            .then_run(move |_| {
                mark_step_done(&last_path, "t1", "s3")?;
                Ok(success(Some("s-1")))
            }),
    );
    let ctx = env.ctx(agent.clone());

    assert_eq!(run_iteration(&ctx, LANE).expect("iteration"), completed("t1"));
    assert!(agent.requests()[1].prompt.contains("Step `s2`"));

    let started = |step: &str| LoopEvent::StepStarted {
        task_id: "t1".to_string(),
        step_id: step.to_string(),
    };
    let done = |step: &str| LoopEvent::StepCompleted {
        task_id: "t1".to_string(),
        step_id: step.to_string(),
    };
    let steps: Vec<LoopEvent> = env
        .sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, LoopEvent::StepStarted { .. } | LoopEvent::StepCompleted { .. }))
        .collect();
    assert_eq!(
        steps,
        vec![started("s1"), done("s1"), done("s2"), started("s3"), done("s3")]
    );
}

#[test]
fn stalled_step_resumes_on_next_pass() {
    let env = TestEnv::new(vec![task_with_steps("t1", &["only"])]);
    let tasks_path = env.tasks_path();
    let agent = Arc::new(
        ScriptedAgent::new()
            .succeed(Some("s-1"))
            .then_run(move |_| {
                mark_step_done(&tasks_path, "t1", "only")?;
                Ok(success(Some("s-1")))
            }),
    );
    let ctx = env.ctx(agent.clone());

    let first = run_iteration(&ctx, LANE).expect("first");
    assert_eq!(
        first,
        IterationOutcome::StepsIncomplete {
            task_id: "t1".to_string(),
            step_id: "only".to_string(),
        }
    );
    assert_eq!(env.task("t1").status, TaskStatus::InProgress);

    let second = run_iteration(&ctx, LANE).expect("second");
    assert_eq!(second, completed("t1"));
    assert_eq!(agent.requests()[1].session_id.as_deref(), Some("s-1"));
}

#[test]
fn claim_is_persisted_before_the_agent_runs() {
    let env = TestEnv::new(vec![task("t1")]);
    let store = env.store();
    let agent = Arc::new(ScriptedAgent::new().then_run(move |_| {
        let claimed = store.task("t1")?;
        assert_eq!(claimed.status, TaskStatus::InProgress);
        assert_eq!(claimed.agent_name.as_deref(), Some(LANE));
        assert!(claimed.started_at.is_some());
        Ok(success(None))
    }));
    let ctx = env.ctx(agent);

    assert_eq!(run_iteration(&ctx, LANE).expect("iteration"), completed("t1"));
}

#[test]
fn lanes_only_see_their_own_work() {
    let mut theirs = task("theirs");
    theirs.agent_name = Some("lane-b".to_string());
    let env = TestEnv::new(vec![theirs]);
    let ctx = env.ctx(Arc::new(ScriptedAgent::new()));

    assert_eq!(run_iteration(&ctx, LANE).expect("iteration"), IterationOutcome::Idle);
    assert_eq!(env.task("theirs").status, TaskStatus::Todo);
}

#[test]
fn uncommitted_work_blocks_after_three_attempts() {
    let env = TestEnv::new(vec![task_in_repo("t1", "app", "feature/t1")]);
    // Each pass checks the worktree before and after the commit-resume.
    env.provisioner.push_dirty(6);
    let mut agent = ScriptedAgent::new();
    for _ in 0..7 {
        agent = agent.succeed(Some("s-1"));
    }
    let agent = Arc::new(agent);
    let ctx = env.ctx(agent.clone());

    for attempt in 1..=2 {
        let outcome = run_iteration(&ctx, LANE).expect("iteration");
        assert_eq!(
            outcome,
            IterationOutcome::CommitRetry {
                task_id: "t1".to_string(),
                attempt,
            }
        );
        let task = env.task("t1");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.session_id, None);
    }
    let third = run_iteration(&ctx, LANE).expect("third");
    assert!(matches!(third, IterationOutcome::Blocked { .. }), "{third:?}");

    let task = env.task("t1");
    assert_eq!(task.status, TaskStatus::Blocked);
    assert!(task.ai_notes.iter().any(|n| n.starts_with("commit retry 2/3")));
    assert!(task.ai_notes.last().is_some_and(|n| n.starts_with("blocked:")));
    assert_eq!(ctx.retries.get("t1", RetryKind::Commit).expect("count"), 0);
    assert_eq!(run_iteration(&ctx, LANE).expect("blocked"), IterationOutcome::Idle);

    // A reset task is picked up again with a fresh session.
    reset(&ctx, "t1").expect("reset");
    assert_eq!(run_iteration(&ctx, LANE).expect("after reset"), completed("t1"));
    assert_eq!(agent.remaining(), 0);
    assert_eq!(agent.requests().last().and_then(|r| r.session_id.clone()), None);
}

#[test]
fn corrupted_fresh_session_is_dropped_without_blocking() {
    let mut claimed = task("t1");
    claimed.session_id = Some("s-old".to_string());
    claimed.session_provider = Some("other-provider".to_string());
    let env = TestEnv::new(vec![claimed]);
    let agent = Arc::new(
        ScriptedAgent::new().fail("API error: unexpected `tool_use_id` in message", Some("s-new")),
    );
    let ctx = env.ctx(agent.clone());

    let outcome = run_iteration(&ctx, LANE).expect("iteration");
    assert!(matches!(outcome, IterationOutcome::Failed { .. }));
    // A session from another provider is never resumed.
    assert_eq!(agent.requests()[0].session_id, None);

    let task = env.task("t1");
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.session_id, None);
    assert!(env
        .sink
        .events()
        .iter()
        .any(|e| matches!(e, LoopEvent::SessionCorrupted { .. })));
}

#[test]
fn failed_resume_discards_the_session() {
    let mut resuming = task("t1");
    resuming.status = TaskStatus::InProgress;
    resuming.agent_name = Some(LANE.to_string());
    resuming.session_id = Some("s-old".to_string());
    resuming.session_provider = Some("default".to_string());
    let env = TestEnv::new(vec![resuming]);
    let agent = Arc::new(ScriptedAgent::new().fail("agent timed out after 3600s", Some("s-old")));
    let ctx = env.ctx(agent.clone());

    let outcome = run_iteration(&ctx, LANE).expect("iteration");
    assert_eq!(
        outcome,
        IterationOutcome::Failed {
            task_id: "t1".to_string(),
            error: "agent timed out after 3600s".to_string(),
        }
    );
    assert_eq!(agent.requests()[0].session_id.as_deref(), Some("s-old"));
    assert_eq!(env.task("t1").session_id, None);
}

#[test]
fn ordinary_failure_keeps_the_session() {
    let env = TestEnv::new(vec![task("t1")]);
    let agent = Arc::new(ScriptedAgent::new().fail("tests failed", Some("s-1")));
    let ctx = env.ctx(agent);

    run_iteration(&ctx, LANE).expect("iteration");
    let task = env.task("t1");
    assert_eq!(task.session_id.as_deref(), Some("s-1"));
    assert_eq!(task.session_provider.as_deref(), Some("default"));
}

#[test]
fn spawn_error_becomes_failed_outcome() {
    let env = TestEnv::new(vec![task("t1")]);
    let ctx = env.ctx(Arc::new(ScriptedAgent::new().spawn_error("no such program")));

    let outcome = run_iteration(&ctx, LANE).expect("iteration");
    assert!(
        matches!(&outcome, IterationOutcome::Failed { error, .. } if error.contains("no such program"))
    );
    assert!(env
        .sink
        .events()
        .iter()
        .any(|e| matches!(e, LoopEvent::TaskFailed { .. })));
}

#[test]
fn conflict_is_resolved_in_the_target_checkout() {
    let env = TestEnv::new(vec![merging_task("t1")]);
    env.provisioner.push_merge(MergeResult::Conflict {
        files: vec!["src/lib.rs".to_string()],
    });
    let agent = Arc::new(ScriptedAgent::new().succeed(Some("s-1")).succeed(Some("s-merge")));
    let ctx = env.ctx(agent.clone());

    assert_eq!(run_iteration(&ctx, LANE).expect("iteration"), completed("t1"));

    let requests = agent.requests();
    let conflict = &requests[1];
    assert_eq!(conflict.session_id, None);
    assert!(conflict.workdir.ends_with("main"));
    assert!(conflict.prompt.contains("- src/lib.rs"));
    // The task keeps its own session, not the resolver's.
    assert_eq!(env.task("t1").session_id.as_deref(), Some("s-1"));
    assert!(env.provisioner.called("merge feature/t1"));
    assert!(!env.provisioner.called("abort_merge"));

    let events = env.sink.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, LoopEvent::MergeConflictResolving { files, .. } if files.len() == 1)));
    assert!(events
        .iter()
        .any(|e| matches!(e, LoopEvent::MergeConflictResolved { .. })));
}

#[test]
fn failed_conflict_resolution_waits_then_retries_merge_only() {
    let env = TestEnv::new(vec![merging_task("t1")]);
    env.provisioner.push_merge(MergeResult::Conflict {
        files: vec!["src/lib.rs".to_string()],
    });
    let agent = Arc::new(
        ScriptedAgent::new()
            .succeed(Some("s-1"))
            .fail("could not reconcile both sides", None),
    );
    let ctx = env.ctx(agent.clone());

    let outcome = run_iteration(&ctx, LANE).expect("iteration");
    assert!(matches!(outcome, IterationOutcome::PendingMerge { .. }), "{outcome:?}");
    assert!(env.provisioner.called("abort_merge"));
    let task = env.task("t1");
    assert_eq!(task.status, TaskStatus::DonePendingMerge);
    assert!(task
        .ai_notes
        .iter()
        .any(|n| n.starts_with("conflict resolution into main failed")));

    // Next pass only merges; the agent is not invoked again.
    assert_eq!(run_iteration(&ctx, LANE).expect("retry"), completed("t1"));
    assert_eq!(agent.requests().len(), 2);
}

#[test]
fn aborted_conflict_resolution_is_not_a_merge() {
    let env = TestEnv::new(vec![merging_task("t1")]);
    env.provisioner.push_merge(MergeResult::Conflict {
        files: vec!["src/lib.rs".to_string()],
    });
    // The resolver reports success after `git merge --abort`: clean, but unmerged.
    env.provisioner.abandon_next_merge();
    let agent = Arc::new(ScriptedAgent::new().succeed(Some("s-1")).succeed(None));
    let ctx = env.ctx(agent);

    let outcome = run_iteration(&ctx, LANE).expect("iteration");
    assert!(matches!(outcome, IterationOutcome::PendingMerge { .. }), "{outcome:?}");
    assert!(env.provisioner.called("merge_landed feature/t1"));
    let task = env.task("t1");
    assert_eq!(task.status, TaskStatus::DonePendingMerge);
    assert!(task
        .ai_notes
        .iter()
        .any(|n| n.contains("did not merge feature/t1 into main")));
    assert!(!env
        .sink
        .events()
        .iter()
        .any(|e| matches!(e, LoopEvent::MergeConflictResolved { .. })));
}

#[test]
fn silent_conflict_resolver_keeps_the_merge_lock() {
    let mut env = TestEnv::new(vec![merging_task("t1")]);
    env.config.merge.lock_stale_secs = 1;
    env.provisioner.push_merge(MergeResult::Conflict {
        files: vec!["src/lib.rs".to_string()],
    });
    let lookup = env.ctx(Arc::new(ScriptedAgent::new()));
    let repo = resolve_repo("app", &lookup.config, &lookup.paths).expect("repo");
    let lock = lookup.merge_lock(&repo, "main");

    let agent = Arc::new(ScriptedAgent::new().succeed(Some("s-1")).then_run(move |_| {
        std::thread::sleep(Duration::from_millis(1500));
        let contender = lock.try_acquire("lane-b", "feature/other")?;
        assert!(contender.is_none(), "lane-b took the lock during a live merge");
        Ok(AgentResult {
            output: String::new(),
            ..success(None)
        })
    }));
    let ctx = env.ctx(agent);

    assert_eq!(run_iteration(&ctx, LANE).expect("iteration"), completed("t1"));
    assert!(!lookup.merge_lock(&repo, "main").path().exists());
}

#[test]
fn conflict_retry_limit_blocks_the_task() {
    let mut env = TestEnv::new(vec![merging_task("t1")]);
    env.config.merge.conflict_retry_limit = Some(1);
    env.provisioner.push_merge(MergeResult::Conflict {
        files: vec!["a.txt".to_string()],
    });
    let agent = Arc::new(ScriptedAgent::new().succeed(None).fail("gave up", None));
    let ctx = env.ctx(agent);

    let outcome = run_iteration(&ctx, LANE).expect("iteration");
    assert!(matches!(outcome, IterationOutcome::Blocked { .. }), "{outcome:?}");
    assert_eq!(env.task("t1").status, TaskStatus::Blocked);
    assert_eq!(ctx.retries.get("t1", RetryKind::Conflict).expect("count"), 0);
}

#[test]
fn busy_merge_lock_defers_the_merge() {
    let env = TestEnv::new(vec![merging_task("t1")]);
    let agent = Arc::new(ScriptedAgent::new().succeed(None));
    let ctx = env.ctx(agent);

    let repo = resolve_repo("app", &ctx.config, &ctx.paths).expect("repo");
    let lock = ctx.merge_lock(&repo, "main");
    let LockAttempt::Acquired(held) = lock
        .acquire_with_wait("lane-b", "feature/other", Duration::ZERO, Duration::from_secs(1), &mut |_, _| {})
        .expect("acquire")
    else {
        panic!("lock should be free");
    };

    let outcome = run_iteration(&ctx, LANE).expect("iteration");
    assert_eq!(
        outcome,
        IterationOutcome::Deferred {
            task_id: "t1".to_string(),
            holder: "lane-b".to_string(),
        }
    );
    assert!(!env.provisioner.called("merge"));
    let task = env.task("t1");
    assert_eq!(task.status, TaskStatus::DonePendingMerge);
    assert!(task.ai_notes.iter().any(|n| n.contains("lock held by lane-b")));

    held.release().expect("release");
    assert_eq!(run_iteration(&ctx, LANE).expect("retry"), completed("t1"));
}

#[test]
fn pull_request_failure_still_completes() {
    let mut pr_task = merging_task("t1");
    pr_task.open_pr = true;
    let env = TestEnv::with_git(
        vec![pr_task],
        GitConfig {
            push_to_remote: true,
            ..GitConfig::default()
        },
    );
    env.provisioner.fail_pr();
    let ctx = env.ctx(Arc::new(ScriptedAgent::new().succeed(None)));

    assert_eq!(run_iteration(&ctx, LANE).expect("iteration"), completed("t1"));
    assert!(env.provisioner.called("push feature/t1"));
    assert!(env.provisioner.called("pr feature/t1->main"));
    assert!(!env.provisioner.called("merge"));
    let task = env.task("t1");
    assert!(task.ai_notes.iter().any(|n| n.contains("not created")));
}

#[test]
fn push_failure_leaves_task_pending_merge() {
    let env = TestEnv::with_git(
        vec![merging_task("t1")],
        GitConfig {
            push_to_remote: true,
            ..GitConfig::default()
        },
    );
    env.provisioner.fail_push();
    let ctx = env.ctx(Arc::new(ScriptedAgent::new().succeed(None)));

    let outcome = run_iteration(&ctx, LANE).expect("iteration");
    assert!(
        matches!(&outcome, IterationOutcome::Failed { error, .. } if error.contains("push feature/t1"))
    );
    assert_eq!(env.task("t1").status, TaskStatus::DonePendingMerge);
}

#[test]
fn worktree_is_created_from_the_base_branch() {
    let mut based = task_in_repo("t1", "app", "feature/t1");
    based.base_branch = Some("develop".to_string());
    let env = TestEnv::new(vec![based]);
    let agent = Arc::new(ScriptedAgent::new().succeed(None));
    let ctx = env.ctx(agent.clone());

    assert_eq!(run_iteration(&ctx, LANE).expect("iteration"), completed("t1"));
    assert_eq!(
        env.provisioner.calls()[..2],
        [
            "pull".to_string(),
            "add_worktree feature/t1 create=true base=develop".to_string(),
        ]
    );
    assert!(agent.requests()[0].workdir.ends_with("feature/t1"));
    assert!(env.sink.events().iter().any(|e| matches!(
        e,
        LoopEvent::WorktreeCreated { branch, .. } if branch == "feature/t1"
    )));
}

#[test]
fn pull_failure_leaves_the_claim_for_the_next_pass() {
    let env = TestEnv::new(vec![task_in_repo("t1", "app", "feature/t1")]);
    env.provisioner.fail_pull();
    let agent = Arc::new(ScriptedAgent::new());
    let ctx = env.ctx(agent.clone());

    let outcome = run_iteration(&ctx, LANE).expect("iteration");
    assert!(
        matches!(&outcome, IterationOutcome::Failed { error, .. } if error.contains("network unreachable"))
    );
    assert!(agent.requests().is_empty());
    let task = env.task("t1");
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.agent_name.as_deref(), Some(LANE));
}

#[test]
fn checkpoint_answer_unblocks_dependents() {
    let mut gate = task("gate");
    gate.checkpoint = true;
    let mut after = task("after");
    after.depends_on = vec!["gate".to_string()];
    let env = TestEnv::new(vec![gate, after]);
    let ctx = env.ctx(Arc::new(ScriptedAgent::new().succeed(None)));

    let report = prime(&ctx).expect("prime");
    assert_eq!(report.questions.len(), 1);
    assert_eq!(run_iteration(&ctx, LANE).expect("idle"), IterationOutcome::Idle);

    answer(&ctx, &report.questions[0], true).expect("answer");
    assert_eq!(env.task("gate").status, TaskStatus::Done);

    let mut seen = Vec::new();
    let summary = run_loop(
        &ctx,
        LANE,
        LoopLimits {
            max_iterations: Some(5),
            until_idle: true,
        },
        |outcome| seen.push(outcome.clone()),
    );
    assert_eq!(seen, vec![completed("after"), IterationOutcome::Idle]);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.errors, 0);
}

#[test]
fn loop_stops_at_max_iterations() {
    let env = TestEnv::new(vec![task("t1"), task("t2"), task("t3")]);
    let ctx = env.ctx(Arc::new(ScriptedAgent::new().succeed(None).succeed(None)));

    let summary = run_loop(
        &ctx,
        LANE,
        LoopLimits {
            max_iterations: Some(2),
            until_idle: false,
        },
        |_| {},
    );
    assert_eq!(summary.iterations, 2);
    assert_eq!(summary.completed, 2);
    assert_eq!(env.task("t3").status, TaskStatus::ReadyForAgent);
}

/// End to end against real git: the agent commits on its branch, the
/// coordinator merges it into `main` in the primary checkout.
#[test]
fn real_git_merge_lands_on_main() {
    let repo = TestRepo::new();
    let mut env = TestEnv::new(vec![merging_task("t1")]);
    if let Some(app) = env.config.repos.get_mut("app") {
        app.path = repo.path().to_path_buf();
    }
    let agent = Arc::new(ScriptedAgent::new().then_run(|request| {
        commit_file_in(&request.workdir, "feature.txt", "new feature\n", "add feature");
        Ok(success(None))
    }));
    let mut agents = AgentRegistry::new();
    agents.insert(env.config.default_provider.clone(), agent);
    let ctx = RunContext::new(
        env.root(),
        env.config.clone(),
        agents,
        Arc::new(GitProvisioner),
        Arc::new(FileCheckpointQueue::new(env.root().join("questions"))),
        env.sink.clone(),
    )
    .expect("context");

    assert_eq!(run_iteration(&ctx, LANE).expect("iteration"), completed("t1"));

    let log = repo.git(&["log", "--oneline", "main"]);
    assert!(log.contains("add feature"), "{log}");
    assert_eq!(
        fs::read_to_string(repo.path().join("feature.txt")).expect("merged file"),
        "new feature\n"
    );
    let branches = run_git(repo.path(), &["branch", "--list", "feature/t1"]);
    assert!(branches.contains("feature/t1"));
    assert!(!ctx.paths.locks_dir.exists() || fs::read_dir(&ctx.paths.locks_dir).expect("locks").next().is_none());
}
