//! Builders and fakes shared by unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, bail};
use chrono::Utc;
use tempfile::TempDir;

use crate::context::RunContext;
use crate::core::events::{EventSink, LoopEvent};
use crate::core::steps::complete_step;
use crate::core::types::{AgentRequest, AgentResult, MergeResult, WorktreeEntry, WorktreeStatus};
use crate::io::agent::{Agent, AgentRegistry};
use crate::io::checkpoint::FileCheckpointQueue;
use crate::io::config::{ConductorConfig, RepoConfig};
use crate::io::task_store::{TaskStore, write_tasks};
use crate::io::workspace::{Provisioner, PullRequest, RepoHandle};
use crate::task::{GitConfig, Step, StepStatus, Task, TaskFile};

/// Task with deterministic defaults; the title equals the id.
pub fn task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        title: id.to_string(),
        ..Task::default()
    }
}

pub fn task_with_subtasks(id: &str, subtasks: Vec<Task>) -> Task {
    Task {
        subtasks,
        ..task(id)
    }
}

pub fn step(id: &str) -> Step {
    Step {
        id: id.to_string(),
        instruction: format!("Carry out {id}."),
        acceptance_criteria: Vec::new(),
        status: StepStatus::Todo,
        started_at: None,
        completed_at: None,
    }
}

pub fn task_with_steps(id: &str, step_ids: &[&str]) -> Task {
    Task {
        steps: step_ids.iter().map(|s| step(s)).collect(),
        ..task(id)
    }
}

pub fn task_in_repo(id: &str, repo: &str, branch: &str) -> Task {
    Task {
        repo: Some(repo.to_string()),
        branch: Some(branch.to_string()),
        ..task(id)
    }
}

/// Mark a step done in the task file, as `conductor step-done` would.
pub fn mark_step_done(tasks_path: &Path, task_id: &str, step_id: &str) -> Result<()> {
    TaskStore::new(tasks_path).update_task(task_id, |task| complete_step(task, step_id, Utc::now()))
}

type Action = Box<dyn FnMut(&AgentRequest) -> Result<AgentResult> + Send>;

enum Scripted {
    Result(AgentResult),
    Action(Action),
}

/// Agent returning queued results in order and recording every request.
///
/// Running past the end of the script panics so tests notice unexpected calls.
#[derive(Default)]
pub struct ScriptedAgent {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, result: AgentResult) -> Self {
        self.push(Scripted::Result(result))
    }

    pub fn succeed(self, session_id: Option<&str>) -> Self {
        self.then(success(session_id))
    }

    pub fn fail(self, error: &str, session_id: Option<&str>) -> Self {
        self.then(AgentResult {
            success: false,
            output: String::new(),
            error: Some(error.to_string()),
            session_id: session_id.map(str::to_string),
        })
    }

    /// Run `action` for the next invocation; an `Err` stands for a spawn failure.
    pub fn then_run(
        self,
        action: impl FnMut(&AgentRequest) -> Result<AgentResult> + Send + 'static,
    ) -> Self {
        self.push(Scripted::Action(Box::new(action)))
    }

    pub fn spawn_error(self, message: &str) -> Self {
        let message = message.to_string();
        self.then_run(move |_| Err(anyhow!("{message}")))
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or_default()
    }

    fn push(self, entry: Scripted) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(entry);
        }
        self
    }
}

impl Agent for ScriptedAgent {
    fn run(&self, request: &AgentRequest, on_output: &mut dyn FnMut(&str)) -> Result<AgentResult> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("requests poisoned"))?
            .push(request.clone());
        let next = self
            .script
            .lock()
            .map_err(|_| anyhow!("script poisoned"))?
            .pop_front();
        let result = match next {
            Some(Scripted::Result(result)) => result,
            Some(Scripted::Action(mut action)) => action(request)?,
            None => panic!("scripted agent exhausted at prompt: {}", request.prompt),
        };
        for line in result.output.lines() {
            on_output(line);
        }
        Ok(result)
    }
}

pub fn success(session_id: Option<&str>) -> AgentResult {
    AgentResult {
        success: true,
        output: "done".to_string(),
        error: None,
        session_id: session_id.map(str::to_string),
    }
}

#[derive(Debug)]
struct FakeState {
    default_branch: String,
    has_remote: bool,
    fail_pull: bool,
    fail_push: bool,
    fail_pr: bool,
    branches: BTreeSet<String>,
    worktrees: Vec<WorktreeEntry>,
    statuses: VecDeque<WorktreeStatus>,
    merges: VecDeque<MergeResult>,
    merged: Vec<String>,
    unlanded_merges: usize,
    failing_deletes: BTreeSet<String>,
    calls: Vec<String>,
}

/// In-memory [`Provisioner`] with scripted statuses and merges.
///
/// Worktree status and merge results are consumed in order; when the queues
/// run dry the worktree is clean and merges succeed. Added worktrees get a
/// real directory so agents have somewhere to start.
#[derive(Debug)]
pub struct FakeProvisioner {
    state: Mutex<FakeState>,
}

impl Default for FakeProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                default_branch: "main".to_string(),
                has_remote: true,
                fail_pull: false,
                fail_push: false,
                fail_pr: false,
                branches: BTreeSet::from(["main".to_string()]),
                worktrees: Vec::new(),
                statuses: VecDeque::new(),
                merges: VecDeque::new(),
                merged: Vec::new(),
                unlanded_merges: 0,
                failing_deletes: BTreeSet::new(),
                calls: Vec::new(),
            }),
        }
    }

    fn with_state<T>(&self, apply: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(&mut state)
    }

    pub fn set_merged(&self, branches: &[&str]) {
        self.with_state(|s| s.merged = branches.iter().map(|b| b.to_string()).collect());
    }

    pub fn set_worktrees(&self, entries: &[(&str, &str)]) {
        self.with_state(|s| {
            s.worktrees = entries
                .iter()
                .map(|(path, branch)| WorktreeEntry {
                    path: PathBuf::from(path),
                    branch: Some(branch.to_string()),
                })
                .collect();
        });
    }

    pub fn fail_delete(&self, branch: &str) {
        self.with_state(|s| {
            s.failing_deletes.insert(branch.to_string());
        });
    }

    pub fn push_status(&self, status: WorktreeStatus) {
        self.with_state(|s| s.statuses.push_back(status));
    }

    /// Queue `count` dirty statuses with one untracked file.
    pub fn push_dirty(&self, count: usize) {
        for _ in 0..count {
            self.push_status(dirty());
        }
    }

    pub fn push_merge(&self, result: MergeResult) {
        self.with_state(|s| s.merges.push_back(result));
    }

    /// The next resolved conflict reports its merge as not landed, as after `git merge --abort`.
    pub fn abandon_next_merge(&self) {
        self.with_state(|s| s.unlanded_merges += 1);
    }

    pub fn without_remote(&self) {
        self.with_state(|s| s.has_remote = false);
    }

    pub fn fail_pull(&self) {
        self.with_state(|s| s.fail_pull = true);
    }

    pub fn fail_push(&self) {
        self.with_state(|s| s.fail_push = true);
    }

    pub fn fail_pr(&self) {
        self.with_state(|s| s.fail_pr = true);
    }

    pub fn calls(&self) -> Vec<String> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|call| call.starts_with(prefix))
    }
}

pub fn dirty() -> WorktreeStatus {
    WorktreeStatus {
        untracked: vec!["scratch.txt".to_string()],
        ..WorktreeStatus::default()
    }
}

impl Provisioner for FakeProvisioner {
    fn pull_default_branch(&self, _repo: &RepoHandle) -> Result<Option<String>> {
        self.with_state(|s| {
            s.calls.push("pull".to_string());
            if s.fail_pull {
                bail!("fetch failed: network unreachable");
            }
            Ok(s.has_remote.then(|| s.default_branch.clone()))
        })
    }

    fn default_branch(&self, _repo: &RepoHandle) -> Result<String> {
        Ok(self.with_state(|s| s.default_branch.clone()))
    }

    fn branch_exists(&self, _repo: &RepoHandle, branch: &str) -> Result<bool> {
        Ok(self.with_state(|s| s.branches.contains(branch)))
    }

    fn list_worktrees(&self, _repo: &RepoHandle) -> Result<Vec<WorktreeEntry>> {
        Ok(self.with_state(|s| s.worktrees.clone()))
    }

    fn add_worktree(
        &self,
        _repo: &RepoHandle,
        path: &Path,
        branch: &str,
        create: bool,
        base_branch: Option<&str>,
    ) -> Result<()> {
        fs::create_dir_all(path).map_err(|err| anyhow!("create {}: {err}", path.display()))?;
        self.with_state(|s| {
            s.calls.push(format!(
                "add_worktree {branch} create={create} base={}",
                base_branch.unwrap_or("-")
            ));
            s.branches.insert(branch.to_string());
            s.worktrees.push(WorktreeEntry {
                path: path.to_path_buf(),
                branch: Some(branch.to_string()),
            });
        });
        Ok(())
    }

    fn worktree_status(&self, _workdir: &Path) -> Result<WorktreeStatus> {
        Ok(self.with_state(|s| s.statuses.pop_front().unwrap_or_default()))
    }

    fn push_branch(&self, _repo: &RepoHandle, _workdir: &Path, branch: &str) -> Result<()> {
        self.with_state(|s| {
            s.calls.push(format!("push {branch}"));
            if s.fail_push {
                bail!("push rejected");
            }
            Ok(())
        })
    }

    fn merge_branch(&self, _workdir: &Path, branch: &str) -> Result<MergeResult> {
        Ok(self.with_state(|s| {
            s.calls.push(format!("merge {branch}"));
            s.merges.pop_front().unwrap_or(MergeResult::Merged)
        }))
    }

    fn abort_merge(&self, _workdir: &Path) -> Result<()> {
        self.with_state(|s| s.calls.push("abort_merge".to_string()));
        Ok(())
    }

    fn merge_landed(&self, _workdir: &Path, branch: &str) -> Result<bool> {
        Ok(self.with_state(|s| {
            s.calls.push(format!("merge_landed {branch}"));
            if s.unlanded_merges > 0 {
                s.unlanded_merges -= 1;
                return false;
            }
            true
        }))
    }

    fn delete_branch(&self, _repo: &RepoHandle, branch: &str) -> Result<()> {
        self.with_state(|s| {
            s.calls.push(format!("delete {branch}"));
            if s.failing_deletes.contains(branch) {
                bail!("branch {branch} not fully merged");
            }
            s.branches.remove(branch);
            Ok(())
        })
    }

    fn list_merged_branches(&self, _repo: &RepoHandle, _target: &str) -> Result<Vec<String>> {
        Ok(self.with_state(|s| s.merged.clone()))
    }

    fn create_pull_request(
        &self,
        _repo: &RepoHandle,
        _workdir: &Path,
        request: &PullRequest,
    ) -> Result<String> {
        self.with_state(|s| {
            s.calls.push(format!("pr {}->{}", request.head, request.base));
            if s.fail_pr {
                bail!("gh: not authenticated");
            }
            Ok(format!("https://example.invalid/pr/{}", request.head))
        })
    }
}

/// Event sink keeping every event for assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, LoopEvent)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LoopEvent> {
        self.events
            .lock()
            .map(|events| events.iter().map(|(_, e)| e.clone()).collect())
            .unwrap_or_default()
    }

    pub fn agents(&self) -> Vec<String> {
        self.events
            .lock()
            .map(|events| events.iter().map(|(a, _)| a.clone()).collect())
            .unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, agent: &str, event: &LoopEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push((agent.to_string(), event.clone()));
        }
    }
}

/// Temporary workspace with a task file, fake git and recorded events.
///
/// The configured repository `app` points at `<root>/app`; the fake
/// provisioner never touches it.
pub struct TestEnv {
    temp: TempDir,
    pub config: ConductorConfig,
    pub provisioner: Arc<FakeProvisioner>,
    pub sink: Arc<RecordingSink>,
}

impl TestEnv {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self::with_git(tasks, GitConfig::default())
    }

    pub fn with_git(tasks: Vec<Task>, git: GitConfig) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = ConductorConfig::default();
        config.repos.insert(
            "app".to_string(),
            RepoConfig {
                path: PathBuf::from("app"),
                ..RepoConfig::default()
            },
        );
        config.merge.lock_wait_secs = 0;
        config.merge.lock_poll_secs = 1;
        config.poll_interval_secs = 0;
        write_tasks(&temp.path().join(&config.tasks_file), &TaskFile { git, tasks })
            .expect("write tasks");
        Self {
            temp,
            config,
            provisioner: Arc::new(FakeProvisioner::new()),
            sink: Arc::new(RecordingSink::new()),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.root().join(&self.config.tasks_file)
    }

    pub fn store(&self) -> TaskStore {
        TaskStore::new(self.tasks_path())
    }

    pub fn task(&self, id: &str) -> Task {
        self.store().task(id).expect("task")
    }

    /// Context whose default provider is `agent`.
    pub fn ctx(&self, agent: Arc<dyn Agent>) -> RunContext {
        let mut agents = AgentRegistry::new();
        agents.insert(self.config.default_provider.clone(), agent);
        self.ctx_with(agents)
    }

    pub fn ctx_with(&self, agents: AgentRegistry) -> RunContext {
        RunContext::new(
            self.root(),
            self.config.clone(),
            agents,
            self.provisioner.clone(),
            Arc::new(FileCheckpointQueue::new(
                self.root().join(&self.config.state_dir).join("questions"),
            )),
            self.sink.clone(),
        )
        .expect("context")
    }
}

/// Real git repository on branch `main` with one commit, inside a temp dir.
///
/// The repository lives in a subdirectory so siblings (worktrees) stay in
/// the same temp dir.
pub struct TestRepo {
    _temp: TempDir,
    path: PathBuf,
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRepo {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("repo");
        fs::create_dir_all(&path).expect("create repo dir");
        let repo = Self { _temp: temp, path };
        repo.git(&["init", "-q", "-b", "main"]);
        repo.git(&["config", "user.email", "conductor@example.invalid"]);
        repo.git(&["config", "user.name", "Conductor Tests"]);
        repo.git(&["config", "commit.gpgsign", "false"]);
        repo.commit_file("README.md", "hello\n", "initial commit");
        repo
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a file and commit it on the current branch.
    pub fn commit_file(&self, rel: &str, contents: &str, message: &str) {
        commit_file_in(&self.path, rel, contents, message);
    }

    pub fn git(&self, args: &[&str]) -> String {
        run_git(&self.path, args)
    }
}

/// Write a file and commit it in any checkout.
pub fn commit_file_in(dir: &Path, rel: &str, contents: &str, message: &str) {
    let file = dir.join(rel);
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(&file, contents).expect("write file");
    run_git(dir, &["add", "-A"]);
    run_git(dir, &["commit", "-q", "-m", message]);
}

pub fn run_git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}
