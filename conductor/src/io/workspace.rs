//! Workspace provisioning: repositories, worktrees and integration primitives.
//!
//! [`Provisioner`] is the seam between the work loop and git. The production
//! implementation shells out to `git` (and `gh` for pull requests); tests use
//! a scripted fake.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{MergeResult, WorktreeEntry, WorktreeStatus};
use crate::io::config::ConductorConfig;
use crate::io::git::Git;
use crate::io::paths::ConductorPaths;
use crate::io::process::run_command_with_timeout;

const PR_TIMEOUT: Duration = Duration::from_secs(120);
const PROTECTED_BRANCHES: &[&str] = &["main", "master"];

/// A repository a task integrates into, with resolved locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoHandle {
    /// Configured name, or the literal path as written in the task.
    pub name: String,
    /// Main checkout.
    pub root: PathBuf,
    pub remote: String,
    pub configured_default: Option<String>,
    pub worktrees_dir: PathBuf,
    /// Literal paths are worked in place: no worktree, no pull.
    pub literal: bool,
}

impl RepoHandle {
    /// Key for the merge lock; every lane must agree on it.
    pub fn lock_key(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }
}

/// True when a task's `repo` is a filesystem path rather than a configured name.
pub fn is_literal_path(repo: &str) -> bool {
    repo.starts_with('.') || repo.starts_with('~') || Path::new(repo).is_absolute()
}

/// Resolve a task's `repo` field.
pub fn resolve_repo(repo: &str, config: &ConductorConfig, paths: &ConductorPaths) -> Result<RepoHandle> {
    let escaped = repo.replace(['/', '\\', '~', ':'], "_");
    if is_literal_path(repo) {
        return Ok(RepoHandle {
            name: repo.to_string(),
            root: expand_path(repo, &paths.root)?,
            remote: "origin".to_string(),
            configured_default: None,
            worktrees_dir: paths.worktrees_dir.join(escaped),
            literal: true,
        });
    }
    let Some(repo_config) = config.repos.get(repo) else {
        bail!("unknown repository '{repo}' (not a path and not in [repos])");
    };
    let root = expand_path(&repo_config.path.to_string_lossy(), &paths.root)?;
    let worktrees_dir = match &repo_config.worktrees_dir {
        Some(dir) => expand_path(&dir.to_string_lossy(), &paths.root)?,
        None => paths.worktrees_dir.join(escaped),
    };
    Ok(RepoHandle {
        name: repo.to_string(),
        root,
        remote: repo_config.remote.clone(),
        configured_default: repo_config.default_branch.clone(),
        worktrees_dir,
        literal: false,
    })
}

fn expand_path(raw: &str, base: &Path) -> Result<PathBuf> {
    if raw == "~" || raw.starts_with("~/") {
        let home = env::var_os("HOME").ok_or_else(|| anyhow!("HOME is not set; cannot expand {raw}"))?;
        let rest = raw.trim_start_matches('~').trim_start_matches('/');
        return Ok(PathBuf::from(home).join(rest));
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(base.join(path))
    }
}

/// Git operations the work loop and merge coordinator need.
pub trait Provisioner: Send + Sync {
    /// Bring the default branch up to date; `Ok(None)` when there is no remote.
    fn pull_default_branch(&self, repo: &RepoHandle) -> Result<Option<String>>;
    /// Configured default, else the remote HEAD, else `main`.
    fn default_branch(&self, repo: &RepoHandle) -> Result<String>;
    fn branch_exists(&self, repo: &RepoHandle, branch: &str) -> Result<bool>;
    fn list_worktrees(&self, repo: &RepoHandle) -> Result<Vec<WorktreeEntry>>;
    fn add_worktree(
        &self,
        repo: &RepoHandle,
        path: &Path,
        branch: &str,
        create: bool,
        base_branch: Option<&str>,
    ) -> Result<()>;
    fn worktree_status(&self, workdir: &Path) -> Result<WorktreeStatus>;
    fn push_branch(&self, repo: &RepoHandle, workdir: &Path, branch: &str) -> Result<()>;
    /// Merge `branch` into whatever `workdir` has checked out.
    fn merge_branch(&self, workdir: &Path, branch: &str) -> Result<MergeResult>;
    fn abort_merge(&self, workdir: &Path) -> Result<()>;
    /// True when no merge is open in `workdir` and `branch` is reachable from its HEAD.
    fn merge_landed(&self, workdir: &Path, branch: &str) -> Result<bool>;
    fn delete_branch(&self, repo: &RepoHandle, branch: &str) -> Result<()>;
    fn list_merged_branches(&self, repo: &RepoHandle, target: &str) -> Result<Vec<String>>;
    /// Open a pull request and return its URL.
    fn create_pull_request(
        &self,
        repo: &RepoHandle,
        workdir: &Path,
        request: &PullRequest,
    ) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

/// [`Provisioner`] over the `git` and `gh` CLIs.
#[derive(Debug, Clone, Default)]
pub struct GitProvisioner;

impl Provisioner for GitProvisioner {
    #[instrument(skip_all, fields(repo = %repo.name))]
    fn pull_default_branch(&self, repo: &RepoHandle) -> Result<Option<String>> {
        let git = Git::new(&repo.root);
        if !git.remote_exists(&repo.remote)? {
            debug!(remote = %repo.remote, "remote not configured, skipping pull");
            return Ok(None);
        }
        let branch = self.default_branch(repo)?;
        let checkout = git
            .worktree_list()?
            .into_iter()
            .find(|entry| entry.branch.as_deref() == Some(branch.as_str()));
        match checkout {
            Some(entry) => Git::new(&entry.path).pull_ff_only(&repo.remote, &branch)?,
            None => git.fetch_into(&repo.remote, &branch)?,
        }
        info!(branch = %branch, "default branch updated");
        Ok(Some(branch))
    }

    fn default_branch(&self, repo: &RepoHandle) -> Result<String> {
        if let Some(branch) = &repo.configured_default {
            return Ok(branch.clone());
        }
        let git = Git::new(&repo.root);
        Ok(git
            .remote_head_branch(&repo.remote)?
            .unwrap_or_else(|| "main".to_string()))
    }

    fn branch_exists(&self, repo: &RepoHandle, branch: &str) -> Result<bool> {
        Git::new(&repo.root).branch_exists(branch)
    }

    fn list_worktrees(&self, repo: &RepoHandle) -> Result<Vec<WorktreeEntry>> {
        Git::new(&repo.root).worktree_list()
    }

    fn add_worktree(
        &self,
        repo: &RepoHandle,
        path: &Path,
        branch: &str,
        create: bool,
        base_branch: Option<&str>,
    ) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        Git::new(&repo.root).worktree_add(path, branch, create, base_branch)
    }

    fn worktree_status(&self, workdir: &Path) -> Result<WorktreeStatus> {
        Git::new(workdir).worktree_status()
    }

    fn push_branch(&self, repo: &RepoHandle, workdir: &Path, branch: &str) -> Result<()> {
        Git::new(workdir).push(&repo.remote, branch)
    }

    fn merge_branch(&self, workdir: &Path, branch: &str) -> Result<MergeResult> {
        Git::new(workdir).merge_no_ff(branch)
    }

    fn abort_merge(&self, workdir: &Path) -> Result<()> {
        let git = Git::new(workdir);
        if git.merge_in_progress()? {
            git.merge_abort()?;
        }
        Ok(())
    }

    fn merge_landed(&self, workdir: &Path, branch: &str) -> Result<bool> {
        let git = Git::new(workdir);
        if git.merge_in_progress()? {
            return Ok(false);
        }
        git.is_ancestor(branch, "HEAD")
    }

    fn delete_branch(&self, repo: &RepoHandle, branch: &str) -> Result<()> {
        Git::new(&repo.root).delete_branch(branch)
    }

    fn list_merged_branches(&self, repo: &RepoHandle, target: &str) -> Result<Vec<String>> {
        Git::new(&repo.root).merged_branches(target)
    }

    #[instrument(skip_all, fields(repo = %repo.name, head = %request.head, base = %request.base))]
    fn create_pull_request(
        &self,
        repo: &RepoHandle,
        workdir: &Path,
        request: &PullRequest,
    ) -> Result<String> {
        let mut cmd = Command::new("gh");
        cmd.args([
            "pr",
            "create",
            "--head",
            &request.head,
            "--base",
            &request.base,
            "--title",
            &request.title,
            "--body",
            &request.body,
        ])
        .current_dir(workdir);
        let output = run_command_with_timeout(cmd, None, PR_TIMEOUT, 64 * 1024)?;
        if output.timed_out {
            bail!("gh pr create timed out after {}s", PR_TIMEOUT.as_secs());
        }
        if !output.status.success() {
            bail!("gh pr create failed: {}", output.stderr_lossy().trim());
        }
        let url = output.stdout_lossy().trim().to_string();
        info!(url = %url, "pull request created");
        Ok(url)
    }
}

/// Where a branch is (or will be) checked out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkout {
    pub path: PathBuf,
    pub created: bool,
}

/// Find the checkout for `branch`, creating a worktree when none exists.
///
/// A missing branch is created from `base_branch`, else the default branch.
#[instrument(skip_all, fields(repo = %repo.name, branch = %branch))]
pub fn ensure_worktree(
    provisioner: &dyn Provisioner,
    repo: &RepoHandle,
    branch: &str,
    base_branch: Option<&str>,
) -> Result<Checkout> {
    if let Some(entry) = provisioner
        .list_worktrees(repo)?
        .into_iter()
        .find(|entry| entry.branch.as_deref() == Some(branch))
    {
        debug!(path = %entry.path.display(), "reusing checkout");
        return Ok(Checkout {
            path: entry.path,
            created: false,
        });
    }

    let path = repo.worktrees_dir.join(branch);
    let exists = provisioner.branch_exists(repo, branch)?;
    let base = if exists {
        None
    } else {
        Some(match base_branch {
            Some(base) => base.to_string(),
            None => provisioner.default_branch(repo)?,
        })
    };
    info!(path = %path.display(), create = !exists, base = ?base, "adding worktree");
    provisioner.add_worktree(repo, &path, branch, !exists, base.as_deref())?;
    Ok(Checkout {
        path,
        created: true,
    })
}

/// Delete local branches fully merged into `target`.
///
/// Never touches the default branch, `main`/`master`, the target itself, or a
/// branch backing a worktree. Failures are logged and skipped.
pub fn cleanup_merged_branches(
    provisioner: &dyn Provisioner,
    repo: &RepoHandle,
    target: &str,
) -> Result<Vec<String>> {
    let default = provisioner.default_branch(repo)?;
    let active: Vec<String> = provisioner
        .list_worktrees(repo)?
        .into_iter()
        .filter_map(|entry| entry.branch)
        .collect();
    let mut deleted = Vec::new();
    for branch in provisioner.list_merged_branches(repo, target)? {
        if branch == default
            || branch == target
            || PROTECTED_BRANCHES.contains(&branch.as_str())
            || active.contains(&branch)
        {
            continue;
        }
        match provisioner.delete_branch(repo, &branch) {
            Ok(()) => deleted.push(branch),
            Err(err) => warn!(branch = %branch, err = %err, "delete merged branch failed"),
        }
    }
    if !deleted.is_empty() {
        info!(count = deleted.len(), target, "deleted merged branches");
    }
    Ok(deleted)
}
