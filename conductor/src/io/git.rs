//! Git adapter for worktree provisioning and integration.
//!
//! A small, explicit wrapper around `git` subprocess calls. Every call runs in
//! the wrapper's working directory (a main checkout or a task worktree).

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::types::{MergeResult, WorktreeEntry, WorktreeStatus};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

impl StatusEntry {
    fn is_conflict(&self) -> bool {
        matches!(
            self.code.as_str(),
            "DD" | "AU" | "UD" | "UA" | "DU" | "AA" | "UU"
        )
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Return the current branch name (errors on detached HEAD).
    #[cfg(test)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD in {}", self.workdir.display()));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Group porcelain entries into modified/staged/untracked/conflicted.
    pub fn worktree_status(&self) -> Result<WorktreeStatus> {
        Ok(group_status(&self.status_porcelain()?))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        self.ref_exists(&format!("refs/heads/{branch}"))
    }

    pub fn remote_exists(&self, remote: &str) -> Result<bool> {
        let out = self.run_capture(&["remote"])?;
        Ok(out.lines().any(|line| line.trim() == remote))
    }

    /// Branch the remote's HEAD points at (`refs/remotes/<remote>/HEAD`), if known.
    pub fn remote_head_branch(&self, remote: &str) -> Result<Option<String>> {
        let reference = format!("refs/remotes/{remote}/HEAD");
        let output = self.run(&["symbolic-ref", "--quiet", "--short", &reference])?;
        if !output.status.success() {
            return Ok(None);
        }
        let short = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let prefix = format!("{remote}/");
        Ok(short.strip_prefix(&prefix).map(str::to_string))
    }

    /// Fast-forward `branch` from `remote` in this checkout.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn pull_ff_only(&self, remote: &str, branch: &str) -> Result<()> {
        debug!(remote, branch, "pulling");
        self.run_checked(&["pull", "--ff-only", remote, branch])?;
        Ok(())
    }

    /// Update a local branch that is not checked out (`git fetch <remote> b:b`).
    #[instrument(skip_all, fields(remote, branch))]
    pub fn fetch_into(&self, remote: &str, branch: &str) -> Result<()> {
        let refspec = format!("{branch}:{branch}");
        self.run_checked(&["fetch", remote, &refspec])?;
        Ok(())
    }

    /// Parse `git worktree list --porcelain`.
    pub fn worktree_list(&self) -> Result<Vec<WorktreeEntry>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&out))
    }

    /// Add a worktree at `path` for `branch`, creating the branch from `base` when asked.
    #[instrument(skip_all, fields(path = %path.display(), branch, create))]
    pub fn worktree_add(
        &self,
        path: &Path,
        branch: &str,
        create: bool,
        base: Option<&str>,
    ) -> Result<()> {
        let path_arg = path.to_string_lossy();
        let mut args: Vec<&str> = vec!["worktree", "add"];
        if create {
            args.extend(["-b", branch, path_arg.as_ref()]);
            if let Some(base) = base {
                args.push(base);
            }
        } else {
            args.extend([path_arg.as_ref(), branch]);
        }
        debug!(?args, "adding worktree");
        self.run_checked(&args)?;
        Ok(())
    }

    #[instrument(skip_all, fields(remote, branch))]
    pub fn push(&self, remote: &str, branch: &str) -> Result<()> {
        debug!(remote, branch, "pushing");
        self.run_checked(&["push", "-u", remote, branch])?;
        Ok(())
    }

    /// Merge `branch` into the checked-out branch with a merge commit.
    ///
    /// A failed merge that leaves unmerged paths is a conflict, not an error.
    #[instrument(skip_all, fields(branch))]
    pub fn merge_no_ff(&self, branch: &str) -> Result<MergeResult> {
        let output = self.run(&["merge", "--no-ff", "--no-edit", branch])?;
        if output.status.success() {
            debug!(branch, "merged");
            return Ok(MergeResult::Merged);
        }
        let files: Vec<String> = self
            .status_porcelain()?
            .into_iter()
            .filter(StatusEntry::is_conflict)
            .map(|entry| entry.path)
            .collect();
        if files.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git merge {branch} failed: {}", stderr.trim()));
        }
        warn!(branch, conflicted = files.len(), "merge conflict");
        Ok(MergeResult::Conflict { files })
    }

    /// True while a merge is in progress (`MERGE_HEAD` exists).
    pub fn merge_in_progress(&self) -> Result<bool> {
        let output = self.run(&["rev-parse", "-q", "--verify", "MERGE_HEAD"])?;
        Ok(output.status.success())
    }

    pub fn merge_abort(&self) -> Result<()> {
        self.run_checked(&["merge", "--abort"])?;
        Ok(())
    }

    /// Delete a local branch that is fully merged (`git branch -d`).
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "-d", branch])?;
        Ok(())
    }

    /// Local branches whose tips are reachable from `target`.
    pub fn merged_branches(&self, target: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&[
            "branch",
            "--merged",
            target,
            "--format=%(refname:short)",
        ])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// True when `ancestor` is reachable from `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let output = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(anyhow!(
                    "git merge-base --is-ancestor {ancestor} {descendant} failed: {}",
                    stderr.trim()
                ))
            }
        }
    }

    fn ref_exists(&self, reference: &str) -> Result<bool> {
        let status = self
            .run(&["show-ref", "--verify", "--quiet", reference])?
            .status;
        Ok(status.success())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {} in {}", args.join(" "), self.workdir.display()))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

fn group_status(entries: &[StatusEntry]) -> WorktreeStatus {
    let mut status = WorktreeStatus::default();
    for entry in entries {
        if entry.code == "??" {
            status.untracked.push(entry.path.clone());
            continue;
        }
        if entry.is_conflict() {
            status.conflicted.push(entry.path.clone());
            continue;
        }
        let mut codes = entry.code.chars();
        let index = codes.next().unwrap_or(' ');
        let worktree = codes.next().unwrap_or(' ');
        if index != ' ' {
            status.staged.push(entry.path.clone());
        }
        if worktree != ' ' {
            status.modified.push(entry.path.clone());
        }
    }
    status
}

fn parse_worktree_list(out: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in out.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                branch: None,
            });
        } else if let Some(reference) = line.strip_prefix("branch ")
            && let Some(entry) = current.as_mut()
        {
            let short = reference.strip_prefix("refs/heads/").unwrap_or(reference);
            entry.branch = Some(short.to_string());
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestRepo, commit_file_in};

    #[test]
    fn parses_untracked_and_rename_lines() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(e.code, "??");
        assert_eq!(e.path, "foo.txt");

        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn groups_status_codes() {
        let entries: Vec<StatusEntry> = ["M  staged.rs", " M edited.rs", "MM both.rs", "UU clash.rs", "?? new.rs"]
            .iter()
            .map(|line| parse_status_line(line).expect("parse"))
            .collect();
        let status = group_status(&entries);
        assert_eq!(status.staged, vec!["staged.rs", "both.rs"]);
        assert_eq!(status.modified, vec!["edited.rs", "both.rs"]);
        assert_eq!(status.conflicted, vec!["clash.rs"]);
        assert_eq!(status.untracked, vec!["new.rs"]);
    }

    #[test]
    fn parses_worktree_porcelain() {
        let out = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\nworktree /wt/feature\nHEAD def\nbranch refs/heads/feature/x\n\nworktree /wt/detached\nHEAD 123\ndetached\n";
        let entries = parse_worktree_list(out);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].branch.as_deref(), Some("feature/x"));
        assert_eq!(entries[2].branch, None);
    }

    #[test]
    fn worktree_merge_and_conflict_round() {
        let repo = TestRepo::new();
        let git = Git::new(repo.path());
        assert_eq!(git.current_branch().expect("branch"), "main");

        let wt = repo.path().parent().expect("parent").join("wt-feature");
        git.worktree_add(&wt, "feature", true, Some("main"))
            .expect("add worktree");
        commit_file_in(&wt, "README.md", "feature\n", "feature edit");
        repo.commit_file("README.md", "main\n", "main edit");

        let listed = git.worktree_list().expect("list");
        assert!(listed.iter().any(|e| e.branch.as_deref() == Some("feature")));

        let result = git.merge_no_ff("feature").expect("merge");
        assert_eq!(
            result,
            MergeResult::Conflict {
                files: vec!["README.md".to_string()]
            }
        );
        assert!(git.merge_in_progress().expect("merge head"));
        git.merge_abort().expect("abort");
        assert!(git.worktree_status().expect("status").is_clean());
    }

    #[test]
    fn merged_branches_include_merged_topic() {
        let repo = TestRepo::new();
        let git = Git::new(repo.path());
        let wt = repo.path().parent().expect("parent").join("wt-topic");
        git.worktree_add(&wt, "topic", true, None).expect("add");
        commit_file_in(&wt, "topic.txt", "x\n", "topic");
        assert!(!git.is_ancestor("topic", "main").expect("before merge"));

        assert_eq!(git.merge_no_ff("topic").expect("merge"), MergeResult::Merged);
        assert!(git.is_ancestor("topic", "main").expect("after merge"));
        let merged = git.merged_branches("main").expect("merged");
        assert!(merged.contains(&"topic".to_string()));
        assert!(!git.remote_exists("origin").expect("remotes"));
        assert_eq!(git.remote_head_branch("origin").expect("head"), None);
    }
}
