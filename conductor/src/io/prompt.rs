//! Prompt rendering for agent invocations.
//!
//! Templates live next to this file and are embedded at compile time.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::core::steps::done_steps;
use crate::core::types::WorktreeStatus;
use crate::task::{Step, Task};

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const TASK_TEMPLATE: &str = include_str!("prompts/task.md");
const CONTINUATION_TEMPLATE: &str = include_str!("prompts/continuation.md");
const COMMIT_TEMPLATE: &str = include_str!("prompts/commit.md");
const CONFLICT_TEMPLATE: &str = include_str!("prompts/conflict.md");

/// Template engine wrapper around minijinja.
#[derive(Debug)]
pub struct Prompts {
    env: Environment<'static>,
}

impl Prompts {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        for (name, source) in [
            ("system", SYSTEM_TEMPLATE),
            ("task", TASK_TEMPLATE),
            ("continuation", CONTINUATION_TEMPLATE),
            ("commit", COMMIT_TEMPLATE),
            ("conflict", CONFLICT_TEMPLATE),
        ] {
            env.add_template(name, source)
                .with_context(|| format!("load prompt template '{name}'"))?;
        }
        Ok(Self { env })
    }

    /// `branch` is the branch bound to `workdir`, which differs from the task
    /// branch while resolving a merge conflict in the target checkout.
    pub fn system(
        &self,
        agent_name: &str,
        task: &Task,
        workdir: &Path,
        branch: Option<&str>,
    ) -> Result<String> {
        self.render(
            "system",
            context! {
                agent_name => agent_name,
                task_id => &task.id,
                workdir => workdir.display().to_string(),
                branch => branch,
                has_steps => !task.steps.is_empty(),
            },
        )
    }

    /// First prompt for a task; `step` is the step to start with, if any.
    pub fn task(&self, task: &Task, step: Option<&Step>) -> Result<String> {
        self.render("task", context! { task => task, step => step })
    }

    /// Prompt to move on after `completed`; only done steps are listed as context.
    pub fn continuation(&self, task: &Task, completed: &str, next: &Step) -> Result<String> {
        self.render(
            "continuation",
            context! {
                task => task,
                completed => completed,
                done_steps => done_steps(task),
                step => next,
            },
        )
    }

    pub fn commit(&self, task: &Task, status: &WorktreeStatus) -> Result<String> {
        let files: Vec<&String> = status
            .staged
            .iter()
            .chain(&status.modified)
            .chain(&status.untracked)
            .chain(&status.conflicted)
            .collect();
        self.render(
            "commit",
            context! {
                task => task,
                summary => status.summary(),
                files => files,
                branch => task.branch.as_deref().unwrap_or("the task branch"),
            },
        )
    }

    pub fn conflict(&self, task: &Task, source: &str, target: &str, files: &[String]) -> Result<String> {
        self.render(
            "conflict",
            context! {
                task => task,
                source => source,
                target => target,
                files => files,
            },
        )
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self.env.get_template(name)?;
        let rendered = template
            .render(ctx)
            .with_context(|| format!("render prompt '{name}'"))?;
        Ok(rendered.trim().to_string() + "\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::StepStatus;
    use crate::test_support::{task, task_with_steps};

    #[test]
    fn task_prompt_includes_criteria_notes_and_step() {
        let mut t = task_with_steps("t1", &["s1", "s2"]);
        t.instructions = "Build the parser.".to_string();
        t.acceptance_criteria = vec!["tests pass".to_string()];
        t.ai_notes = vec!["commit retry 1/3".to_string()];
        let prompts = Prompts::new().expect("prompts");

        let rendered = prompts.task(&t, t.steps.first()).expect("render");
        assert!(rendered.contains("# t1"));
        assert!(rendered.contains("Build the parser."));
        assert!(rendered.contains("- tests pass"));
        assert!(rendered.contains("- commit retry 1/3"));
        assert!(rendered.contains("<step id=\"s1\">"));
        assert!(!rendered.contains("s2"));
    }

    #[test]
    fn continuation_lists_only_done_steps() {
        let mut t = task_with_steps("t1", &["s1", "s2", "s3"]);
        t.steps[0].status = StepStatus::Done;
        let prompts = Prompts::new().expect("prompts");

        let rendered = prompts
            .continuation(&t, "s1", &t.steps[1])
            .expect("render");
        assert!(rendered.contains("<completed>\n- s1:"));
        assert!(rendered.contains("<step id=\"s2\">"));
        assert!(!rendered.contains("s3"));
        assert!(rendered.contains("conductor step-done t1 s2"));
    }

    #[test]
    fn conflict_prompt_names_both_branches_and_forbids_switching() {
        let mut t = task("t1");
        t.instructions = "Add the cache layer.".to_string();
        let prompts = Prompts::new().expect("prompts");
        let rendered = prompts
            .conflict(&t, "feature/cache", "release", &["src/lib.rs".to_string()])
            .expect("render");
        assert!(rendered.contains("`feature/cache` into `release`"));
        assert!(rendered.contains("Do not switch branches"));
        assert!(rendered.contains("- src/lib.rs"));
        assert!(rendered.contains("Add the cache layer."));
    }

    #[test]
    fn system_prompt_mentions_step_protocol_only_for_stepped_tasks() {
        let prompts = Prompts::new().expect("prompts");
        let plain = prompts
            .system("lane-a", &task("t1"), Path::new("/wt"), Some("release"))
            .expect("render");
        assert!(!plain.contains("step-done"));
        assert!(plain.contains("bound to `release`"));
        let stepped = prompts
            .system("lane-a", &task_with_steps("t2", &["s1"]), Path::new("/wt"), None)
            .expect("render");
        assert!(stepped.contains("conductor step-done t2 <step-id>"));
    }

    #[test]
    fn commit_prompt_lists_dirty_files() {
        let mut t = task("t1");
        t.branch = Some("feature".to_string());
        let status = WorktreeStatus {
            untracked: vec!["notes.txt".to_string()],
            ..WorktreeStatus::default()
        };
        let rendered = Prompts::new()
            .expect("prompts")
            .commit(&t, &status)
            .expect("render");
        assert!(rendered.contains("(1 untracked)"));
        assert!(rendered.contains("- notes.txt"));
        assert!(rendered.contains("branch `feature`"));
    }
}
