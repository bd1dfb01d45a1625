//! Task store load/save with schema + invariant validation.
//!
//! Every read reloads the whole file and every write replaces it atomically.
//! Writers inside one process are serialized by a mutex; across processes the
//! only guarantee is claim-before-work.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde_json::Value;
use tracing::debug;

use crate::core::graph::TaskGraph;
use crate::core::invariants::validate_invariants;
use crate::task::{GitConfig, Task, TaskFile};

const TASKS_SCHEMA: &str = include_str!("../../schemas/tasks.schema.json");

#[derive(Debug)]
pub struct TaskStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and validate the task file.
    pub fn load(&self) -> Result<TaskFile> {
        load_tasks(&self.path)
    }

    /// Load the task file as an arena graph.
    pub fn load_graph(&self) -> Result<(GitConfig, TaskGraph)> {
        let file = self.load()?;
        let graph = TaskGraph::from_tree(file.tasks)?;
        Ok((file.git, graph))
    }

    pub fn save(&self, file: &TaskFile) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("task store lock poisoned"))?;
        write_tasks(&self.path, file)
    }

    /// Reload, mutate and save under the store lock.
    ///
    /// Nothing is written when `apply` fails or leaves the tree unchanged.
    pub fn update<T>(
        &self,
        apply: impl FnOnce(&mut TaskGraph, &GitConfig) -> Result<T>,
    ) -> Result<T> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("task store lock poisoned"))?;
        let file = load_tasks(&self.path)?;
        let mut graph = TaskGraph::from_tree(file.tasks.clone())?;
        let value = apply(&mut graph, &file.git)?;
        let tasks = graph.into_tree();
        // Unchanged trees are not rewritten, so idle polls never clobber concurrent writers.
        if tasks != file.tasks {
            write_tasks(
                &self.path,
                &TaskFile {
                    git: file.git,
                    tasks,
                },
            )?;
        }
        Ok(value)
    }

    /// Reload, mutate one task and save.
    pub fn update_task<T>(&self, id: &str, apply: impl FnOnce(&mut Task) -> Result<T>) -> Result<T> {
        self.update(|graph, _| {
            let task = graph
                .get_mut(id)
                .ok_or_else(|| anyhow!("task '{id}' not found"))?;
            apply(task)
        })
    }

    /// Fresh copy of one task.
    pub fn task(&self, id: &str) -> Result<Task> {
        let (_, graph) = self.load_graph()?;
        graph
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("task '{id}' not found"))
    }
}

/// Load and validate a task file from disk (schema + invariants).
pub fn load_tasks(path: &Path) -> Result<TaskFile> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read tasks {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse tasks {}", path.display()))?;
    validate_schema(&value).with_context(|| format!("validate tasks {}", path.display()))?;
    let file: TaskFile = serde_json::from_value(value)
        .with_context(|| format!("deserialize tasks {}", path.display()))?;
    let errors = validate_invariants(&file.tasks);
    if !errors.is_empty() {
        return Err(anyhow!("task invariants failed: {}", errors.join("; ")));
    }
    debug!(path = %path.display(), roots = file.tasks.len(), "tasks loaded");
    Ok(file)
}

/// Atomically write a task file (temp file + rename).
pub fn write_tasks(path: &Path, file: &TaskFile) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(file).context("serialize tasks")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("tasks path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    // Unique per process so concurrent schedulers never share a temp file.
    let tmp_path = path.with_extension(format!("json.{}.tmp", std::process::id()));
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp tasks {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace tasks {}", path.display()))?;
    Ok(())
}

fn validate_schema(value: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(TASKS_SCHEMA).context("parse embedded tasks schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile tasks schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("tasks schema validation failed: {}", messages.join("; "));
    }
    Ok(())
}
