//! Human checkpoint questions.
//!
//! Checkpoint tasks are never handed to an agent. Priming raises a yes/no
//! question whose action binds each answer to a target status; a later priming
//! pass applies answered questions to the task store.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::task::TaskStatus;

/// What answering a question does to its task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuestionAction {
    SetStatus { yes: TaskStatus, no: TaskStatus },
}

impl QuestionAction {
    pub fn status_for(self, answer: bool) -> TaskStatus {
        match self {
            QuestionAction::SetStatus { yes, no } => {
                if answer {
                    yes
                } else {
                    no
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionMeta {
    pub task_id: String,
    /// Free-form category, e.g. `checkpoint`.
    pub kind: String,
    pub action: QuestionAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Question {
    pub id: String,
    pub agent_name: String,
    pub question: String,
    pub meta: QuestionMeta,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
    /// Set once the answer's action reached the task store.
    #[serde(default)]
    pub applied: bool,
}

impl Question {
    /// Answered but not yet applied.
    pub fn is_actionable(&self) -> bool {
        self.answer.is_some() && !self.applied
    }
}

/// Storage and notification for human questions.
pub trait CheckpointQueue: Send + Sync {
    /// Raise a question and return its id.
    fn ask(&self, agent_name: &str, question: &str, meta: QuestionMeta) -> Result<String>;
    fn get(&self, id: &str) -> Result<Option<Question>>;
    fn answer(&self, id: &str, yes: bool) -> Result<()>;
    fn list(&self) -> Result<Vec<Question>>;
    fn mark_applied(&self, id: &str) -> Result<()>;
}

/// One JSON document per question under a directory.
#[derive(Debug)]
pub struct FileCheckpointQueue {
    dir: PathBuf,
    counter: AtomicU64,
}

impl FileCheckpointQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            counter: AtomicU64::new(0),
        }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn next_id(&self, now: DateTime<Utc>) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!(
            "q-{}-{}-{seq}",
            now.format("%Y%m%dT%H%M%S%3f"),
            std::process::id()
        )
    }

    fn modify(&self, id: &str, apply: impl FnOnce(&mut Question) -> Result<()>) -> Result<()> {
        let mut question = self
            .get(id)?
            .ok_or_else(|| anyhow!("question '{id}' not found"))?;
        apply(&mut question)?;
        write_question(&self.path_for(id), &question)
    }
}

impl CheckpointQueue for FileCheckpointQueue {
    fn ask(&self, agent_name: &str, question: &str, meta: QuestionMeta) -> Result<String> {
        let now = Utc::now();
        let id = self.next_id(now);
        let record = Question {
            id: id.clone(),
            agent_name: agent_name.to_string(),
            question: question.to_string(),
            meta,
            created_at: now,
            answer: None,
            answered_at: None,
            applied: false,
        };
        write_question(&self.path_for(&id), &record)?;
        info!(question_id = %id, task_id = %record.meta.task_id, "question raised");
        Ok(id)
    }

    fn get(&self, id: &str) -> Result<Option<Question>> {
        read_question(&self.path_for(id))
    }

    fn answer(&self, id: &str, yes: bool) -> Result<()> {
        self.modify(id, |question| {
            if question.answer.is_some() {
                bail!("question '{id}' is already answered");
            }
            question.answer = Some(yes);
            question.answered_at = Some(Utc::now());
            Ok(())
        })?;
        debug!(question_id = %id, yes, "question answered");
        Ok(())
    }

    fn list(&self) -> Result<Vec<Question>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("list questions {}", self.dir.display()));
            }
        };
        let mut questions = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("list questions {}", self.dir.display()))?
                .path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(question) = read_question(&path)?
            {
                questions.push(question);
            }
        }
        questions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(questions)
    }

    fn mark_applied(&self, id: &str) -> Result<()> {
        self.modify(id, |question| {
            question.applied = true;
            Ok(())
        })
    }
}

fn read_question(path: &Path) -> Result<Option<Question>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read question {}", path.display())),
    };
    let question = serde_json::from_str(&contents)
        .with_context(|| format!("parse question {}", path.display()))?;
    Ok(Some(question))
}

fn write_question(path: &Path, question: &Question) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(question).context("serialize question")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("question path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension(format!("json.{}.tmp", std::process::id()));
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp question {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace question {}", path.display()))?;
    Ok(())
}
