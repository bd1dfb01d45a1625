//! Agent abstraction and the subprocess-backed provider.
//!
//! The [`Agent`] trait decouples the work loop from the concrete vendor CLI.
//! Tests use scripted agents that return predetermined results without
//! spawning processes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{AgentRequest, AgentResult};
use crate::io::config::{ConductorConfig, ProviderConfig};
use crate::io::process::run_command_streaming;

/// Abstraction over agent execution backends.
pub trait Agent: Send + Sync {
    /// Run one invocation, streaming stdout lines to `on_output`.
    ///
    /// `Err` means the agent could not be started at all; an agent that ran and
    /// failed reports `Ok` with `success == false`.
    fn run(&self, request: &AgentRequest, on_output: &mut dyn FnMut(&str)) -> Result<AgentResult>;
}

/// Providers by name.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a [`CommandAgent`] for every configured provider.
    ///
    /// `root` is exported to agents as `CONDUCTOR_ROOT` so `conductor step-done`
    /// finds the task store from inside a worktree.
    pub fn from_config(config: &ConductorConfig, root: &Path) -> Result<Self> {
        let mut registry = Self::new();
        for (name, provider) in &config.providers {
            let agent = CommandAgent::from_config(name, provider)
                .with_context(|| format!("configure provider '{name}'"))?
                .with_root(root);
            registry.insert(name.clone(), Arc::new(agent));
        }
        Ok(registry)
    }

    pub fn insert(&mut self, name: impl Into<String>, agent: Arc<dyn Agent>) {
        self.agents.insert(name.into(), agent);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Agent>> {
        self.agents
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown provider '{name}'"))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }
}

/// Agent that spawns a configured command, feeding the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    name: String,
    program: String,
    args: Vec<String>,
    resume_args: Vec<String>,
    system_prompt_args: Vec<String>,
    session_pattern: Option<Regex>,
    timeout: Duration,
    output_limit_bytes: usize,
    root: Option<PathBuf>,
}

impl CommandAgent {
    pub fn from_config(name: &str, config: &ProviderConfig) -> Result<Self> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("provider '{name}' has an empty command"))?;
        let session_pattern = config
            .session_pattern
            .as_deref()
            .map(|raw| {
                Regex::new(raw).with_context(|| format!("compile session pattern '{raw}'"))
            })
            .transpose()?;
        Ok(Self {
            name: name.to_string(),
            program: program.clone(),
            args: args.to_vec(),
            resume_args: config.resume_args.clone(),
            system_prompt_args: config.system_prompt_args.clone(),
            session_pattern,
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
            root: None,
        })
    }

    pub fn with_root(mut self, root: &Path) -> Self {
        self.root = Some(root.to_path_buf());
        self
    }

    /// Full argument list and stdin payload for one request.
    fn invocation(&self, request: &AgentRequest) -> (Vec<String>, String) {
        let mut args = self.args.clone();
        if let Some(session_id) = request.session_id.as_deref() {
            args.extend(
                self.resume_args
                    .iter()
                    .map(|arg| arg.replace("{session_id}", session_id)),
            );
        }
        let system_prompt = request.system_prompt.trim();
        let mut stdin = String::new();
        if !system_prompt.is_empty() {
            if self.system_prompt_args.is_empty() {
                stdin.push_str(system_prompt);
                stdin.push_str("\n\n");
            } else {
                args.extend(
                    self.system_prompt_args
                        .iter()
                        .map(|arg| arg.replace("{system_prompt}", system_prompt)),
                );
            }
        }
        stdin.push_str(&request.prompt);
        (args, stdin)
    }

    fn extract_session(&self, stdout: &str) -> Option<String> {
        let pattern = self.session_pattern.as_ref()?;
        pattern
            .captures_iter(stdout)
            .filter_map(|caps| caps.get(1))
            .last()
            .map(|m| m.as_str().to_string())
    }
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(provider = %self.name, task_id = ?request.task_id, resume = request.session_id.is_some()))]
    fn run(&self, request: &AgentRequest, on_output: &mut dyn FnMut(&str)) -> Result<AgentResult> {
        info!(workdir = %request.workdir.display(), "starting agent");
        let (args, stdin) = self.invocation(request);
        let mut cmd = Command::new(&self.program);
        cmd.args(&args).current_dir(&request.workdir);
        if let Some(task_id) = &request.task_id {
            cmd.env("CONDUCTOR_TASK_ID", task_id);
        }
        if let Some(agent_name) = &request.agent_name {
            cmd.env("CONDUCTOR_AGENT_NAME", agent_name);
        }
        if let Some(root) = &self.root {
            cmd.env("CONDUCTOR_ROOT", root);
        }

        let output = run_command_streaming(
            cmd,
            Some(stdin.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
            on_output,
        )
        .with_context(|| format!("run provider '{}'", self.name))?;

        let stdout = output.stdout_lossy();
        let session_id = self
            .extract_session(&stdout)
            .or_else(|| request.session_id.clone());

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "agent timed out");
            return Ok(AgentResult {
                success: false,
                output: stdout,
                error: Some(format!(
                    "agent timed out after {}s",
                    self.timeout.as_secs()
                )),
                session_id,
            });
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            let stderr = output.stderr_lossy();
            return Ok(AgentResult {
                success: false,
                output: stdout,
                error: Some(format!(
                    "agent exited with status {:?}: {}",
                    output.status.code(),
                    stderr.trim()
                )),
                session_id,
            });
        }

        debug!(session_id = ?session_id, "agent completed");
        Ok(AgentResult {
            success: true,
            output: stdout,
            error: None,
            session_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(session_id: Option<&str>) -> AgentRequest {
        AgentRequest {
            system_prompt: "be careful".to_string(),
            prompt: "do the thing".to_string(),
            workdir: std::env::temp_dir(),
            session_id: session_id.map(str::to_string),
            task_id: Some("t1".to_string()),
            agent_name: Some("lane".to_string()),
        }
    }

    fn provider(script: &str) -> ProviderConfig {
        ProviderConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            session_pattern: Some(r"session: (\S+)".to_string()),
            timeout_secs: 10,
            ..ProviderConfig::default()
        }
    }

    #[test]
    fn invocation_substitutes_placeholders() {
        let config = ProviderConfig {
            command: vec!["agent".to_string(), "-p".to_string()],
            resume_args: vec!["--resume".to_string(), "{session_id}".to_string()],
            system_prompt_args: vec!["--system={system_prompt}".to_string()],
            ..ProviderConfig::default()
        };
        let agent = CommandAgent::from_config("x", &config).expect("agent");
        let (args, stdin) = agent.invocation(&request(Some("abc")));
        assert_eq!(args, vec!["-p", "--resume", "abc", "--system=be careful"]);
        assert_eq!(stdin, "do the thing");

        let (args, stdin) = agent.invocation(&request(None));
        assert_eq!(args, vec!["-p", "--system=be careful"]);
        assert_eq!(stdin, "do the thing");
    }

    #[test]
    fn system_prompt_goes_to_stdin_without_args() {
        let agent = CommandAgent::from_config("x", &provider("cat")).expect("agent");
        let (_, stdin) = agent.invocation(&request(None));
        assert_eq!(stdin, "be careful\n\ndo the thing");
    }

    #[test]
    fn captures_session_and_streams_output() {
        let agent = CommandAgent::from_config(
            "sh",
            &provider("echo \"task=$CONDUCTOR_TASK_ID root=$CONDUCTOR_ROOT\"; echo 'session: s-42'"),
        )
        .expect("agent")
        .with_root(Path::new("/srv/work"));
        let mut lines = Vec::new();
        let result = agent
            .run(&request(None), &mut |line| lines.push(line.to_string()))
            .expect("run");
        assert!(result.success);
        assert_eq!(result.session_id.as_deref(), Some("s-42"));
        assert_eq!(lines, vec!["task=t1 root=/srv/work", "session: s-42"]);
    }

    #[test]
    fn non_zero_exit_is_failed_result_keeping_resumed_session() {
        let agent = CommandAgent::from_config("sh", &provider("echo boom >&2; exit 3"))
            .expect("agent");
        let result = agent.run(&request(Some("old")), &mut |_| {}).expect("run");
        assert!(!result.success);
        assert_eq!(result.session_id.as_deref(), Some("old"));
        let error = result.error.expect("error");
        assert!(error.contains("Some(3)"));
        assert!(error.contains("boom"));
    }

    #[test]
    fn missing_program_is_an_error() {
        let config = ProviderConfig {
            command: vec!["definitely-not-a-real-agent-binary".to_string()],
            ..ProviderConfig::default()
        };
        let agent = CommandAgent::from_config("ghost", &config).expect("agent");
        let mut req = request(None);
        req.workdir = PathBuf::from(".");
        assert!(agent.run(&req, &mut |_| {}).is_err());
    }

    #[test]
    fn registry_reports_unknown_provider() {
        let registry = AgentRegistry::new();
        let err = registry.get("nope").err().expect("missing");
        assert!(err.to_string().contains("unknown provider 'nope'"));
    }
}
