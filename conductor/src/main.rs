//! Task scheduler and git integration engine for coding agents.
//!
//! Each `run --identity <lane>` loop claims tasks from `tasks.json`, drives an
//! agent through their steps in a dedicated worktree and merges the result
//! under a cross-process lock.

use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Result, anyhow, bail};
use clap::{Parser, Subcommand};
use conductor::context::{CONFIG_FILE, RunContext};
use conductor::exit_codes;
use conductor::io::config::load_config;
use conductor::io::paths::ConductorPaths;
use conductor::io::task_store::TaskStore;
use conductor::scheduler::{LoopLimits, record_step_done, run_loop};
use conductor::select::{SelectOutcome, select_from_store};
use conductor::task::TaskStatus;
use conductor::validate::validate_workspace;
use conductor::{logging, prime};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Schedule coding-agent tasks and integrate their branches"
)]
struct Cli {
    /// Workspace root holding `conductor.toml` and the task file.
    #[arg(long, global = true, env = "CONDUCTOR_ROOT", default_value = ".")]
    root: PathBuf,
    /// Configuration file (default `<root>/conductor.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one work loop per identity after recovering their orphaned tasks.
    Run {
        /// Scheduling identity (lane); repeat for several loops. Defaults to every configured lane.
        #[arg(long = "identity")]
        identities: Vec<String>,
        /// Stop each loop after this many iterations.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Stop each loop at the first idle poll.
        #[arg(long)]
        until_idle: bool,
    },
    /// Print the task an identity would pick up next, without claiming it.
    Select { identity: String },
    /// Promote ready tasks, apply answers and raise checkpoint questions.
    Prime,
    /// Return orphaned `in_progress` tasks to `ready_for_agent`.
    Recover {
        /// Only recover tasks of these lanes.
        #[arg(long = "lane")]
        lanes: Vec<String>,
    },
    /// Return a task to `ready_for_agent` with a fresh session and retry counters.
    Reset { task: String },
    /// Mark a step of a task as done.
    StepDone { task: String, step: String },
    /// Answer a checkpoint question.
    Answer { question: String, answer: Answer },
    /// Show status counts, the task tree and pending questions.
    Status,
    /// Check the configuration and task file.
    Validate,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Answer {
    Yes,
    No,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let default_config = cli.root.join(CONFIG_FILE);
    let config_path = cli.config.clone().unwrap_or(default_config);
    logging::init(match cli.command {
        Command::Run { .. } => "info",
        _ => "warn",
    });

    match cli.command {
        Command::Run {
            identities,
            max_iterations,
            until_idle,
        } => cmd_run(
            &cli.root,
            &config_path,
            identities,
            LoopLimits {
                max_iterations,
                until_idle,
            },
        ),
        Command::Select { identity } => {
            let store = open_store(&cli.root, &config_path)?;
            match select_from_store(&store, &identity)? {
                SelectOutcome::Available(task) => {
                    println!("{}", task.id);
                    Ok(exit_codes::OK)
                }
                SelectOutcome::Idle => {
                    println!("idle");
                    Ok(exit_codes::IDLE)
                }
                SelectOutcome::Complete => {
                    println!("complete");
                    Ok(exit_codes::IDLE)
                }
            }
        }
        Command::Prime => {
            let ctx = RunContext::from_root(&cli.root, Some(&config_path))?;
            let report = prime::prime(&ctx)?;
            for id in &report.promoted {
                println!("promoted {id}");
            }
            for id in &report.applied {
                println!("applied {id}");
            }
            for id in &report.questions {
                println!("asked {id}");
            }
            Ok(exit_codes::OK)
        }
        Command::Recover { lanes } => {
            let ctx = RunContext::from_root(&cli.root, Some(&config_path))?;
            for id in prime::recover(&ctx, &lanes)? {
                println!("recovered {id}");
            }
            Ok(exit_codes::OK)
        }
        Command::Reset { task } => {
            let ctx = RunContext::from_root(&cli.root, Some(&config_path))?;
            prime::reset(&ctx, &task)?;
            Ok(exit_codes::OK)
        }
        Command::StepDone { task, step } => {
            let store = open_store(&cli.root, &config_path)?;
            record_step_done(&store, &task, &step)?;
            Ok(exit_codes::OK)
        }
        Command::Answer { question, answer } => {
            let ctx = RunContext::from_root(&cli.root, Some(&config_path))?;
            prime::answer(&ctx, &question, matches!(answer, Answer::Yes))?;
            Ok(exit_codes::OK)
        }
        Command::Status => cmd_status(&cli.root, &config_path),
        Command::Validate => {
            let outcome = validate_workspace(&cli.root, &config_path)?;
            println!(
                "ok: {} task(s), {} checkpoint(s)",
                outcome.tasks, outcome.checkpoints
            );
            Ok(exit_codes::OK)
        }
    }
}

fn open_store(root: &Path, config_path: &Path) -> Result<TaskStore> {
    let config = load_config(config_path)?;
    Ok(TaskStore::new(ConductorPaths::new(root, &config).tasks_path))
}

fn cmd_run(
    root: &Path,
    config_path: &Path,
    identities: Vec<String>,
    limits: LoopLimits,
) -> Result<i32> {
    let ctx = RunContext::from_root(root, Some(config_path))?;
    let identities = if identities.is_empty() {
        ctx.config.lanes.keys().cloned().collect()
    } else {
        identities
    };
    if identities.is_empty() {
        bail!("no identity given and no lanes configured");
    }
    prime::recover(&ctx, &identities)?;

    let summaries = thread::scope(|scope| {
        let handles: Vec<_> = identities
            .iter()
            .map(|identity| {
                let ctx = &ctx;
                scope.spawn(move || run_loop(ctx, identity, limits, |_| {}))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().map_err(|_| anyhow!("work loop panicked")))
            .collect::<Result<Vec<_>>>()
    })?;

    let mut failed = false;
    for (identity, summary) in identities.iter().zip(&summaries) {
        info!(
            identity = %identity,
            iterations = summary.iterations,
            completed = summary.completed,
            errors = summary.errors,
            "work loop finished"
        );
        failed |= summary.errors > 0;
    }
    Ok(if failed {
        exit_codes::FAILED
    } else {
        exit_codes::OK
    })
}

fn cmd_status(root: &Path, config_path: &Path) -> Result<i32> {
    let ctx = RunContext::from_root(root, Some(config_path))?;
    let (_, graph) = ctx.store.load_graph()?;
    let counts = graph.status_counts();
    for status in TaskStatus::ALL {
        println!("{:<20} {}", status.as_str(), counts.get(&status).copied().unwrap_or(0));
    }
    println!();
    for task in graph.preorder() {
        let depth = graph.depth(&task.id).unwrap_or_default();
        let lane = task.agent_name.as_deref().unwrap_or("-");
        println!(
            "{}{} [{}] ({lane}) {}",
            "  ".repeat(depth),
            task.id,
            task.status,
            task.title
        );
    }
    let pending: Vec<_> = ctx
        .checkpoints
        .list()?
        .into_iter()
        .filter(|q| q.answer.is_none())
        .collect();
    if !pending.is_empty() {
        println!();
        for question in pending {
            println!("? {} {}", question.id, question.question);
        }
    }
    Ok(exit_codes::OK)
}
