//! Side-effecting adapters: files, git, subprocesses and prompt rendering.

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod git;
pub mod merge_lock;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod retries;
pub mod task_store;
pub mod workspace;
