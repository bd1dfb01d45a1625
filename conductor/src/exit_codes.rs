//! Stable exit codes for conductor CLI commands.

/// Command succeeded or a task is available.
pub const OK: i32 = 0;
/// Invalid configuration or task file, or any other error.
pub const INVALID: i32 = 1;
/// `conductor select` found nothing to pick up, or `run --until-idle` did no work.
pub const IDLE: i32 = 2;
/// `conductor run` finished with iteration errors.
pub const FAILED: i32 = 3;
