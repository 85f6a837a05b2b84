//! Stable exit codes for `refiner` CLI commands.

/// Command succeeded; for `run` and `eval`, the task was solved.
pub const OK: i32 = 0;
/// Invalid input (config, plan, task, program file) or any other error.
pub const INVALID: i32 = 1;
/// `run` or `eval` finished normally without solving the task.
pub const UNSOLVED: i32 = 2;
