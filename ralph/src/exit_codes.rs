//! Stable exit codes for ralph CLI commands.

/// Command succeeded, every task is done, or the completion signal was received.
pub const OK: i32 = 0;
/// Invalid config, arguments or any other error.
pub const INVALID: i32 = 1;
/// `ralph run` reached `max_iterations` before all tasks were done.
pub const MAX_ITERATIONS: i32 = 2;
/// Open tasks remain but none is eligible, or there are no tasks.
pub const NO_ELIGIBLE_TASK: i32 = 3;
/// The budget guardian denied the next attempt.
pub const BUDGET_EXCEEDED: i32 = 4;
/// `--task-id` names a missing, blocked or in-progress task.
pub const TARGET_UNAVAILABLE: i32 = 5;
/// The agent binary is not on `PATH`.
pub const TOOL_NOT_AVAILABLE: i32 = 6;
/// The task store failed to parse or validate.
pub const STORE_CORRUPT: i32 = 7;
/// A failed task is held `in-progress` (`on_failure = "hold"`).
pub const TASK_HELD: i32 = 8;
/// Stopped by SIGINT.
pub const INTERRUPTED: i32 = 130;
