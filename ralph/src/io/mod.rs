//! I/O helpers for ralph commands.

pub mod config;
pub mod executor;
pub mod init;
pub mod iteration_log;
pub mod process;
pub mod progress_log;
pub mod prompt;
pub mod task_store;
