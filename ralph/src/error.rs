//! Error taxonomy shared by the selector, executor, store and loop.
//!
//! Fatal variants (`ToolNotAvailable`, `StoreCorrupt`) travel inside
//! `anyhow::Error` and are recovered with `downcast_ref` at the CLI boundary.
//! The others are returned as values and never abort the loop on their own.

use std::path::PathBuf;

use thiserror::Error;

use crate::task::TaskStatus;

/// Why an explicitly targeted task cannot be attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IneligibleReason {
    Status(TaskStatus),
    Blocked(Vec<String>),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RalphError {
    #[error("task not found: {id}")]
    TaskNotFound { id: String },

    #[error("task {id} is not eligible: {}", describe_ineligible(.reason))]
    TaskNotEligible { id: String, reason: IneligibleReason },

    #[error("agent tool '{tool}' is not available (binary '{binary}' not found on PATH)")]
    ToolNotAvailable { tool: String, binary: String },

    #[error("{}", describe_process_failure(*.exit_code, *.timed_out))]
    ProcessFailed {
        exit_code: Option<i32>,
        timed_out: bool,
    },

    #[error("task store {} is corrupt: {detail}", .path.display())]
    StoreCorrupt { path: PathBuf, detail: String },
}

fn describe_ineligible(reason: &IneligibleReason) -> String {
    match reason {
        IneligibleReason::Status(status) => format!("status is {status}"),
        IneligibleReason::Blocked(blockers) => format!("blocked by {}", blockers.join(", ")),
    }
}

fn describe_process_failure(exit_code: Option<i32>, timed_out: bool) -> String {
    if timed_out {
        return "agent process timed out".to_string();
    }
    match exit_code {
        Some(code) => format!("agent process exited with status {code}"),
        None => "agent process was terminated by a signal".to_string(),
    }
}
