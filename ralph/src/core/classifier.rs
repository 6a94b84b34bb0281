//! Deterministic interpretation of an agent attempt.

use crate::core::types::ExecutionResult;
use crate::error::RalphError;

/// What an attempt means for the selected task and the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptVerdict {
    /// Clean exit with the completion marker: the loop ends.
    Complete,
    /// Clean exit without the marker: the task is done, the loop continues.
    Succeeded,
    /// Non-zero exit, signal, or timeout. A marker in the output is ignored.
    Failed(RalphError),
}

pub fn classify_execution(result: &ExecutionResult) -> AttemptVerdict {
    if !result.succeeded() {
        return AttemptVerdict::Failed(RalphError::ProcessFailed {
            exit_code: result.exit_code,
            timed_out: result.timed_out,
        });
    }
    if result.completion_signal {
        AttemptVerdict::Complete
    } else {
        AttemptVerdict::Succeeded
    }
}
