//! Shared deterministic types for loop core logic.
//!
//! These types define stable contracts between the executor and the loop. They
//! carry no I/O handles so they can be built freely in tests.

use std::time::Duration;

use serde::Serialize;

/// Literal marker an agent prints when it believes all work is finished.
pub const COMPLETION_MARKER: &str = "<promise>COMPLETE</promise>";

pub fn contains_completion_marker(text: &str) -> bool {
    text.contains(COMPLETION_MARKER)
}

/// Outcome of one external agent process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    /// `None` when the process was killed by a signal (including timeout kills).
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr, in arrival order, up to the output limit.
    pub output: String,
    pub completion_signal: bool,
    pub timed_out: bool,
    #[serde(skip)]
    pub duration: Duration,
    /// Bytes dropped from `output` after the limit was reached.
    pub output_truncated: usize,
}

impl ExecutionResult {
    /// Build a result from captured text, detecting the marker.
    pub fn from_output(exit_code: Option<i32>, output: impl Into<String>) -> Self {
        let output = output.into();
        Self {
            exit_code,
            completion_signal: contains_completion_marker(&output),
            output,
            timed_out: false,
            duration: Duration::ZERO,
            output_truncated: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Wall-clock duration in milliseconds, saturating at `u64::MAX`.
    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}
