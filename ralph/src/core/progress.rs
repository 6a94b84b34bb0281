//! Task progress statistics for status reporting.

use serde::Serialize;

use crate::core::selector::{BlockerPolicy, is_eligible, unresolved_blockers};
use crate::task::{Task, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressStats {
    pub total: usize,
    pub done: usize,
    pub in_progress: usize,
    pub pending: usize,
    /// Pending tasks with at least one unresolved blocker.
    pub blocked: usize,
    /// Pending tasks the selector could pick right now.
    pub eligible: usize,
    pub percent_complete: f64,
}

pub fn compute_progress(tasks: &[Task], policy: BlockerPolicy) -> ProgressStats {
    let count = |status: TaskStatus| tasks.iter().filter(|task| task.status == status).count();
    let done = count(TaskStatus::Done);
    let blocked = tasks
        .iter()
        .filter(|task| {
            task.status == TaskStatus::Pending
                && !unresolved_blockers(task, tasks, policy).is_empty()
        })
        .count();
    let eligible = tasks
        .iter()
        .filter(|task| is_eligible(task, tasks, policy))
        .count();
    let percent_complete = if tasks.is_empty() {
        0.0
    } else {
        // One decimal place, matching the status report.
        (done as f64 / tasks.len() as f64 * 1000.0).round() / 10.0
    };
    ProgressStats {
        total: tasks.len(),
        done,
        in_progress: count(TaskStatus::InProgress),
        pending: count(TaskStatus::Pending),
        blocked,
        eligible,
        percent_complete,
    }
}
