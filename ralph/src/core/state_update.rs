//! Loop-owned status transitions for task documents.
//!
//! All functions take the timestamp explicitly so transitions stay
//! deterministic under test.

use serde::{Deserialize, Serialize};

use crate::error::{IneligibleReason, RalphError};
use crate::task::{Task, TaskDocument, TaskStatus};

/// What happens to a task whose attempt failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Put the task back to `pending` so it can be selected again.
    #[default]
    Revert,
    /// Leave the task `in-progress` for manual intervention.
    Hold,
}

/// `pending` -> `in-progress`, immediately before dispatch.
pub fn mark_in_progress(doc: &mut TaskDocument, id: &str, now: &str) -> Result<(), RalphError> {
    let task = find(doc, id)?;
    if task.status != TaskStatus::Pending {
        return Err(RalphError::TaskNotEligible {
            id: id.to_string(),
            reason: IneligibleReason::Status(task.status),
        });
    }
    task.status = TaskStatus::InProgress;
    task.updated_at = Some(now.to_string());
    Ok(())
}

/// `in-progress` -> `done` after a successful attempt.
pub fn mark_done(
    doc: &mut TaskDocument,
    id: &str,
    note: &str,
    now: &str,
) -> Result<(), RalphError> {
    let task = find(doc, id)?;
    expect_in_progress(task)?;
    task.status = TaskStatus::Done;
    add_note(task, note, now);
    Ok(())
}

/// Record a failed attempt and apply `policy`.
pub fn apply_failure(
    doc: &mut TaskDocument,
    id: &str,
    policy: FailurePolicy,
    note: &str,
    now: &str,
) -> Result<(), RalphError> {
    let task = find(doc, id)?;
    expect_in_progress(task)?;
    if policy == FailurePolicy::Revert {
        task.status = TaskStatus::Pending;
    }
    add_note(task, note, now);
    Ok(())
}

/// Reset tasks left `in-progress` by an earlier run whose outcome is unknown.
///
/// Returns the reset ids in list order.
pub fn reset_stale_in_progress(doc: &mut TaskDocument, now: &str) -> Vec<String> {
    let mut reset = Vec::new();
    for task in &mut doc.tasks {
        if task.status == TaskStatus::InProgress {
            task.status = TaskStatus::Pending;
            add_note(task, "reset to pending: previous attempt outcome unknown", now);
            reset.push(task.id.clone());
        }
    }
    reset
}

pub fn add_note(task: &mut Task, text: &str, now: &str) {
    task.notes.push(format!("{now}: {text}"));
    task.updated_at = Some(now.to_string());
}

fn find<'a>(doc: &'a mut TaskDocument, id: &str) -> Result<&'a mut Task, RalphError> {
    doc.find_mut(id)
        .ok_or_else(|| RalphError::TaskNotFound { id: id.to_string() })
}

fn expect_in_progress(task: &Task) -> Result<(), RalphError> {
    if task.status == TaskStatus::InProgress {
        return Ok(());
    }
    Err(RalphError::TaskNotEligible {
        id: task.id.clone(),
        reason: IneligibleReason::Status(task.status),
    })
}
