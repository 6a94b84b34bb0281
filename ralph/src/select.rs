//! Selection helpers for `ralph select` and `ralph run --dry-run`.

use anyhow::Result;

use crate::core::selector::{BlockerPolicy, next_task, target_task};
use crate::error::RalphError;
use crate::exit_codes;
use crate::io::task_store::TaskStore;
use crate::task::{Task, TaskDocument};

/// Structured selection outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Eligible task selected.
    Selected(SelectedTask),
    /// Every task is done (or the target already is).
    Complete,
    /// Open tasks remain but none is eligible. Empty when the store has no tasks.
    NoEligible { open: Vec<String> },
    /// The explicit target cannot be attempted.
    TargetUnavailable(RalphError),
}

impl SelectOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            SelectOutcome::Selected(_) | SelectOutcome::Complete => exit_codes::OK,
            SelectOutcome::NoEligible { .. } => exit_codes::NO_ELIGIBLE_TASK,
            SelectOutcome::TargetUnavailable(_) => exit_codes::TARGET_UNAVAILABLE,
        }
    }
}

/// Minimal selected task metadata for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedTask {
    pub id: String,
    pub title: String,
    pub priority: i64,
}

impl From<&Task> for SelectedTask {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            priority: task.priority,
        }
    }
}

/// Select from an in-memory document.
pub fn select_task(
    doc: &TaskDocument,
    target: Option<&str>,
    policy: BlockerPolicy,
) -> SelectOutcome {
    if let Some(target) = target {
        return match target_task(&doc.tasks, target, policy) {
            Ok(task) => SelectOutcome::Selected(task.into()),
            Err(_) if doc.find(target).is_some_and(Task::is_done) => SelectOutcome::Complete,
            Err(err) => SelectOutcome::TargetUnavailable(err),
        };
    }
    if let Some(task) = next_task(&doc.tasks, policy) {
        return SelectOutcome::Selected(task.into());
    }
    if !doc.tasks.is_empty() && doc.all_done() {
        return SelectOutcome::Complete;
    }
    SelectOutcome::NoEligible {
        open: doc
            .tasks
            .iter()
            .filter(|task| !task.is_done())
            .map(|task| task.id.clone())
            .collect(),
    }
}

/// Load the store and select.
pub fn select_from_store<S: TaskStore + ?Sized>(
    store: &S,
    target: Option<&str>,
    policy: BlockerPolicy,
) -> Result<SelectOutcome> {
    let doc = store.load()?;
    Ok(select_task(&doc, target, policy))
}
