//! Deterministic selection logic for the task list.

use serde::{Deserialize, Serialize};

use crate::error::{IneligibleReason, RalphError};
use crate::task::{Task, TaskStatus};

/// How `blockedBy` entries are enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockerPolicy {
    /// Any entry in `blockedBy` blocks the task.
    #[default]
    Strict,
    /// An entry stops blocking once the referenced task is `done`.
    /// Entries naming unknown tasks block forever.
    ResolveDone,
}

/// A `blockedBy` entry that names a task absent from the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingBlocker {
    pub task_id: String,
    pub missing: String,
}

/// Blockers of `task` that still prevent it from being selected.
pub fn unresolved_blockers<'a>(
    task: &'a Task,
    tasks: &[Task],
    policy: BlockerPolicy,
) -> Vec<&'a str> {
    task.blocked_by
        .iter()
        .filter(|blocker| match policy {
            BlockerPolicy::Strict => true,
            BlockerPolicy::ResolveDone => !tasks
                .iter()
                .any(|other| &other.id == *blocker && other.is_done()),
        })
        .map(String::as_str)
        .collect()
}

pub fn is_eligible(task: &Task, tasks: &[Task], policy: BlockerPolicy) -> bool {
    task.status == TaskStatus::Pending && unresolved_blockers(task, tasks, policy).is_empty()
}

/// Pick the eligible task with the lowest priority value.
///
/// Ties keep list order. Returns `None` when nothing is eligible.
pub fn next_task(tasks: &[Task], policy: BlockerPolicy) -> Option<&Task> {
    tasks
        .iter()
        .filter(|task| is_eligible(task, tasks, policy))
        .min_by_key(|task| task.priority)
}

/// Resolve an explicitly targeted task, ignoring priority ordering.
pub fn target_task<'a>(
    tasks: &'a [Task],
    id: &str,
    policy: BlockerPolicy,
) -> Result<&'a Task, RalphError> {
    let task = tasks
        .iter()
        .find(|task| task.id == id)
        .ok_or_else(|| RalphError::TaskNotFound { id: id.to_string() })?;
    if task.status != TaskStatus::Pending {
        return Err(RalphError::TaskNotEligible {
            id: id.to_string(),
            reason: IneligibleReason::Status(task.status),
        });
    }
    let blockers = unresolved_blockers(task, tasks, policy);
    if !blockers.is_empty() {
        return Err(RalphError::TaskNotEligible {
            id: id.to_string(),
            reason: IneligibleReason::Blocked(blockers.into_iter().map(str::to_string).collect()),
        });
    }
    Ok(task)
}

/// List blockers that reference ids missing from `tasks`, in list order.
pub fn dangling_blockers(tasks: &[Task]) -> Vec<DanglingBlocker> {
    let mut found = Vec::new();
    for task in tasks {
        for blocker in &task.blocked_by {
            if !tasks.iter().any(|other| &other.id == blocker) {
                found.push(DanglingBlocker {
                    task_id: task.id.clone(),
                    missing: blocker.clone(),
                });
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{blocked_task, task, task_with_status};

    #[test]
    fn empty_list_selects_nothing() {
        assert!(next_task(&[], BlockerPolicy::Strict).is_none());
    }

    #[test]
    fn selects_lowest_priority_value_first() {
        let tasks = vec![task("a", 3), task("b", 1), task("c", 2)];
        let selected = next_task(&tasks, BlockerPolicy::Strict).expect("selected");
        assert_eq!(selected.id, "b");
    }

    #[test]
    fn priority_ties_keep_list_order() {
        let tasks = vec![task("x", 1), task("y", 1), task("z", 0)];
        let selected = next_task(&tasks, BlockerPolicy::Strict).expect("selected");
        assert_eq!(selected.id, "z");

        let tasks = vec![task("x", 1), task("y", 1)];
        let selected = next_task(&tasks, BlockerPolicy::Strict).expect("selected");
        assert_eq!(selected.id, "x");
    }

    #[test]
    fn skips_non_pending_and_blocked_tasks() {
        let tasks = vec![
            task_with_status("done", 0, TaskStatus::Done),
            task_with_status("busy", 0, TaskStatus::InProgress),
            blocked_task("blocked", 0, &["done"]),
            task("open", 9),
        ];
        let selected = next_task(&tasks, BlockerPolicy::Strict).expect("selected");
        assert_eq!(selected.id, "open");
    }

    #[test]
    fn strict_policy_never_returns_blocked_or_non_pending() {
        let statuses = [TaskStatus::Pending, TaskStatus::InProgress, TaskStatus::Done];
        for (i, status) in statuses.iter().enumerate() {
            for blocked in [false, true] {
                let mut t = task_with_status("t", i as i64, *status);
                if blocked {
                    t.blocked_by = vec!["other".to_string()];
                }
                let tasks = vec![t, task_with_status("other", 5, TaskStatus::Done)];
                if let Some(selected) = next_task(&tasks, BlockerPolicy::Strict) {
                    assert_eq!(selected.status, TaskStatus::Pending);
                    assert!(selected.blocked_by.is_empty());
                }
            }
        }
    }

    #[test]
    fn resolve_done_policy_unblocks_when_blockers_finish() {
        let tasks = vec![
            task_with_status("first", 0, TaskStatus::Done),
            blocked_task("second", 0, &["first"]),
        ];
        assert!(next_task(&tasks, BlockerPolicy::Strict).is_none());
        let selected = next_task(&tasks, BlockerPolicy::ResolveDone).expect("selected");
        assert_eq!(selected.id, "second");
    }

    #[test]
    fn dangling_blocker_is_permanently_blocking() {
        let tasks = vec![blocked_task("t", 0, &["ghost-task"])];
        assert!(next_task(&tasks, BlockerPolicy::Strict).is_none());
        assert!(next_task(&tasks, BlockerPolicy::ResolveDone).is_none());
        assert_eq!(
            dangling_blockers(&tasks),
            vec![DanglingBlocker {
                task_id: "t".to_string(),
                missing: "ghost-task".to_string(),
            }]
        );
    }

    #[test]
    fn target_ignores_priority() {
        let tasks = vec![task("urgent", 0), task("later", 10)];
        let selected = target_task(&tasks, "later", BlockerPolicy::Strict).expect("target");
        assert_eq!(selected.id, "later");
    }

    #[test]
    fn target_reports_not_found_and_not_eligible() {
        let tasks = vec![
            task_with_status("finished", 0, TaskStatus::Done),
            blocked_task("stuck", 0, &["ghost"]),
        ];

        let err = target_task(&tasks, "missing", BlockerPolicy::Strict).unwrap_err();
        assert_eq!(
            err,
            RalphError::TaskNotFound {
                id: "missing".to_string()
            }
        );

        let err = target_task(&tasks, "finished", BlockerPolicy::Strict).unwrap_err();
        assert!(matches!(
            err,
            RalphError::TaskNotEligible {
                reason: IneligibleReason::Status(TaskStatus::Done),
                ..
            }
        ));

        let err = target_task(&tasks, "stuck", BlockerPolicy::Strict).unwrap_err();
        assert!(matches!(
            err,
            RalphError::TaskNotEligible {
                reason: IneligibleReason::Blocked(_),
                ..
            }
        ));
    }
}
