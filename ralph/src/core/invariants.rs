//! Semantic invariants not expressible via JSON Schema.

use std::collections::HashSet;

use crate::task::{TaskDocument, TaskStatus};

/// Check semantic invariants of a task document:
/// - Ids are non-empty, `[A-Za-z0-9._-]` only, and unique
/// - No task lists itself in `blockedBy`
pub fn validate_invariants(doc: &TaskDocument) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for (index, task) in doc.tasks.iter().enumerate() {
        if let Err(err) = validate_task_id(&task.id) {
            errors.push(format!("tasks[{index}]: {err}"));
        }
        if !seen.insert(task.id.as_str()) {
            errors.push(format!("tasks[{index}]: duplicate id '{}'", task.id));
        }
        if task.blocked_by.iter().any(|blocker| blocker == &task.id) {
            errors.push(format!("tasks[{index}]: '{}' is blocked by itself", task.id));
        }
    }
    errors
}

/// Non-fatal findings worth reporting to the operator.
pub fn invariant_warnings(doc: &TaskDocument) -> Vec<String> {
    let in_progress: Vec<&str> = doc
        .tasks
        .iter()
        .filter(|task| task.status == TaskStatus::InProgress)
        .map(|task| task.id.as_str())
        .collect();
    if in_progress.len() > 1 {
        return vec![format!(
            "{} tasks are in-progress at once: {}",
            in_progress.len(),
            in_progress.join(", ")
        )];
    }
    Vec::new()
}

pub fn validate_task_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("id must not be empty".to_string());
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(format!("id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}
