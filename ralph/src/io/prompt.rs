//! Prompt assembly: the tool's base prompt followed by the selected task.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::io::config::ToolConfig;
use crate::io::executor::Tool;
use crate::task::Task;

/// Base prompt location for `tool`, relative paths resolved against `root`.
pub fn prompt_path(root: &Path, tool: Tool, config: &ToolConfig) -> PathBuf {
    match &config.prompt_file {
        Some(path) => root.join(path),
        None => root.join(tool.default_prompt_file()),
    }
}

pub fn load_base_prompt(path: &Path) -> Result<String> {
    if !path.is_file() {
        return Err(anyhow!(
            "prompt file {} not found (create it or set prompt_file in .ralph/config.toml)",
            path.display()
        ));
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read prompt {}", path.display()))?;
    debug!(path = %path.display(), bytes = contents.len(), "loaded base prompt");
    Ok(contents)
}

/// Append a plain-text section describing `task` to `base`.
pub fn assemble_prompt(base: &str, task: &Task) -> String {
    let mut prompt = base.trim_end().to_string();
    if !prompt.is_empty() {
        prompt.push_str("\n\n");
    }
    prompt.push_str("## Current Task\n\n");
    // Writing into a String cannot fail.
    let _ = writeln!(prompt, "ID: {}", task.id);
    if !task.title.is_empty() {
        let _ = writeln!(prompt, "Title: {}", task.title);
    }
    let _ = writeln!(prompt, "Priority: {}", task.priority);

    if !task.description.trim().is_empty() {
        let _ = write!(prompt, "\nDescription:\n{}\n", task.description.trim());
    }
    push_list(&mut prompt, "Acceptance criteria", &task.acceptance_criteria);
    push_list(&mut prompt, "Depends on", &task.depends_on);
    push_list(&mut prompt, "Notes from previous attempts", &task.notes);
    prompt
}

fn push_list(prompt: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let _ = write!(prompt, "\n{heading}:\n");
    for item in items {
        let _ = writeln!(prompt, "- {item}");
    }
}
