//! Test-only helpers for building task documents and scripted agent runs.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{COMPLETION_MARKER, ExecutionResult};
use crate::io::executor::{AgentExecutor, ExecRequest, Tool};
use crate::io::init::RalphPaths;
use crate::io::task_store::{FileTaskStore, TaskStore};
use crate::task::{Task, TaskDocument, TaskStatus};

/// Create a deterministic pending task with no blockers.
pub fn task(id: &str, priority: i64) -> Task {
    Task {
        id: id.to_string(),
        title: format!("{id} title"),
        description: format!("{id} description"),
        status: TaskStatus::Pending,
        priority,
        acceptance_criteria: Vec::new(),
        depends_on: Vec::new(),
        blocked_by: Vec::new(),
        notes: Vec::new(),
        created_at: None,
        updated_at: None,
        extra: serde_json::Map::new(),
    }
}

pub fn task_with_status(id: &str, priority: i64, status: TaskStatus) -> Task {
    Task {
        status,
        ..task(id, priority)
    }
}

/// Create a pending task blocked by `blockers`.
pub fn blocked_task(id: &str, priority: i64, blockers: &[&str]) -> Task {
    Task {
        blocked_by: blockers.iter().map(|b| b.to_string()).collect(),
        ..task(id, priority)
    }
}

pub fn document(tasks: Vec<Task>) -> TaskDocument {
    TaskDocument {
        tasks,
        ..TaskDocument::default()
    }
}

/// One queued response for [`ScriptedExecutor`].
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    /// Return this result as if the agent process ran.
    Result(ExecutionResult),
    /// Fail the invocation itself (spawn error, missing binary, ...).
    Error(String),
}

impl ScriptedRun {
    /// Clean exit, no marker.
    pub fn success(output: &str) -> Self {
        Self::Result(ExecutionResult::from_output(Some(0), output))
    }

    /// Clean exit with the completion marker appended.
    pub fn complete() -> Self {
        Self::Result(ExecutionResult::from_output(
            Some(0),
            format!("all done\n{COMPLETION_MARKER}\n"),
        ))
    }

    pub fn failure(exit_code: i32, output: &str) -> Self {
        Self::Result(ExecutionResult::from_output(Some(exit_code), output))
    }

    pub fn timeout() -> Self {
        let mut result = ExecutionResult::from_output(None, "partial output");
        result.timed_out = true;
        Self::Result(result)
    }
}

/// Executor that replays queued results without spawning processes.
///
/// Running past the end of the queue returns an error.
pub struct ScriptedExecutor {
    runs: RefCell<VecDeque<ScriptedRun>>,
    prompts: RefCell<Vec<String>>,
    calls: Cell<usize>,
    available: bool,
}

impl ScriptedExecutor {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            runs: RefCell::new(runs.into()),
            prompts: RefCell::new(Vec::new()),
            calls: Cell::new(0),
            available: true,
        }
    }

    /// An executor whose binary is missing from PATH.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(Vec::new())
        }
    }

    /// Repeat the same run `count` times.
    pub fn repeating(run: ScriptedRun, count: usize) -> Self {
        Self::new(vec![run; count])
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.runs.borrow().len()
    }
}

impl AgentExecutor for ScriptedExecutor {
    fn tool(&self) -> Tool {
        Tool::Amp
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available {
            return Ok(());
        }
        Err(crate::error::RalphError::ToolNotAvailable {
            tool: "amp".to_string(),
            binary: "amp".to_string(),
        }
        .into())
    }

    fn execute(&self, request: &ExecRequest) -> Result<ExecutionResult> {
        self.ensure_available()?;
        self.calls.set(self.calls.get() + 1);
        self.prompts.borrow_mut().push(request.prompt.clone());
        let run = self
            .runs
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted executor exhausted"))?;
        match run {
            ScriptedRun::Result(result) => {
                if let Some(path) = &request.output_log_path {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(path, &result.output)?;
                }
                Ok(result)
            }
            ScriptedRun::Error(message) => Err(anyhow!(message)),
        }
    }
}

/// Temporary project root with a task store in the default location.
pub struct TestProject {
    temp: TempDir,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp: tempfile::tempdir()?,
        })
    }

    pub fn with_tasks(tasks: Vec<Task>) -> Result<Self> {
        let project = Self::new()?;
        project.write_tasks(&document(tasks))?;
        Ok(project)
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> RalphPaths {
        RalphPaths::new(self.root())
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.paths().tasks_path
    }

    pub fn store(&self) -> FileTaskStore {
        FileTaskStore::new(self.tasks_path())
    }

    pub fn write_tasks(&self, doc: &TaskDocument) -> Result<()> {
        self.store().save(doc)
    }

    pub fn read_tasks(&self) -> Result<TaskDocument> {
        self.store().load()
    }

    pub fn status_of(&self, id: &str) -> Result<TaskStatus> {
        let doc = self.read_tasks()?;
        doc.find(id)
            .map(|task| task.status)
            .ok_or_else(|| anyhow!("task {id} missing from store"))
    }
}
