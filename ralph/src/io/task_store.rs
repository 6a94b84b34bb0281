//! Task store load/save with schema + invariant validation.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::invariants::{invariant_warnings, validate_invariants};
use crate::error::RalphError;
use crate::task::TaskDocument;

const TASKS_SCHEMA: &str = include_str!("../../schemas/tasks.schema.json");

/// Persistence for the task document. Every write replaces the full document.
pub trait TaskStore {
    fn load(&self) -> Result<TaskDocument>;
    fn save(&self, doc: &TaskDocument) -> Result<()>;
}

/// JSON task store on disk.
#[derive(Debug, Clone)]
pub struct FileTaskStore {
    path: PathBuf,
}

impl FileTaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt(&self, detail: impl Into<String>) -> anyhow::Error {
        RalphError::StoreCorrupt {
            path: self.path.clone(),
            detail: detail.into(),
        }
        .into()
    }
}

impl TaskStore for FileTaskStore {
    /// A missing or blank file loads as an empty document.
    fn load(&self) -> Result<TaskDocument> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "task store missing, treating as empty");
            return Ok(TaskDocument::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read task store {}", self.path.display()))?;
        if contents.trim().is_empty() {
            debug!(path = %self.path.display(), "task store empty");
            return Ok(TaskDocument::default());
        }

        let value: Value = serde_json::from_str(&contents)
            .map_err(|err| self.corrupt(format!("invalid JSON: {err}")))?;
        validate_schema(&value).map_err(|detail| self.corrupt(detail))?;
        let doc: TaskDocument =
            serde_json::from_value(value).map_err(|err| self.corrupt(err.to_string()))?;

        let errors = validate_invariants(&doc);
        if !errors.is_empty() {
            return Err(self.corrupt(errors.join("; ")));
        }
        for warning in invariant_warnings(&doc) {
            warn!(path = %self.path.display(), "{warning}");
        }
        debug!(path = %self.path.display(), tasks = doc.tasks.len(), "task store loaded");
        Ok(doc)
    }

    fn save(&self, doc: &TaskDocument) -> Result<()> {
        let errors = validate_invariants(doc);
        if !errors.is_empty() {
            return Err(anyhow!("refusing to write invalid tasks: {}", errors.join("; ")));
        }
        let mut buf = serde_json::to_string_pretty(doc).context("serialize task store")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)?;
        debug!(path = %self.path.display(), tasks = doc.tasks.len(), "task store saved");
        Ok(())
    }
}

fn validate_schema(doc: &Value) -> std::result::Result<(), String> {
    let schema: Value =
        serde_json::from_str(TASKS_SCHEMA).map_err(|err| format!("invalid schema: {err}"))?;
    let compiled = validator_for(&schema).map_err(|err| format!("invalid schema: {err}"))?;
    if compiled.is_valid(doc) {
        return Ok(());
    }
    let messages = compiled
        .iter_errors(doc)
        .map(|err| err.to_string())
        .collect::<Vec<_>>();
    Err(format!("schema validation failed: {}", messages.join("; ")))
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("task store path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp task store {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace task store {}", path.display()))?;
    Ok(())
}
