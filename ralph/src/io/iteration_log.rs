//! Iteration artifacts under `.ralph/iterations/<run-id>/<iter>/`.
//!
//! `output.log` is streamed by the executor while the agent runs; `meta.json`
//! is written once the attempt has been classified.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::budget::AttemptRecord;
use crate::io::executor::Tool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationVerdict {
    Complete,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub run_id: String,
    pub iter: u32,
    pub task_id: String,
    pub tool: Tool,
    pub verdict: IterationVerdict,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub completion_signal: bool,
    pub output_truncated: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<AttemptRecord>,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub output_log_path: PathBuf,
}

impl IterationPaths {
    pub fn new(iterations_dir: &Path, run_id: &str, iter: u32) -> Self {
        let dir = iterations_dir.join(run_id).join(iter.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            output_log_path: dir.join("output.log"),
            dir,
        }
    }
}

pub fn write_meta(paths: &IterationPaths, meta: &IterationMeta) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;
    let mut buf = serde_json::to_string_pretty(meta).context("serialize iteration meta")?;
    buf.push('\n');
    fs::write(&paths.meta_path, buf)
        .with_context(|| format!("write {}", paths.meta_path.display()))
}
