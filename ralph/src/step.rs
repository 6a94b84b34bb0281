//! Orchestration for a single attempt against one selected task.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::budget::AttemptRecord;
use crate::core::classifier::{AttemptVerdict, classify_execution};
use crate::core::state_update::{FailurePolicy, apply_failure, mark_done, mark_in_progress};
use crate::core::types::ExecutionResult;
use crate::io::executor::{AgentExecutor, ExecRequest};
use crate::io::iteration_log::{IterationMeta, IterationPaths, IterationVerdict, write_meta};
use crate::io::prompt::assemble_prompt;
use crate::io::task_store::TaskStore;
use crate::task::TaskDocument;

/// RFC 3339 UTC timestamp used for notes, logs and iteration metadata.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Per-attempt settings, fixed for the whole loop.
#[derive(Debug, Clone)]
pub struct StepConfig {
    /// Project root; the agent runs here.
    pub root: PathBuf,
    pub run_id: String,
    /// Tool prompt that precedes the task section.
    pub base_prompt: String,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub on_failure: FailurePolicy,
    /// Tee agent output to stderr.
    pub echo: bool,
    /// Where to write per-iteration artifacts. `None` disables them.
    pub iterations_dir: Option<PathBuf>,
}

impl StepConfig {
    /// Settings for tests and embedders: no echo, no artifacts.
    pub fn new(root: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            run_id: run_id.into(),
            base_prompt: String::new(),
            timeout: Duration::from_secs(30 * 60),
            output_limit_bytes: 1_000_000,
            on_failure: FailurePolicy::default(),
            echo: false,
            iterations_dir: None,
        }
    }
}

/// Result of a single attempt.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Iteration number (1-indexed).
    pub iter: u32,
    pub task_id: String,
    pub verdict: AttemptVerdict,
    pub result: ExecutionResult,
    /// Budget record for this attempt, when the guardian is enabled.
    pub attempt: Option<AttemptRecord>,
}

impl StepOutcome {
    pub fn summary_line(&self) -> String {
        match &self.verdict {
            AttemptVerdict::Complete => format!(
                "iteration {}: {} done, completion signal received",
                self.iter, self.task_id
            ),
            AttemptVerdict::Succeeded => {
                format!("iteration {}: {} done", self.iter, self.task_id)
            }
            AttemptVerdict::Failed(err) => {
                format!("iteration {}: {} failed ({err})", self.iter, self.task_id)
            }
        }
    }
}

/// Run one attempt for `task_id` and persist the resulting status.
///
/// The task moves to `in-progress` and is saved before the agent starts. If
/// the agent cannot be run at all the task is put back to `pending` and the
/// error is returned.
#[instrument(skip_all, fields(iter = iter, task_id = %task_id))]
pub fn run_step<S, E>(
    store: &S,
    doc: &mut TaskDocument,
    task_id: &str,
    executor: &E,
    attempt: Option<AttemptRecord>,
    iter: u32,
    config: &StepConfig,
) -> Result<StepOutcome>
where
    S: TaskStore + ?Sized,
    E: AgentExecutor + ?Sized,
{
    let started_at = timestamp();
    mark_in_progress(doc, task_id, &started_at)?;
    store.save(doc).context("save task store before attempt")?;

    let task = doc
        .find(task_id)
        .ok_or_else(|| anyhow!("selected task {task_id} vanished"))?;
    info!(title = %task.title, priority = task.priority, "attempting task");
    let prompt = assemble_prompt(&config.base_prompt, task);

    let paths = config
        .iterations_dir
        .as_deref()
        .map(|dir| IterationPaths::new(dir, &config.run_id, iter));
    let request = ExecRequest {
        workdir: config.root.clone(),
        prompt,
        timeout: config.timeout,
        output_limit_bytes: config.output_limit_bytes,
        echo: config.echo,
        output_log_path: paths.as_ref().map(|p| p.output_log_path.clone()),
    };

    let result = match executor.execute(&request) {
        Ok(result) => result,
        Err(err) => {
            warn!(err = %err, "agent could not be run");
            let note = format!("agent could not be run in iteration {iter}: {err}");
            apply_failure(doc, task_id, FailurePolicy::Revert, &note, &timestamp())?;
            store.save(doc).context("save task store after executor error")?;
            return Err(err);
        }
    };

    let verdict = classify_execution(&result);
    let ended_at = timestamp();
    match &verdict {
        AttemptVerdict::Complete => mark_done(
            doc,
            task_id,
            &format!("completed in iteration {iter}; completion signal received"),
            &ended_at,
        )?,
        AttemptVerdict::Succeeded => mark_done(
            doc,
            task_id,
            &format!("completed in iteration {iter}"),
            &ended_at,
        )?,
        AttemptVerdict::Failed(err) => apply_failure(
            doc,
            task_id,
            config.on_failure,
            &format!("attempt failed in iteration {iter}: {err}"),
            &ended_at,
        )?,
    }
    store.save(doc).context("save task store after attempt")?;
    debug!(verdict = ?verdict, "task status updated");

    if let Some(paths) = &paths {
        write_meta(
            paths,
            &IterationMeta {
                run_id: config.run_id.clone(),
                iter,
                task_id: task_id.to_string(),
                tool: executor.tool(),
                verdict: match verdict {
                    AttemptVerdict::Complete => IterationVerdict::Complete,
                    AttemptVerdict::Succeeded => IterationVerdict::Succeeded,
                    AttemptVerdict::Failed(_) => IterationVerdict::Failed,
                },
                exit_code: result.exit_code,
                timed_out: result.timed_out,
                completion_signal: result.completion_signal,
                output_truncated: result.output_truncated,
                attempt: attempt.clone(),
                started_at,
                ended_at,
                duration_ms: result.duration_ms(),
            },
        )?;
    }

    Ok(StepOutcome {
        iter,
        task_id: task_id.to_string(),
        verdict,
        result,
        attempt,
    })
}
