//! Executor abstraction for agent invocation.
//!
//! The [`AgentExecutor`] trait decouples the loop from the agent CLI that does
//! the work. There is one implementation per [`Tool`]; tests use scripted
//! executors that return predetermined results without spawning processes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{COMPLETION_MARKER, ExecutionResult};
use crate::error::RalphError;
use crate::io::config::ToolConfig;
use crate::io::process::{CaptureOptions, run_command_captured};

const DEFAULT_CLAUDE_MODEL: &str = "sonnet";
const DEFAULT_CODEX_MODEL: &str = "gpt-5-codex";
const DEFAULT_CODEX_REASONING_EFFORT: &str = "high";
const DEFAULT_CODEX_SANDBOX: &str = "workspace-write";
const DEFAULT_OPENCODE_MODEL: &str = "gpt-4";

/// Supported agent CLIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Amp,
    Claude,
    Codex,
    #[value(name = "opencode")]
    OpenCode,
}

impl Tool {
    pub fn as_str(self) -> &'static str {
        match self {
            Tool::Amp => "amp",
            Tool::Claude => "claude",
            Tool::Codex => "codex",
            Tool::OpenCode => "opencode",
        }
    }

    /// Base prompt file used when `prompt_file` is not configured.
    pub fn default_prompt_file(self) -> &'static str {
        match self {
            Tool::Amp | Tool::OpenCode => "prompt.md",
            Tool::Claude | Tool::Codex => "CLAUDE.md",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for an executor invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Working directory for the agent process (the project root).
    pub workdir: PathBuf,
    /// Prompt text fed to the agent on stdin.
    pub prompt: String,
    /// Kill the agent after this long; the attempt then counts as failed.
    pub timeout: Duration,
    /// Keep at most this many bytes of output in the result.
    pub output_limit_bytes: usize,
    /// Tee agent output to our stderr as it arrives.
    pub echo: bool,
    /// Stream the full agent output to this file.
    pub output_log_path: Option<PathBuf>,
}

/// Abstraction over agent execution backends.
pub trait AgentExecutor {
    fn tool(&self) -> Tool;

    /// Fail with [`RalphError::ToolNotAvailable`] when the agent cannot be launched.
    fn ensure_available(&self) -> Result<()>;

    /// Run one attempt.
    ///
    /// A non-zero exit or timeout is reported in the returned result, not as
    /// an error. Errors mean the agent could not be run at all.
    fn execute(&self, request: &ExecRequest) -> Result<ExecutionResult>;
}

/// Build the executor for `tool` from its config table.
pub fn build_executor(tool: Tool, config: &ToolConfig) -> Result<Box<dyn AgentExecutor>> {
    Ok(match tool {
        Tool::Amp => Box::new(AmpExecutor::from_config(config)?),
        Tool::Claude => Box::new(ClaudeExecutor::from_config(config)?),
        Tool::Codex => Box::new(CodexExecutor::from_config(config)?),
        Tool::OpenCode => Box::new(OpenCodeExecutor::from_config(config)?),
    })
}

/// `amp --dangerously-allow-all`, prompt on stdin.
#[derive(Debug, Clone)]
pub struct AmpExecutor {
    binary: String,
    extra_args: Vec<String>,
}

impl AmpExecutor {
    pub fn from_config(config: &ToolConfig) -> Result<Self> {
        Ok(Self {
            binary: binary_for(Tool::Amp, config),
            extra_args: split_extra_args(Tool::Amp, &config.extra_args)?,
        })
    }

    pub fn command(&self, workdir: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--dangerously-allow-all")
            .args(&self.extra_args)
            .current_dir(workdir);
        cmd
    }
}

impl AgentExecutor for AmpExecutor {
    fn tool(&self) -> Tool {
        Tool::Amp
    }

    fn ensure_available(&self) -> Result<()> {
        ensure_binary(Tool::Amp, &self.binary)
    }

    fn execute(&self, request: &ExecRequest) -> Result<ExecutionResult> {
        run_agent(Tool::Amp, &self.binary, self.command(&request.workdir), request)
    }
}

/// `claude --model <model> --dangerously-skip-permissions --print`, prompt on stdin.
#[derive(Debug, Clone)]
pub struct ClaudeExecutor {
    binary: String,
    model: String,
    extra_args: Vec<String>,
}

impl ClaudeExecutor {
    pub fn from_config(config: &ToolConfig) -> Result<Self> {
        Ok(Self {
            binary: binary_for(Tool::Claude, config),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_CLAUDE_MODEL.to_string()),
            extra_args: split_extra_args(Tool::Claude, &config.extra_args)?,
        })
    }

    pub fn command(&self, workdir: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--model")
            .arg(&self.model)
            .arg("--dangerously-skip-permissions")
            .arg("--print")
            .args(&self.extra_args)
            .current_dir(workdir);
        cmd
    }
}

impl AgentExecutor for ClaudeExecutor {
    fn tool(&self) -> Tool {
        Tool::Claude
    }

    fn ensure_available(&self) -> Result<()> {
        ensure_binary(Tool::Claude, &self.binary)
    }

    fn execute(&self, request: &ExecRequest) -> Result<ExecutionResult> {
        run_agent(
            Tool::Claude,
            &self.binary,
            self.command(&request.workdir),
            request,
        )
    }
}

/// `codex exec`, prompt on stdin (`-`), settings mirrored into `CODEX_*` variables.
#[derive(Debug, Clone)]
pub struct CodexExecutor {
    binary: String,
    model: String,
    reasoning_effort: String,
    sandbox: String,
    full_auto: bool,
    extra_args_raw: String,
    extra_args: Vec<String>,
    prompt_file: Option<PathBuf>,
}

impl CodexExecutor {
    pub fn from_config(config: &ToolConfig) -> Result<Self> {
        Ok(Self {
            binary: binary_for(Tool::Codex, config),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_CODEX_MODEL.to_string()),
            reasoning_effort: config
                .reasoning_effort
                .clone()
                .unwrap_or_else(|| DEFAULT_CODEX_REASONING_EFFORT.to_string()),
            sandbox: config
                .sandbox
                .clone()
                .unwrap_or_else(|| DEFAULT_CODEX_SANDBOX.to_string()),
            full_auto: config.full_auto.unwrap_or(true),
            extra_args_raw: config.extra_args.clone(),
            extra_args: split_extra_args(Tool::Codex, &config.extra_args)?,
            prompt_file: config.prompt_file.clone(),
        })
    }

    pub fn command(&self, workdir: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("exec")
            .arg("-m")
            .arg(&self.model)
            .arg("--config")
            .arg(format!("model_reasoning_effort=\"{}\"", self.reasoning_effort))
            .arg("--sandbox")
            .arg(&self.sandbox);
        if self.full_auto {
            cmd.arg("--dangerously-bypass-approvals-and-sandbox");
        }
        cmd.arg("--cd")
            .arg(workdir)
            .args(&self.extra_args)
            .arg("-")
            .current_dir(workdir);

        cmd.env("CODEX_MODEL", &self.model)
            .env("CODEX_REASONING_EFFORT", &self.reasoning_effort)
            .env("CODEX_SANDBOX", &self.sandbox)
            .env("CODEX_FULL_AUTO", if self.full_auto { "true" } else { "false" });
        if !self.extra_args_raw.is_empty() {
            cmd.env("CODEX_EXTRA_ARGS", &self.extra_args_raw);
        }
        if let Some(prompt_file) = &self.prompt_file {
            cmd.env("CODEX_PROMPT_FILE", workdir.join(prompt_file));
        }
        cmd
    }
}

impl AgentExecutor for CodexExecutor {
    fn tool(&self) -> Tool {
        Tool::Codex
    }

    fn ensure_available(&self) -> Result<()> {
        ensure_binary(Tool::Codex, &self.binary)
    }

    fn execute(&self, request: &ExecRequest) -> Result<ExecutionResult> {
        run_agent(
            Tool::Codex,
            &self.binary,
            self.command(&request.workdir),
            request,
        )
    }
}

/// `opencode --model <model>`, prompt on stdin.
#[derive(Debug, Clone)]
pub struct OpenCodeExecutor {
    binary: String,
    model: String,
    extra_args: Vec<String>,
}

impl OpenCodeExecutor {
    pub fn from_config(config: &ToolConfig) -> Result<Self> {
        Ok(Self {
            binary: binary_for(Tool::OpenCode, config),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENCODE_MODEL.to_string()),
            extra_args: split_extra_args(Tool::OpenCode, &config.extra_args)?,
        })
    }

    pub fn command(&self, workdir: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--model")
            .arg(&self.model)
            .args(&self.extra_args)
            .current_dir(workdir);
        cmd
    }
}

impl AgentExecutor for OpenCodeExecutor {
    fn tool(&self) -> Tool {
        Tool::OpenCode
    }

    fn ensure_available(&self) -> Result<()> {
        ensure_binary(Tool::OpenCode, &self.binary)
    }

    fn execute(&self, request: &ExecRequest) -> Result<ExecutionResult> {
        run_agent(
            Tool::OpenCode,
            &self.binary,
            self.command(&request.workdir),
            request,
        )
    }
}

fn binary_for(tool: Tool, config: &ToolConfig) -> String {
    config
        .binary
        .clone()
        .unwrap_or_else(|| tool.as_str().to_string())
}

fn split_extra_args(tool: Tool, raw: &str) -> Result<Vec<String>> {
    shell_words::split(raw).map_err(|err| anyhow!("parse {tool} extra_args {raw:?}: {err}"))
}

fn not_available(tool: Tool, binary: &str) -> anyhow::Error {
    RalphError::ToolNotAvailable {
        tool: tool.to_string(),
        binary: binary.to_string(),
    }
    .into()
}

fn ensure_binary(tool: Tool, binary: &str) -> Result<()> {
    match which::which(binary) {
        Ok(path) => {
            debug!(%tool, path = %path.display(), "agent binary found");
            Ok(())
        }
        Err(err) => {
            debug!(%tool, binary, err = %err, "agent binary lookup failed");
            Err(not_available(tool, binary))
        }
    }
}

#[instrument(skip_all, fields(tool = %tool, timeout_secs = request.timeout.as_secs()))]
fn run_agent(
    tool: Tool,
    binary: &str,
    cmd: Command,
    request: &ExecRequest,
) -> Result<ExecutionResult> {
    ensure_binary(tool, binary)?;
    info!(workdir = %request.workdir.display(), "starting agent");

    let started = Instant::now();
    let output = run_command_captured(
        cmd,
        Some(request.prompt.as_bytes()),
        request.timeout,
        &CaptureOptions {
            output_limit_bytes: request.output_limit_bytes,
            echo: request.echo,
            log_path: request.output_log_path.as_deref(),
            watch_for: Some(COMPLETION_MARKER),
        },
    )
    .map_err(|err| {
        let missing = err
            .root_cause()
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound);
        if missing {
            not_available(tool, binary)
        } else {
            err.context(format!("run {tool}"))
        }
    })?;

    let result = ExecutionResult {
        exit_code: output.status.code(),
        output: output.output_lossy(),
        completion_signal: output.watched_seen,
        timed_out: output.timed_out,
        duration: started.elapsed(),
        output_truncated: output.truncated,
    };
    if result.timed_out {
        warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
    } else if !result.succeeded() {
        warn!(exit_code = ?result.exit_code, "agent exited unsuccessfully");
    } else {
        debug!(
            completion_signal = result.completion_signal,
            duration_ms = result.duration_ms(),
            "agent finished"
        );
    }
    Ok(result)
}
