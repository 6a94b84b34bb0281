//! Ralph configuration stored under `.ralph/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::budget::BudgetConfig;
use crate::core::selector::BlockerPolicy;
use crate::core::state_update::FailurePolicy;
use crate::io::executor::Tool;
use crate::io::init::{DEFAULT_PROGRESS_FILE, DEFAULT_TASKS_FILE};

/// Loop configuration (TOML).
///
/// Missing fields fall back to defaults, so an empty file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RalphConfig {
    /// Stop after this many iterations regardless of task state.
    pub max_iterations: u32,

    /// Wall-clock limit for one agent process, in seconds.
    pub iteration_timeout_secs: u64,

    /// Keep at most this many bytes of agent output in memory.
    pub output_limit_bytes: usize,

    /// Pause between iterations, in milliseconds.
    pub iteration_delay_ms: u64,

    /// Task store path, relative to the project root.
    pub tasks_file: PathBuf,

    /// Progress log path, relative to the project root.
    pub progress_file: PathBuf,

    pub on_failure: FailurePolicy,

    pub blockers: BlockerPolicy,

    pub budget: BudgetConfig,

    pub tools: ToolsConfig,
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            iteration_timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
            iteration_delay_ms: 2_000,
            tasks_file: PathBuf::from(DEFAULT_TASKS_FILE),
            progress_file: PathBuf::from(DEFAULT_PROGRESS_FILE),
            on_failure: FailurePolicy::default(),
            blockers: BlockerPolicy::default(),
            budget: BudgetConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolsConfig {
    pub amp: ToolConfig,
    pub claude: ToolConfig,
    pub codex: ToolConfig,
    pub opencode: ToolConfig,
}

impl ToolsConfig {
    pub fn get(&self, tool: Tool) -> &ToolConfig {
        match tool {
            Tool::Amp => &self.amp,
            Tool::Claude => &self.claude,
            Tool::Codex => &self.codex,
            Tool::OpenCode => &self.opencode,
        }
    }
}

/// Per-tool settings. Unset fields use the tool's built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolConfig {
    /// Executable name or path. Defaults to the tool name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_auto: Option<bool>,
    /// Raw arguments appended to the command line, split with shell quoting rules.
    pub extra_args: String,
    /// Base prompt file, relative to the project root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_file: Option<PathBuf>,
}

impl RalphConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.iteration_timeout_secs == 0 {
            return Err(anyhow!("iteration_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.tasks_file.as_os_str().is_empty() {
            return Err(anyhow!("tasks_file must not be empty"));
        }
        if self.progress_file.as_os_str().is_empty() {
            return Err(anyhow!("progress_file must not be empty"));
        }
        self.budget.validate()?;
        for (name, tool) in [
            ("amp", &self.tools.amp),
            ("claude", &self.tools.claude),
            ("codex", &self.tools.codex),
            ("opencode", &self.tools.opencode),
        ] {
            if tool.binary.as_deref().is_some_and(|b| b.trim().is_empty()) {
                return Err(anyhow!("tools.{name}.binary must not be empty"));
            }
            shell_words::split(&tool.extra_args)
                .map_err(|err| anyhow!("tools.{name}.extra_args: {err}"))?;
        }
        Ok(())
    }

    /// Apply environment overrides on top of file values.
    ///
    /// `lookup` is `std::env::var(..).ok()` in production and a map in tests.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup("RALPH_MAX_ATTEMPTS") {
            self.budget.max_attempts = parse_env("RALPH_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("RALPH_BUDGET_LIMIT") {
            self.budget.budget_limit = parse_env("RALPH_BUDGET_LIMIT", &value)?;
        }
        if let Some(value) = lookup("RALPH_COST_PER_ATTEMPT") {
            self.budget.cost_per_attempt = parse_env("RALPH_COST_PER_ATTEMPT", &value)?;
        }
        if let Some(value) = lookup("RALPH_BUDGET_ENABLED") {
            self.budget.enabled = parse_flag(&value);
        }

        let codex = &mut self.tools.codex;
        if let Some(value) = lookup("CODEX_MODEL") {
            codex.model = Some(value);
        }
        if let Some(value) = lookup("CODEX_REASONING_EFFORT") {
            codex.reasoning_effort = Some(value);
        }
        if let Some(value) = lookup("CODEX_SANDBOX") {
            codex.sandbox = Some(value);
        }
        if let Some(value) = lookup("CODEX_FULL_AUTO") {
            codex.full_auto = Some(parse_flag(&value));
        }
        if let Some(value) = lookup("CODEX_EXTRA_ARGS") {
            codex.extra_args = value;
        }
        if let Some(value) = lookup("CODEX_PROMPT_FILE") {
            codex.prompt_file = Some(PathBuf::from(value));
        }

        let opencode = &mut self.tools.opencode;
        if let Some(value) = lookup("OPENCODE_MODEL") {
            opencode.model = Some(value);
        }
        if let Some(value) = lookup("OPENCODE_EXTRA_ARGS") {
            opencode.extra_args = value;
        }
        Ok(())
    }
}

fn parse_env<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|err| anyhow!("invalid {name}={value:?}: {err}"))
}

/// Only a case-insensitive `true` enables a flag.
fn parse_flag(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RalphConfig::default()`.
pub fn load_config(path: &Path) -> Result<RalphConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = RalphConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RalphConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RalphConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RalphConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".ralph").join("config.toml");
        let mut cfg = RalphConfig::default();
        cfg.on_failure = FailurePolicy::Hold;
        cfg.tools.codex.model = Some("o4".to_string());
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_iterations = 3\nblockers = \"resolve-done\"\n\n[budget]\nenabled = true\n\n[tools.claude]\nextra_args = \"--verbose\"\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_iterations, 3);
        assert_eq!(cfg.blockers, BlockerPolicy::ResolveDone);
        assert!(cfg.budget.enabled);
        assert_eq!(cfg.budget.max_attempts, 10);
        assert_eq!(cfg.tools.claude.extra_args, "--verbose");
        assert_eq!(cfg.tools.claude.model, None);
        assert_eq!(cfg.iteration_delay_ms, 2_000);
    }

    #[test]
    fn rejects_invalid_values() {
        let cfg = RalphConfig {
            max_iterations: 0,
            ..RalphConfig::default()
        };
        assert!(cfg.validate().is_err());

        let mut cfg = RalphConfig::default();
        cfg.budget.warning_threshold = 0.95;
        assert!(cfg.validate().is_err());

        let mut cfg = RalphConfig::default();
        cfg.tools.codex.extra_args = "--flag \"unterminated".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_override_to_zero_budget_fails_validation() {
        let mut cfg = RalphConfig::default();
        cfg.apply_env_overrides(env(&[("RALPH_BUDGET_LIMIT", "0")]))
            .expect("overrides");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_budget_and_tools() {
        let mut cfg = RalphConfig::default();
        cfg.apply_env_overrides(env(&[
            ("RALPH_MAX_ATTEMPTS", "3"),
            ("RALPH_BUDGET_LIMIT", "50.5"),
            ("RALPH_BUDGET_ENABLED", "TRUE"),
            ("CODEX_MODEL", "gpt-5"),
            ("CODEX_FULL_AUTO", "1"),
            ("OPENCODE_EXTRA_ARGS", "--debug"),
        ]))
        .expect("overrides");

        assert_eq!(cfg.budget.max_attempts, 3);
        assert_eq!(cfg.budget.budget_limit, 50.5);
        assert!(cfg.budget.enabled);
        assert_eq!(cfg.tools.codex.model.as_deref(), Some("gpt-5"));
        assert_eq!(cfg.tools.codex.full_auto, Some(false));
        assert_eq!(cfg.tools.opencode.extra_args, "--debug");
    }

    #[test]
    fn env_override_rejects_garbage_numbers() {
        let mut cfg = RalphConfig::default();
        let err = cfg
            .apply_env_overrides(env(&[("RALPH_COST_PER_ATTEMPT", "ten")]))
            .unwrap_err();
        assert!(err.to_string().contains("RALPH_COST_PER_ATTEMPT"));
    }
}
