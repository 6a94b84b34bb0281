//! Project layout and scaffolding for `ralph init`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use crate::io::config::{RalphConfig, write_config};
use crate::io::task_store::{FileTaskStore, TaskStore};
use crate::task::{FORMAT_VERSION, Metadata, TaskDocument};

/// Default location of the task store, relative to the project root.
pub const DEFAULT_TASKS_FILE: &str = ".taskmaster/tasks/tasks.json";
/// Default location of the progress log, relative to the project root.
pub const DEFAULT_PROGRESS_FILE: &str = "progress.txt";

/// Canonical paths for a project root.
///
/// `tasks_path` and `progress_path` use the defaults; [`RalphPaths::with_config`]
/// applies the configured locations.
#[derive(Debug, Clone)]
pub struct RalphPaths {
    pub root: PathBuf,
    pub ralph_dir: PathBuf,
    pub iterations_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub tasks_path: PathBuf,
    pub progress_path: PathBuf,
}

impl RalphPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let ralph_dir = root.join(".ralph");
        Self {
            root: root.clone(),
            ralph_dir: ralph_dir.clone(),
            iterations_dir: ralph_dir.join("iterations"),
            gitignore_path: ralph_dir.join(".gitignore"),
            config_path: ralph_dir.join("config.toml"),
            tasks_path: root.join(DEFAULT_TASKS_FILE),
            progress_path: root.join(DEFAULT_PROGRESS_FILE),
        }
    }

    pub fn with_config(mut self, config: &RalphConfig) -> Self {
        self.tasks_path = self.root.join(&config.tasks_file);
        self.progress_path = self.root.join(&config.progress_file);
        self
    }
}

/// Nearest ancestor of `start` containing `.git`, else `start` itself.
pub fn discover_root(start: &Path) -> PathBuf {
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .unwrap_or(start)
        .to_path_buf()
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite ralph-owned files that already exist.
    pub force: bool,
}

/// Create `.ralph/`, a default config and an empty task store in `root`.
///
/// An existing task store is never overwritten, even with `force`.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<RalphPaths> {
    let paths = RalphPaths::new(root);
    if paths.ralph_dir.exists() && !paths.ralph_dir.is_dir() {
        return Err(anyhow!("ralph init: .ralph exists but is not a directory"));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "ralph init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    fs::create_dir_all(&paths.iterations_dir)
        .with_context(|| format!("create directory {}", paths.iterations_dir.display()))?;
    fs::write(&paths.gitignore_path, RALPH_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &RalphConfig::default())?;

    if paths.tasks_path.exists() {
        debug!(path = %paths.tasks_path.display(), "keeping existing task store");
    } else {
        let doc = TaskDocument {
            metadata: Metadata {
                project: root
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned()),
                version: Some(FORMAT_VERSION.to_string()),
                ..Metadata::default()
            },
            tasks: Vec::new(),
            ..TaskDocument::default()
        };
        FileTaskStore::new(&paths.tasks_path).save(&doc)?;
    }

    info!(root = %root.display(), "initialized ralph project");
    Ok(paths)
}

const RALPH_GITIGNORE: &str = "iterations/\n";
