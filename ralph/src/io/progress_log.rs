//! Append-only, human-readable progress log (`progress.txt`).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the header if the file does not exist yet. Existing logs are kept.
    pub fn ensure(&self, now: &str) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&self.path, header(now))
            .with_context(|| format!("write progress log {}", self.path.display()))
    }

    /// Append one line, prefixed with `now`.
    pub fn append(&self, now: &str, line: &str) -> Result<()> {
        self.ensure(now)?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open progress log {}", self.path.display()))?;
        writeln!(file, "[{now}] {line}")
            .with_context(|| format!("append progress log {}", self.path.display()))
    }
}

fn header(now: &str) -> String {
    format!("# Ralph Progress Log\nStarted: {now}\n---\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_header_once_and_appends() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = ProgressLog::new(temp.path().join("progress.txt"));

        log.ensure("2026-01-01T00:00:00Z").expect("ensure");
        log.append("2026-01-01T00:01:00Z", "iteration 1: t-1 succeeded")
            .expect("append");
        log.ensure("2026-02-02T00:00:00Z").expect("ensure again");

        let contents = fs::read_to_string(log.path()).expect("read");
        assert_eq!(
            contents,
            "# Ralph Progress Log\nStarted: 2026-01-01T00:00:00Z\n---\n[2026-01-01T00:01:00Z] iteration 1: t-1 succeeded\n"
        );
    }

    #[test]
    fn keeps_existing_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("progress.txt");
        fs::write(&path, "earlier notes\n").expect("write");

        ProgressLog::new(&path).append("now", "stopped").expect("append");
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "earlier notes\n[now] stopped\n"
        );
    }
}
