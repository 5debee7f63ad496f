//! Per-run audit-log paths and best-effort appenders.
//!
//! Every logical run owns a directory under `runtime/runs/<run-id>/`
//! containing its git, merge and error logs, the bus persistence directory
//! and pull-request snapshots. Appends never propagate failures: an audit
//! log that cannot be written must not take the orchestrator down with it.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::ErrorCode;

// ---------------------------------------------------------------------------
// RunPaths
// ---------------------------------------------------------------------------

/// Path resolver for one run's audit artifacts.
#[derive(Debug, Clone)]
pub struct RunPaths {
    root: PathBuf,
    run_id: String,
}

impl RunPaths {
    /// `root` is the runtime root (the directory that contains `runs/`).
    pub fn new(root: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> PathBuf {
        self.root.join("runs").join(&self.run_id)
    }

    pub fn git_log(&self) -> PathBuf {
        self.dir().join("git.log")
    }

    pub fn merge_log(&self) -> PathBuf {
        self.dir().join("merge.log")
    }

    pub fn errors_log(&self) -> PathBuf {
        self.dir().join("errors.log")
    }

    pub fn bus_dir(&self) -> PathBuf {
        self.dir().join("bus")
    }

    pub fn pr_file(&self, pr_id: &str) -> PathBuf {
        self.dir().join(format!("{}.json", pr_id))
    }

    pub fn result_file(&self) -> PathBuf {
        self.dir().join("result.json")
    }

    pub fn judgment_file(&self) -> PathBuf {
        self.dir().join("judgment.json")
    }

    /// Append one line to the run's git log.
    pub fn append_git_log(&self, line: &str) {
        append_line(&self.git_log(), line);
    }

    /// Append one line to the run's merge log.
    pub fn append_merge_log(&self, line: &str) {
        append_line(&self.merge_log(), line);
    }

    /// Record a failure in `errors.log` as
    /// `[<ISO-8601>] <CODE> <RECOVERABLE|FATAL> | <message>`.
    pub fn log_error(&self, code: ErrorCode, recoverable: bool, message: &str) {
        self.log_error_raw(code.as_str(), recoverable, message);
    }

    /// Same as [`log_error`](Self::log_error) for codes originating outside
    /// the core taxonomy (worker-reported error codes pass through as-is).
    pub fn log_error_raw(&self, code: &str, recoverable: bool, message: &str) {
        let severity = if recoverable { "RECOVERABLE" } else { "FATAL" };
        let line = format!(
            "[{}] {} {} | {}",
            Utc::now().to_rfc3339(),
            code,
            severity,
            message
        );
        append_line(&self.errors_log(), &line);
    }
}

/// Best-effort append: creates parent directories, swallows IO failures
/// after tracing them.
pub fn append_line(path: &Path, line: &str) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!(path = %path.display(), error = %e, "audit log dir create failed");
            return;
        }
    }
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{}", line));
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "audit log append failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_scoped_by_run_id() {
        let rp = RunPaths::new("/tmp/rt", "run-abc-123456");
        assert_eq!(
            rp.git_log(),
            PathBuf::from("/tmp/rt/runs/run-abc-123456/git.log")
        );
        assert_eq!(
            rp.bus_dir(),
            PathBuf::from("/tmp/rt/runs/run-abc-123456/bus")
        );
        assert_eq!(
            rp.pr_file("pr-x-y"),
            PathBuf::from("/tmp/rt/runs/run-abc-123456/pr-x-y.json")
        );
    }

    #[test]
    fn append_creates_dirs_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let rp = RunPaths::new(dir.path(), "run-1-abcdef");

        rp.append_git_log("[ts] [clone] url [SUCCESS] [12ms]");
        rp.append_git_log("[ts] [merge] a->b [FAILED: conflict] [40ms]");

        let content = std::fs::read_to_string(rp.git_log()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("FAILED: conflict"));
    }

    #[test]
    fn error_log_format() {
        let dir = tempfile::tempdir().unwrap();
        let rp = RunPaths::new(dir.path(), "run-2-abcdef");

        rp.log_error(ErrorCode::AdapterTimeout, true, "backend took too long");
        rp.log_error(ErrorCode::InvalidInput, false, "empty instruction");

        let content = std::fs::read_to_string(rp.errors_log()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines[0].contains("ADAPTER_TIMEOUT RECOVERABLE | backend took too long"));
        assert!(lines[1].contains("INVALID_INPUT FATAL | empty instruction"));
        assert!(lines[0].starts_with('['));
    }

    #[test]
    fn append_failure_does_not_panic() {
        // A path that cannot be a directory parent: a file where a dir is
        // expected.
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let bad = blocker.join("nested").join("git.log");
        append_line(&bad, "line"); // must not panic
    }
}
