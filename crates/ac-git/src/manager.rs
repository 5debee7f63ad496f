//! Shell-out git operations with per-run audit logging.
//!
//! Every operation goes through the [`ProcessRunner`] and appends one line
//! to `runtime/runs/<run-id>/git.log`:
//! `[<ts>] [<op>] <details> [SUCCESS|FAILED: <reason>] [<ms>ms]`.
//! Logging is best-effort and never fails an operation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use ac_core::runlog::RunPaths;

use crate::auth::{ssh_host, AuthError, GitAuth};
use crate::hostkeys::{HostKeyError, HostKeyValidator};
use crate::process::{CommandOutput, CommandSpec, ProcessError, ProcessRunner};

// Operation deadlines.
const CLONE_TIMEOUT: Duration = Duration::from_secs(300);
const LOCAL_TIMEOUT: Duration = Duration::from_secs(60);
const PUSH_TIMEOUT: Duration = Duration::from_secs(120);
const MERGE_TIMEOUT: Duration = Duration::from_secs(120);
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git {op} failed: {stderr}")]
    Command { op: String, stderr: String },

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    HostKey(#[from] HostKeyError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl GitError {
    pub fn code(&self) -> ac_core::error::ErrorCode {
        use ac_core::error::ErrorCode;
        match self {
            GitError::HostKey(_) => ErrorCode::KnownHostsInvalid,
            GitError::Process(ProcessError::Timeout { .. }) => ErrorCode::CommunicationError,
            _ => ErrorCode::GitConflict,
        }
    }
}

pub type Result<T> = std::result::Result<T, GitError>;

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// One `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    /// Two-character porcelain status (`M `, `??`, `UU`, ...).
    pub status: String,
    pub path: String,
}

/// Result of a merge attempt. A conflicted merge is a normal outcome here,
/// not an error; callers decide whether to auto-resolve or escalate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutput {
    pub success: bool,
    pub commit: Option<String>,
    pub had_conflicts: bool,
    pub stderr: String,
}

// ---------------------------------------------------------------------------
// GitManager
// ---------------------------------------------------------------------------

pub struct GitManager {
    runner: Arc<dyn ProcessRunner>,
    runtime_root: PathBuf,
    auth: Option<GitAuth>,
    hostkeys: HostKeyValidator,
    allow_agent_forwarding: bool,
}

impl GitManager {
    pub fn new(runner: Arc<dyn ProcessRunner>, runtime_root: impl Into<PathBuf>) -> Self {
        let runtime_root = runtime_root.into();
        let known_hosts = runtime_root.join("known_hosts");
        Self {
            hostkeys: HostKeyValidator::new(runner.clone(), known_hosts),
            runner,
            runtime_root,
            auth: None,
            allow_agent_forwarding: false,
        }
    }

    /// Use a custom known-hosts file location.
    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.hostkeys = HostKeyValidator::new(self.runner.clone(), path);
        self
    }

    /// Permit ssh-agent forwarding (off by default).
    pub fn allow_agent_forwarding(mut self, allow: bool) -> Self {
        self.allow_agent_forwarding = allow;
        self
    }

    /// Configure and validate the credential provider.
    pub fn set_auth(&mut self, auth: GitAuth) -> Result<()> {
        auth.validate(self.allow_agent_forwarding)?;
        self.auth = Some(auth);
        Ok(())
    }

    pub fn runner(&self) -> Arc<dyn ProcessRunner> {
        self.runner.clone()
    }

    fn run_paths(&self, run_id: &str) -> RunPaths {
        RunPaths::new(&self.runtime_root, run_id)
    }

    /// Execute a spec and append the audit line for it.
    async fn run_logged(
        &self,
        run_id: &str,
        op: &str,
        details: &str,
        spec: CommandSpec,
    ) -> Result<CommandOutput> {
        let started = std::time::Instant::now();
        let result = self.runner.run(spec).await;
        let elapsed = started.elapsed().as_millis() as u64;

        let outcome = match &result {
            Ok(out) if out.success() => "SUCCESS".to_string(),
            Ok(out) => format!("FAILED: {}", first_line(&out.stderr)),
            Err(e) => format!("FAILED: {}", e),
        };
        self.run_paths(run_id).append_git_log(&format!(
            "[{}] [{}] {} [{}] [{}ms]",
            Utc::now().to_rfc3339(),
            op,
            details,
            outcome,
            elapsed
        ));

        Ok(result?)
    }

    fn expect_success(op: &str, output: CommandOutput) -> Result<CommandOutput> {
        if output.success() {
            Ok(output)
        } else {
            Err(GitError::Command {
                op: op.to_string(),
                stderr: first_line(&output.stderr).to_string(),
            })
        }
    }

    // -----------------------------------------------------------------------
    // Repository operations
    // -----------------------------------------------------------------------

    /// Clone a repository. SSH remotes are host-key-validated first; HTTPS
    /// remotes get the token injected when one is configured.
    pub async fn clone_repo(&self, run_id: &str, url: &str, dest: &Path) -> Result<()> {
        let mut spec = CommandSpec::git(["clone".to_string()]).timeout(CLONE_TIMEOUT);

        if let Some(host) = ssh_host(url) {
            self.hostkeys.validate(&host).await?;
            let mut ssh_cmd = format!("ssh {}", self.hostkeys.ssh_options());
            if let Some(extra) = self.auth.as_ref().and_then(|a| a.ssh_command_extra()) {
                ssh_cmd.push(' ');
                ssh_cmd.push_str(&extra);
            }
            spec = spec.env("GIT_SSH_COMMAND", ssh_cmd);
        }

        let effective_url = match &self.auth {
            Some(auth) => auth.apply_to_url(url),
            None => url.to_string(),
        };
        spec = spec.arg(effective_url).arg(dest.display().to_string());

        // The audit line carries the caller's URL, never the token-bearing one.
        let out = self
            .run_logged(run_id, "clone", &format!("{} -> {}", url, dest.display()), spec)
            .await?;
        Self::expect_success("clone", out)?;
        Ok(())
    }

    pub async fn create_branch(&self, run_id: &str, dir: &Path, name: &str) -> Result<()> {
        let spec = CommandSpec::git(["branch", name])
            .cwd(dir)
            .timeout(LOCAL_TIMEOUT);
        let out = self.run_logged(run_id, "branch", name, spec).await?;
        Self::expect_success("branch", out)?;
        Ok(())
    }

    pub async fn checkout(&self, run_id: &str, dir: &Path, name: &str) -> Result<()> {
        let spec = CommandSpec::git(["checkout", name])
            .cwd(dir)
            .timeout(LOCAL_TIMEOUT);
        let out = self.run_logged(run_id, "checkout", name, spec).await?;
        Self::expect_success("checkout", out)?;
        Ok(())
    }

    /// Create a branch and switch to it in one step.
    pub async fn checkout_new(&self, run_id: &str, dir: &Path, name: &str) -> Result<()> {
        let spec = CommandSpec::git(["checkout", "-b", name])
            .cwd(dir)
            .timeout(LOCAL_TIMEOUT);
        let out = self.run_logged(run_id, "checkout", &format!("-b {}", name), spec).await?;
        Self::expect_success("checkout", out)?;
        Ok(())
    }

    pub async fn stage_all(&self, run_id: &str, dir: &Path) -> Result<()> {
        let spec = CommandSpec::git(["add", "-A"])
            .cwd(dir)
            .timeout(LOCAL_TIMEOUT);
        let out = self.run_logged(run_id, "stage", "-A", spec).await?;
        Self::expect_success("stage", out)?;
        Ok(())
    }

    pub async fn stage_paths(&self, run_id: &str, dir: &Path, paths: &[String]) -> Result<()> {
        let mut args = vec!["add".to_string(), "--".to_string()];
        args.extend(paths.iter().cloned());
        let spec = CommandSpec::git(args).cwd(dir).timeout(LOCAL_TIMEOUT);
        let out = self
            .run_logged(run_id, "stage", &paths.join(" "), spec)
            .await?;
        Self::expect_success("stage", out)?;
        Ok(())
    }

    /// Commit staged changes and return the new commit hash.
    pub async fn commit(&self, run_id: &str, dir: &Path, message: &str) -> Result<String> {
        let spec = CommandSpec::git(["commit", "-m", message])
            .cwd(dir)
            .timeout(LOCAL_TIMEOUT);
        let out = self.run_logged(run_id, "commit", message, spec).await?;
        Self::expect_success("commit", out)?;
        self.head_commit(dir).await
    }

    pub async fn push(&self, run_id: &str, dir: &Path, branch: &str) -> Result<()> {
        let spec = CommandSpec::git(["push", "origin", branch])
            .cwd(dir)
            .timeout(PUSH_TIMEOUT);
        let out = self.run_logged(run_id, "push", branch, spec).await?;
        Self::expect_success("push", out)?;
        Ok(())
    }

    /// Merge `source` into the current branch. A conflicted or otherwise
    /// failing merge is reported in the output, not as an error.
    pub async fn merge(
        &self,
        run_id: &str,
        dir: &Path,
        source: &str,
        message: &str,
    ) -> Result<MergeOutput> {
        let spec = CommandSpec::git(["merge", "--no-ff", source, "-m", message])
            .cwd(dir)
            .timeout(MERGE_TIMEOUT);
        let out = self.run_logged(run_id, "merge", source, spec).await?;

        if out.success() {
            let commit = self.head_commit(dir).await?;
            return Ok(MergeOutput {
                success: true,
                commit: Some(commit),
                had_conflicts: false,
                stderr: String::new(),
            });
        }

        let combined = format!("{}\n{}", out.stdout, out.stderr);
        let had_conflicts = combined.to_ascii_lowercase().contains("conflict");
        Ok(MergeOutput {
            success: false,
            commit: None,
            had_conflicts,
            stderr: first_line(&out.stderr).to_string(),
        })
    }

    pub async fn abort_merge(&self, run_id: &str, dir: &Path) -> Result<()> {
        let spec = CommandSpec::git(["merge", "--abort"])
            .cwd(dir)
            .timeout(LOCAL_TIMEOUT);
        let out = self.run_logged(run_id, "merge-abort", "", spec).await?;
        Self::expect_success("merge-abort", out)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn head_commit(&self, dir: &Path) -> Result<String> {
        let out = self
            .runner
            .run(
                CommandSpec::git(["rev-parse", "HEAD"])
                    .cwd(dir)
                    .timeout(QUERY_TIMEOUT),
            )
            .await?;
        let out = Self::expect_success("rev-parse", out)?;
        Ok(out.stdout.trim().to_string())
    }

    pub async fn current_branch(&self, dir: &Path) -> Result<String> {
        let out = self
            .runner
            .run(
                CommandSpec::git(["rev-parse", "--abbrev-ref", "HEAD"])
                    .cwd(dir)
                    .timeout(QUERY_TIMEOUT),
            )
            .await?;
        let out = Self::expect_success("rev-parse", out)?;
        Ok(out.stdout.trim().to_string())
    }

    /// Working-tree status via `git status --porcelain`.
    pub async fn status(&self, dir: &Path) -> Result<Vec<StatusEntry>> {
        let out = self
            .runner
            .run(
                CommandSpec::git(["status", "--porcelain"])
                    .cwd(dir)
                    .timeout(QUERY_TIMEOUT),
            )
            .await?;
        let out = Self::expect_success("status", out)?;
        Ok(parse_porcelain(&out.stdout))
    }

    /// Paths currently in the unmerged state.
    pub async fn conflicting_files(&self, dir: &Path) -> Result<Vec<String>> {
        let out = self
            .runner
            .run(
                CommandSpec::git(["diff", "--name-only", "--diff-filter=U"])
                    .cwd(dir)
                    .timeout(QUERY_TIMEOUT),
            )
            .await?;
        let out = Self::expect_success("diff", out)?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Commits on `source` that `target` does not have.
    pub async fn commit_count_between(
        &self,
        dir: &Path,
        target: &str,
        source: &str,
    ) -> Result<u32> {
        let range = format!("{}..{}", target, source);
        let out = self
            .runner
            .run(
                CommandSpec::git(["rev-list", "--count", &range])
                    .cwd(dir)
                    .timeout(QUERY_TIMEOUT),
            )
            .await?;
        let out = Self::expect_success("rev-list", out)?;
        Ok(out.stdout.trim().parse().unwrap_or(0))
    }

    /// Content of one merge stage (1 = base, 2 = ours, 3 = theirs) for a
    /// conflicted path. `None` when the stage is absent (add/delete sides).
    pub async fn stage_content(
        &self,
        dir: &Path,
        stage: u8,
        path: &str,
    ) -> Result<Option<String>> {
        let spec_arg = format!(":{}:{}", stage, path);
        let out = self
            .runner
            .run(
                CommandSpec::git(["show", &spec_arg])
                    .cwd(dir)
                    .timeout(QUERY_TIMEOUT),
            )
            .await?;
        if out.success() {
            Ok(Some(out.stdout))
        } else {
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}

fn parse_porcelain(stdout: &str) -> Vec<StatusEntry> {
    stdout
        .lines()
        .filter(|l| l.len() > 3)
        .map(|l| StatusEntry {
            status: l[..2].to_string(),
            path: l[3..].trim().to_string(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
