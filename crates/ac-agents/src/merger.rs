//! MergerAgent — integration-branch merges and pull-request gating.
//!
//! Agent branches merge into the integration branch (default `develop`),
//! never directly into a protected branch: anything targeting `main` or
//! `master` is rejected without touching git and must travel as a pull
//! request instead. Pull requests move strictly `open -> approved ->
//! merged`; merging an unapproved PR is a failure, not an exception.
//!
//! Every decision is appended to `runtime/runs/<run-id>/merge.log` and PRs
//! are persisted as `pr-<id>.json` next to it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use ac_adapters::Adapter;
use ac_core::error::ErrorCode;
use ac_core::ids;
use ac_core::runlog::RunPaths;
use ac_core::types::{PrStatus, PullRequest};
use ac_core::workspace::is_protected_branch;
use ac_git::{GitError, GitManager};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MergerError {
    #[error("pull request not found: {0}")]
    PrNotFound(String),

    #[error("pull request {id} cannot move from {from:?} to {to:?}")]
    InvalidPrTransition {
        id: String,
        from: PrStatus,
        to: PrStatus,
    },

    #[error(transparent)]
    Git(#[from] GitError),
}

impl MergerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MergerError::PrNotFound(_) => ErrorCode::PrNotFound,
            MergerError::InvalidPrTransition { .. } => ErrorCode::PrNotApproved,
            MergerError::Git(e) => e.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MergerError>;

// ---------------------------------------------------------------------------
// Request / result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MergerConfig {
    pub integration_branch: String,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            integration_branch: "develop".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub run_id: String,
    pub repo_dir: PathBuf,
    pub source: String,
    /// Defaults to the configured integration branch.
    pub target: Option<String>,
    pub ticket: String,
    pub message: Option<String>,
}

/// Merge outcome as a value: callers branch on `success`, they do not
/// catch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    pub success: bool,
    pub commit: Option<String>,
    pub had_conflicts: bool,
    pub error: Option<String>,
}

impl MergeResult {
    fn ok(commit: String) -> Self {
        Self {
            success: true,
            commit: Some(commit),
            had_conflicts: false,
            error: None,
        }
    }

    fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            commit: None,
            had_conflicts: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PullRequestSpec {
    pub title: String,
    pub description: Option<String>,
    pub source_branch: String,
    pub target_branch: String,
    pub ticket_id: String,
}

// ---------------------------------------------------------------------------
// MergerAgent
// ---------------------------------------------------------------------------

pub struct MergerAgent {
    git: Arc<GitManager>,
    adapter: Arc<dyn Adapter>,
    runtime_root: PathBuf,
    config: MergerConfig,
    /// PR records, owned exclusively by this agent.
    prs: Mutex<HashMap<String, PullRequest>>,
}

impl MergerAgent {
    pub fn new(
        git: Arc<GitManager>,
        adapter: Arc<dyn Adapter>,
        runtime_root: impl Into<PathBuf>,
        config: MergerConfig,
    ) -> Self {
        Self {
            git,
            adapter,
            runtime_root: runtime_root.into(),
            config,
            prs: Mutex::new(HashMap::new()),
        }
    }

    fn run_paths(&self, run_id: &str) -> RunPaths {
        RunPaths::new(&self.runtime_root, run_id)
    }

    fn log_merge(&self, run_id: &str, line: &str) {
        self.run_paths(run_id)
            .append_merge_log(&format!("[{}] {}", Utc::now().to_rfc3339(), line));
    }

    /// Merge an agent branch into the integration branch.
    ///
    /// A protected target (`main`/`master`, case-insensitive) is rejected
    /// before any git command runs; such changes must go through an
    /// approved pull request.
    pub async fn merge(&self, request: &MergeRequest) -> MergeResult {
        let target = request
            .target
            .clone()
            .unwrap_or_else(|| self.config.integration_branch.clone());

        if is_protected_branch(&target) {
            let reason = format!(
                "direct merge forbidden: {} is protected; open a pull request instead",
                target
            );
            self.log_merge(
                &request.run_id,
                &format!("[merge] {} -> {} REJECTED: {}", request.source, target, reason),
            );
            self.run_paths(&request.run_id).log_error(
                ErrorCode::MergeRejectedProtected,
                false,
                &reason,
            );
            warn!(source = %request.source, target = %target, "merge into protected branch rejected");
            return MergeResult::fail(reason);
        }

        let message = request.message.clone().unwrap_or_else(|| {
            format!(
                "[{}] Merge {} into {}",
                request.ticket, request.source, target
            )
        });

        if let Err(e) = self
            .git
            .checkout(&request.run_id, &request.repo_dir, &target)
            .await
        {
            let reason = format!("checkout {} failed: {}", target, e);
            self.log_merge(
                &request.run_id,
                &format!("[merge] {} -> {} FAILED: {}", request.source, target, reason),
            );
            return MergeResult::fail(reason);
        }

        match self
            .git
            .merge(&request.run_id, &request.repo_dir, &request.source, &message)
            .await
        {
            Ok(out) if out.success => {
                let commit = out.commit.unwrap_or_default();
                self.log_merge(
                    &request.run_id,
                    &format!(
                        "[merge] {} -> {} SUCCESS commit={}",
                        request.source, target, commit
                    ),
                );
                info!(source = %request.source, target = %target, commit = %commit, "merged");
                MergeResult::ok(commit)
            }
            Ok(out) => {
                self.log_merge(
                    &request.run_id,
                    &format!(
                        "[merge] {} -> {} FAILED conflicts={} {}",
                        request.source, target, out.had_conflicts, out.stderr
                    ),
                );
                MergeResult {
                    success: false,
                    commit: None,
                    had_conflicts: out.had_conflicts,
                    error: Some(out.stderr),
                }
            }
            Err(e) => {
                self.log_merge(
                    &request.run_id,
                    &format!("[merge] {} -> {} FAILED: {}", request.source, target, e),
                );
                MergeResult::fail(e.to_string())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Pull requests
    // -----------------------------------------------------------------------

    /// Open a pull request. Changed files come from git status, the
    /// description from the adapter when the caller did not provide one.
    pub async fn create_pull_request(
        &self,
        run_id: &str,
        repo_dir: &Path,
        spec: PullRequestSpec,
    ) -> Result<PullRequest> {
        let id = ids::pr_id();

        let changed_files = self
            .git
            .status(repo_dir)
            .await
            .map(|entries| entries.into_iter().map(|e| e.path).collect())
            .unwrap_or_else(|e| {
                warn!(error = %e, "status unavailable for PR; leaving file list empty");
                Vec::new()
            });

        let commit_count = self
            .git
            .commit_count_between(repo_dir, &spec.target_branch, &spec.source_branch)
            .await
            .unwrap_or(0);

        let description = match spec.description {
            Some(d) => d,
            None => self.generate_description(run_id, &spec).await,
        };

        let pr = PullRequest {
            id: id.clone(),
            title: spec.title,
            description,
            source_branch: spec.source_branch,
            target_branch: spec.target_branch,
            ticket_id: spec.ticket_id,
            status: PrStatus::Open,
            changed_files,
            commit_count,
            created_at: Utc::now(),
        };

        self.persist(run_id, &pr);
        self.log_merge(
            run_id,
            &format!(
                "[pr] {} opened: {} -> {} ({})",
                pr.id, pr.source_branch, pr.target_branch, pr.ticket_id
            ),
        );
        info!(pr = %pr.id, "pull request opened");

        self.prs.lock().await.insert(id.clone(), pr.clone());
        Ok(pr)
    }

    /// `open -> approved`. Anything else is an invalid transition.
    pub async fn approve_pull_request(&self, run_id: &str, pr_id: &str) -> Result<PullRequest> {
        let mut prs = self.prs.lock().await;
        let pr = prs
            .get_mut(pr_id)
            .ok_or_else(|| MergerError::PrNotFound(pr_id.to_string()))?;

        if !pr.status.can_transition_to(PrStatus::Approved) {
            return Err(MergerError::InvalidPrTransition {
                id: pr_id.to_string(),
                from: pr.status,
                to: PrStatus::Approved,
            });
        }
        pr.status = PrStatus::Approved;
        let pr = pr.clone();
        drop(prs);

        self.persist(run_id, &pr);
        self.log_merge(run_id, &format!("[pr] {} approved", pr.id));
        info!(pr = %pr.id, "pull request approved");
        Ok(pr)
    }

    /// Merge an approved pull request. An unapproved PR fails with
    /// "not approved"; the protected-branch rule does not apply here —
    /// approval is exactly the gate that allows the merge.
    pub async fn merge_pull_request(
        &self,
        run_id: &str,
        repo_dir: &Path,
        pr_id: &str,
    ) -> MergeResult {
        let pr = {
            let prs = self.prs.lock().await;
            match prs.get(pr_id) {
                Some(pr) => pr.clone(),
                None => {
                    self.log_merge(run_id, &format!("[pr] {} merge FAILED: not found", pr_id));
                    return MergeResult::fail(format!("pull request not found: {}", pr_id));
                }
            }
        };

        if pr.status != PrStatus::Approved {
            let reason = format!("not approved (status: {:?})", pr.status);
            self.log_merge(run_id, &format!("[pr] {} merge FAILED: {}", pr.id, reason));
            self.run_paths(run_id)
                .log_error(ErrorCode::PrNotApproved, false, &reason);
            return MergeResult::fail(reason);
        }

        let message = format!(
            "[{}] Merge {} into {}",
            pr.ticket_id, pr.source_branch, pr.target_branch
        );

        if let Err(e) = self.git.checkout(run_id, repo_dir, &pr.target_branch).await {
            let reason = format!("checkout {} failed: {}", pr.target_branch, e);
            self.log_merge(run_id, &format!("[pr] {} merge FAILED: {}", pr.id, reason));
            return MergeResult::fail(reason);
        }

        match self
            .git
            .merge(run_id, repo_dir, &pr.source_branch, &message)
            .await
        {
            Ok(out) if out.success => {
                let commit = out.commit.unwrap_or_default();
                let updated = {
                    let mut prs = self.prs.lock().await;
                    let pr = prs.get_mut(pr_id).expect("present above");
                    pr.status = PrStatus::Merged;
                    pr.clone()
                };
                self.persist(run_id, &updated);
                self.log_merge(
                    run_id,
                    &format!("[pr] {} merged commit={}", updated.id, commit),
                );
                info!(pr = %updated.id, commit = %commit, "pull request merged");
                MergeResult::ok(commit)
            }
            Ok(out) => {
                self.log_merge(
                    run_id,
                    &format!(
                        "[pr] {} merge FAILED conflicts={} {}",
                        pr.id, out.had_conflicts, out.stderr
                    ),
                );
                MergeResult {
                    success: false,
                    commit: None,
                    had_conflicts: out.had_conflicts,
                    error: Some(out.stderr),
                }
            }
            Err(e) => {
                self.log_merge(run_id, &format!("[pr] {} merge FAILED: {}", pr.id, e));
                MergeResult::fail(e.to_string())
            }
        }
    }

    /// `open`/`approved` -> `closed` without merging.
    pub async fn close_pull_request(&self, run_id: &str, pr_id: &str) -> Result<PullRequest> {
        let mut prs = self.prs.lock().await;
        let pr = prs
            .get_mut(pr_id)
            .ok_or_else(|| MergerError::PrNotFound(pr_id.to_string()))?;
        if !pr.status.can_transition_to(PrStatus::Closed) {
            return Err(MergerError::InvalidPrTransition {
                id: pr_id.to_string(),
                from: pr.status,
                to: PrStatus::Closed,
            });
        }
        pr.status = PrStatus::Closed;
        let pr = pr.clone();
        drop(prs);

        self.persist(run_id, &pr);
        self.log_merge(run_id, &format!("[pr] {} closed", pr.id));
        Ok(pr)
    }

    pub async fn pull_request(&self, pr_id: &str) -> Option<PullRequest> {
        self.prs.lock().await.get(pr_id).cloned()
    }

    pub async fn pull_requests(&self) -> Vec<PullRequest> {
        self.prs.lock().await.values().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn generate_description(&self, run_id: &str, spec: &PullRequestSpec) -> String {
        let prompt = format!(
            "Write a concise pull request description (3-6 sentences, markdown) for \
             merging branch '{}' into '{}'. Ticket: {}. Title: {}.",
            spec.source_branch, spec.target_branch, spec.ticket_id, spec.title
        );
        match self.adapter.generate(&prompt).await {
            Ok(completion) => completion.content,
            Err(e) => {
                self.run_paths(run_id).log_error(
                    ErrorCode::AdapterFallback,
                    true,
                    &format!("PR description generation failed: {}", e),
                );
                format!(
                    "Merge `{}` into `{}` for {}.",
                    spec.source_branch, spec.target_branch, spec.ticket_id
                )
            }
        }
    }

    fn persist(&self, run_id: &str, pr: &PullRequest) {
        let path = self.run_paths(run_id).pr_file(&pr.id);
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(error = %e, "PR snapshot dir create failed");
                return;
            }
        }
        match serde_json::to_string_pretty(pr) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    warn!(path = %path.display(), error = %e, "PR snapshot write failed");
                }
            }
            Err(e) => warn!(error = %e, "PR serialize failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ac_adapters::MockAdapter;
    use ac_git::process::ScriptedRunner;

    fn merger(runner: ScriptedRunner, dir: &Path) -> (MergerAgent, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        let git = Arc::new(GitManager::new(runner.clone(), dir.join("runtime")));
        let agent = MergerAgent::new(
            git,
            Arc::new(MockAdapter::new()),
            dir.join("runtime"),
            MergerConfig::default(),
        );
        (agent, runner)
    }

    fn request(dir: &Path, target: Option<&str>) -> MergeRequest {
        MergeRequest {
            run_id: "run-m-000001".to_string(),
            repo_dir: dir.to_path_buf(),
            source: "feature/x".to_string(),
            target: target.map(str::to_string),
            ticket: "TICKET-1".to_string(),
            message: None,
        }
    }

    #[tokio::test]
    async fn protected_target_rejected_without_git() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, runner) = merger(ScriptedRunner::new(), dir.path());

        for target in ["main", "master", "MAIN", "Master"] {
            let result = agent.merge(&request(dir.path(), Some(target))).await;
            assert!(!result.success);
            assert!(result.error.as_deref().unwrap().contains("direct"));
            assert!(result.commit.is_none());
        }
        // No git invocation happened at all.
        assert!(runner.calls().is_empty());

        let log = std::fs::read_to_string(
            dir.path().join("runtime/runs/run-m-000001/merge.log"),
        )
        .unwrap();
        assert!(log.contains("REJECTED"));
    }

    #[tokio::test]
    async fn default_target_is_integration_branch() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, runner) = merger(
            ScriptedRunner::new()
                .push_ok("") // checkout develop
                .push_ok("") // merge
                .push_ok("abc123\n"), // rev-parse
            dir.path(),
        );

        let result = agent.merge(&request(dir.path(), None)).await;
        assert!(result.success);
        assert_eq!(result.commit.as_deref(), Some("abc123"));

        let lines = runner.call_lines();
        assert_eq!(lines[0], "git checkout develop");
        assert!(lines[1].contains("merge --no-ff feature/x"));
        assert!(lines[1].contains("[TICKET-1] Merge feature/x into develop"));
    }

    #[tokio::test]
    async fn conflicted_merge_reports_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _) = merger(
            ScriptedRunner::new()
                .push_ok("") // checkout
                .push_fail(1, "CONFLICT (content): merge conflict in src/lib.rs"),
            dir.path(),
        );

        let result = agent.merge(&request(dir.path(), None)).await;
        assert!(!result.success);
        assert!(result.had_conflicts);
    }

    #[tokio::test]
    async fn pr_lifecycle_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, runner) = merger(
            ScriptedRunner::new()
                .push_ok(" M src/api.rs\n?? docs/notes.md\n") // status for create
                .push_ok("4\n") // rev-list count
                .push_ok("") // checkout main (merge_pull_request)
                .push_ok("") // merge
                .push_ok("feedbeef\n"), // rev-parse
            dir.path(),
        );

        let pr = agent
            .create_pull_request(
                "run-m-000002",
                dir.path(),
                PullRequestSpec {
                    title: "Release develop".into(),
                    description: Some("Ship it.".into()),
                    source_branch: "develop".into(),
                    target_branch: "main".into(),
                    ticket_id: "TICKET-2".into(),
                },
            )
            .await
            .unwrap();

        assert!(pr.id.starts_with("pr-"));
        assert_eq!(pr.status, PrStatus::Open);
        assert_eq!(pr.changed_files, vec!["src/api.rs", "docs/notes.md"]);
        assert_eq!(pr.commit_count, 4);

        // Snapshot exists on disk.
        let snapshot = dir
            .path()
            .join("runtime/runs/run-m-000002")
            .join(format!("{}.json", pr.id));
        assert!(snapshot.exists());

        let approved = agent
            .approve_pull_request("run-m-000002", &pr.id)
            .await
            .unwrap();
        assert_eq!(approved.status, PrStatus::Approved);

        let result = agent
            .merge_pull_request("run-m-000002", dir.path(), &pr.id)
            .await;
        assert!(result.success);
        assert_eq!(result.commit.as_deref(), Some("feedbeef"));
        assert_eq!(
            agent.pull_request(&pr.id).await.unwrap().status,
            PrStatus::Merged
        );

        // The underlying merge really ran against the protected target.
        let lines = runner.call_lines();
        assert!(lines.iter().any(|l| l == "git checkout main"));
        assert!(lines.iter().any(|l| l.contains("merge --no-ff develop")));
    }

    #[tokio::test]
    async fn unapproved_pr_cannot_merge() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, runner) = merger(
            ScriptedRunner::new().push_ok("").push_ok("0\n"),
            dir.path(),
        );

        let pr = agent
            .create_pull_request(
                "run-m-000003",
                dir.path(),
                PullRequestSpec {
                    title: "Too eager".into(),
                    description: Some("nope".into()),
                    source_branch: "develop".into(),
                    target_branch: "main".into(),
                    ticket_id: "TICKET-3".into(),
                },
            )
            .await
            .unwrap();

        let calls_before = runner.calls().len();
        let result = agent
            .merge_pull_request("run-m-000003", dir.path(), &pr.id)
            .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("not approved"));
        // No further git traffic for the refused merge.
        assert_eq!(runner.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn double_approval_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _) = merger(
            ScriptedRunner::new().push_ok("").push_ok("0\n"),
            dir.path(),
        );

        let pr = agent
            .create_pull_request(
                "run-m-000004",
                dir.path(),
                PullRequestSpec {
                    title: "Once only".into(),
                    description: Some("d".into()),
                    source_branch: "develop".into(),
                    target_branch: "main".into(),
                    ticket_id: "T-4".into(),
                },
            )
            .await
            .unwrap();

        agent
            .approve_pull_request("run-m-000004", &pr.id)
            .await
            .unwrap();
        let err = agent
            .approve_pull_request("run-m-000004", &pr.id)
            .await
            .unwrap_err();
        assert!(matches!(err, MergerError::InvalidPrTransition { .. }));
    }

    #[tokio::test]
    async fn unknown_pr_operations_fail() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _) = merger(ScriptedRunner::new(), dir.path());

        let err = agent
            .approve_pull_request("run-m-000005", "pr-ghost")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PrNotFound);

        let result = agent
            .merge_pull_request("run-m-000005", dir.path(), "pr-ghost")
            .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn missing_description_is_generated_by_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().push_ok("").push_ok("1\n"));
        let git = Arc::new(GitManager::new(runner.clone(), dir.path().join("runtime")));
        let agent = MergerAgent::new(
            git,
            Arc::new(MockAdapter::new().with_content("Generated summary of the change.")),
            dir.path().join("runtime"),
            MergerConfig::default(),
        );

        let pr = agent
            .create_pull_request(
                "run-m-000006",
                dir.path(),
                PullRequestSpec {
                    title: "Auto description".into(),
                    description: None,
                    source_branch: "develop".into(),
                    target_branch: "main".into(),
                    ticket_id: "T-6".into(),
                },
            )
            .await
            .unwrap();

        assert_eq!(pr.description, "Generated summary of the change.");
    }

    #[tokio::test]
    async fn pr_ids_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _) = merger(ScriptedRunner::new(), dir.path());

        let mut seen = std::collections::HashSet::new();
        for i in 0..10 {
            let pr = agent
                .create_pull_request(
                    "run-m-000007",
                    dir.path(),
                    PullRequestSpec {
                        title: format!("pr {}", i),
                        description: Some("d".into()),
                        source_branch: "develop".into(),
                        target_branch: "main".into(),
                        ticket_id: format!("T-{}", i),
                    },
                )
                .await
                .unwrap();
            assert!(seen.insert(pr.id));
        }
    }

    #[tokio::test]
    async fn closed_pr_absorbs_open_and_approved() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _) = merger(
            ScriptedRunner::new().push_ok("").push_ok("0\n"),
            dir.path(),
        );

        let pr = agent
            .create_pull_request(
                "run-m-000008",
                dir.path(),
                PullRequestSpec {
                    title: "To close".into(),
                    description: Some("d".into()),
                    source_branch: "develop".into(),
                    target_branch: "main".into(),
                    ticket_id: "T-8".into(),
                },
            )
            .await
            .unwrap();

        let closed = agent
            .close_pull_request("run-m-000008", &pr.id)
            .await
            .unwrap();
        assert_eq!(closed.status, PrStatus::Closed);

        // A closed PR cannot be approved or merged.
        assert!(agent
            .approve_pull_request("run-m-000008", &pr.id)
            .await
            .is_err());
        let result = agent
            .merge_pull_request("run-m-000008", dir.path(), &pr.id)
            .await;
        assert!(!result.success);
    }
}
