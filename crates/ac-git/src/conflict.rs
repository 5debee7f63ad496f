//! Three-way merge conflict auto-resolution.
//!
//! For every conflicted path the base, ours and theirs stages are compared
//! and the deterministic cases are resolved in place:
//!
//! 1. ours == theirs                -> ours
//! 2. ours empty, theirs not        -> theirs (keep the change over delete)
//! 3. theirs empty, ours not        -> ours
//! 4. ours == base, theirs changed  -> theirs
//! 5. theirs == base, ours changed  -> ours
//! 6. otherwise                     -> unresolvable, markers stay in place
//!
//! Full resolution stages the files and creates an automatic merge commit.
//! Anything less produces a [`ConflictReport`] and an `escalate` message to
//! the reviewer.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use ac_bus::{AgentMessage, MessageBus, MessageKind};
use ac_core::types::{ConflictFile, ConflictReport};

use crate::manager::{GitManager, Result};

/// Bus address of the external reviewer collaborator.
pub const REVIEWER_AGENT: &str = "reviewer";

// ---------------------------------------------------------------------------
// Three-way rule
// ---------------------------------------------------------------------------

/// Apply the resolution rules to one file's stage contents. `None` means
/// the conflict needs a human.
pub fn resolve_three_way(base: &str, ours: &str, theirs: &str) -> Option<String> {
    if ours == theirs {
        return Some(ours.to_string());
    }
    if ours.is_empty() && !theirs.is_empty() {
        return Some(theirs.to_string());
    }
    if theirs.is_empty() && !ours.is_empty() {
        return Some(ours.to_string());
    }
    if ours == base && theirs != base {
        return Some(theirs.to_string());
    }
    if theirs == base && ours != base {
        return Some(ours.to_string());
    }
    None
}

// ---------------------------------------------------------------------------
// Resolution outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Resolution {
    /// Every conflicted file resolved; the automatic merge commit is `commit`.
    Resolved { commit: String, files: Vec<String> },
    /// At least one file could not be resolved; markers remain in place.
    Unresolved { report: ConflictReport },
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved { .. })
    }
}

// ---------------------------------------------------------------------------
// ConflictResolver
// ---------------------------------------------------------------------------

pub struct ConflictResolver {
    git: Arc<GitManager>,
    bus: MessageBus,
}

impl ConflictResolver {
    pub fn new(git: Arc<GitManager>, bus: MessageBus) -> Self {
        Self { git, bus }
    }

    /// Attempt to auto-resolve the conflicts left by a failed merge of
    /// `branch` in `dir`.
    pub async fn auto_resolve(&self, run_id: &str, dir: &Path, branch: &str) -> Result<Resolution> {
        let paths = self.git.conflicting_files(dir).await?;
        let mut resolved: Vec<String> = Vec::new();
        let mut files: Vec<ConflictFile> = Vec::with_capacity(paths.len());

        for path in &paths {
            let base = self.git.stage_content(dir, 1, path).await?;
            let ours = self.git.stage_content(dir, 2, path).await?;
            let theirs = self.git.stage_content(dir, 3, path).await?;

            let entry_base = base.unwrap_or_default();
            let entry_ours = ours.clone().unwrap_or_default();
            let entry_theirs = theirs.clone().unwrap_or_default();

            let resolution = resolve_three_way(&entry_base, &entry_ours, &entry_theirs);
            files.push(ConflictFile {
                path: path.clone(),
                has_base: !entry_base.is_empty(),
                has_ours: ours.is_some(),
                has_theirs: theirs.is_some(),
                auto_resolvable: resolution.is_some(),
            });

            if let Some(content) = resolution {
                let target = dir.join(path);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(crate::process::ProcessError::from)?;
                }
                tokio::fs::write(&target, content)
                    .await
                    .map_err(crate::process::ProcessError::from)?;
                resolved.push(path.clone());
            }
        }

        if resolved.len() == paths.len() && !paths.is_empty() {
            self.git.stage_paths(run_id, dir, &resolved).await?;
            let commit = self
                .git
                .commit(
                    run_id,
                    dir,
                    &format!("Auto-merge {} ({} files resolved)", branch, resolved.len()),
                )
                .await?;
            info!(branch, files = resolved.len(), "merge conflicts auto-resolved");
            return Ok(Resolution::Resolved {
                commit,
                files: resolved,
            });
        }

        let unresolved = files.iter().filter(|f| !f.auto_resolvable).count();
        let report = ConflictReport {
            timestamp: Utc::now(),
            branch: branch.to_string(),
            total: files.len(),
            summary: format!(
                "{} of {} conflicting files need manual resolution on {}",
                unresolved,
                files.len(),
                branch
            ),
            files,
        };

        self.escalate(run_id, &report);
        warn!(branch, unresolved, "merge conflicts escalated to reviewer");
        Ok(Resolution::Unresolved { report })
    }

    fn escalate(&self, run_id: &str, report: &ConflictReport) {
        let payload = serde_json::json!({
            "reason": "merge_conflict",
            "branch": report.branch,
            "summary": report.summary,
            "files": report.files,
        });
        let msg = AgentMessage::new(MessageKind::Escalate, "git-manager", REVIEWER_AGENT, payload)
            .with_run_id(run_id);
        if let Err(e) = self.bus.send(msg) {
            warn!(error = %e, "conflict escalation could not be delivered");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
