//! Project workspace and branch-name allocation.
//!
//! The workspace manager maps project ids to isolated working directories
//! and sub-tasks to `agent/<ticket>-<slug>` branches. Allocation is
//! deterministic: the same project id always resolves to the same path,
//! and distinct ids always resolve to distinct paths.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("project id must not be empty")]
    EmptyProjectId,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

// ---------------------------------------------------------------------------
// Branch / slug helpers
// ---------------------------------------------------------------------------

/// Lower-case, collapse non-alphanumeric runs to `-`, strip edge dashes,
/// truncate to `max` characters.
pub fn slugify(text: &str, max: usize) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_dash = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out.truncate(max);
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Task branch name: `agent/<ticket>-<slug>` with a 50-character slug.
pub fn task_branch_name(ticket_id: &str, description: &str) -> String {
    let slug = slugify(description, 50);
    if slug.is_empty() {
        format!("agent/{}", slugify(ticket_id, 50))
    } else {
        format!("agent/{}-{}", slugify(ticket_id, 50), slug)
    }
}

/// Commit message: `[<ticket-id>] <description>`.
pub fn commit_message(ticket_id: &str, description: &str) -> String {
    format!("[{}] {}", ticket_id, description)
}

/// Case-insensitive protected-branch check (`main` / `master`).
pub fn is_protected_branch(name: &str) -> bool {
    let lower = name.trim().to_ascii_lowercase();
    lower == "main" || lower == "master"
}

// ---------------------------------------------------------------------------
// WorkspaceManager
// ---------------------------------------------------------------------------

/// Allocates per-project working directories under a single work root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceManager {
    work_root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
        }
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    /// Resolve the working directory for a project without touching disk.
    ///
    /// The directory name is the sanitised project id suffixed with a short
    /// hash of the raw id, so ids that sanitise identically ("My Project"
    /// vs "my-project") still map to distinct paths.
    pub fn project_dir(&self, project_id: &str) -> Result<PathBuf> {
        if project_id.trim().is_empty() {
            return Err(WorkspaceError::EmptyProjectId);
        }
        let slug = slugify(project_id, 40);
        let tag = short_hash(project_id);
        let name = if slug.is_empty() {
            tag
        } else {
            format!("{}-{}", slug, tag)
        };
        Ok(self.work_root.join(name))
    }

    /// Resolve and create the working directory for a project.
    pub fn allocate(&self, project_id: &str) -> Result<PathBuf> {
        let dir = self.project_dir(project_id)?;
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// FNV-1a over the raw id, rendered as 8 hex chars. Stable across runs.
fn short_hash(input: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("{:08x}", (hash >> 32) as u32 ^ hash as u32)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_collapses_and_trims() {
        assert_eq!(slugify("Fix the  login -- bug!", 50), "fix-the-login-bug");
        assert_eq!(slugify("---", 50), "");
        assert_eq!(slugify("Add API endpoint", 50), "add-api-endpoint");
    }

    #[test]
    fn slug_truncates_without_trailing_dash() {
        let long = "a very long description that keeps going and going and going";
        let slug = slugify(long, 20);
        assert!(slug.len() <= 20);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn branch_names_follow_grammar() {
        let b = task_branch_name("TICKET-42", "Implement user API");
        assert_eq!(b, "agent/ticket-42-implement-user-api");
        assert!(b.starts_with("agent/"));
        assert!(b
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '/'));
    }

    #[test]
    fn branch_name_embeds_ticket() {
        let b = task_branch_name("abc123", "do thing");
        assert!(b.contains("abc123"));
    }

    #[test]
    fn commit_messages_carry_ticket_prefix() {
        assert_eq!(
            commit_message("TICKET-1", "Create user model"),
            "[TICKET-1] Create user model"
        );
    }

    #[test]
    fn protected_branches_case_insensitive() {
        assert!(is_protected_branch("main"));
        assert!(is_protected_branch("MAIN"));
        assert!(is_protected_branch("Master"));
        assert!(!is_protected_branch("develop"));
        assert!(!is_protected_branch("main-2"));
    }

    #[test]
    fn project_dirs_are_distinct_and_stable() {
        let wm = WorkspaceManager::new("/tmp/work");
        let a1 = wm.project_dir("proj-a").unwrap();
        let a2 = wm.project_dir("proj-a").unwrap();
        let b = wm.project_dir("proj-b").unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn colliding_slugs_stay_distinct() {
        let wm = WorkspaceManager::new("/tmp/work");
        let a = wm.project_dir("My Project").unwrap();
        let b = wm.project_dir("my-project").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_project_id_rejected() {
        let wm = WorkspaceManager::new("/tmp/work");
        assert!(wm.project_dir("  ").is_err());
    }

    #[test]
    fn allocate_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let wm = WorkspaceManager::new(dir.path());
        let p = wm.allocate("demo").unwrap();
        assert!(p.is_dir());
        // Idempotent
        let p2 = wm.allocate("demo").unwrap();
        assert_eq!(p, p2);
    }
}
