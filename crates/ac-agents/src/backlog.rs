//! Backlog persistence.
//!
//! Each sub-task is mirrored to `workflows/backlog/<sub-task-id>.md` as
//! YAML frontmatter plus the standard work-item sections. The file's
//! existence is the observable contract for "this sub-task is in the
//! backlog".

use std::path::{Path, PathBuf};

use chrono::Utc;

use ac_core::error::ErrorCode;
use ac_core::types::SubTask;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BacklogError {
    #[error("sub-task is missing a required field: {0}")]
    MissingField(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed backlog file {path}: {reason}")]
    Malformed { path: String, reason: String },
}

impl BacklogError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BacklogError::MissingField(_) => ErrorCode::InvalidInput,
            BacklogError::Io(_) | BacklogError::Malformed { .. } => ErrorCode::ValidationError,
        }
    }
}

pub type Result<T> = std::result::Result<T, BacklogError>;

// ---------------------------------------------------------------------------
// BacklogStore
// ---------------------------------------------------------------------------

/// Frontmatter fields recovered when reading a backlog file back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklogEntry {
    pub id: String,
    pub parent_id: String,
    pub status: String,
    pub assignee: String,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct BacklogStore {
    dir: PathBuf,
}

impl BacklogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, sub_task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.md", sub_task_id))
    }

    pub fn contains(&self, sub_task_id: &str) -> bool {
        self.path_for(sub_task_id).exists()
    }

    /// Write (or rewrite) the backlog file for a sub-task.
    pub fn save(&self, task: &SubTask) -> Result<PathBuf> {
        if task.id.trim().is_empty() {
            return Err(BacklogError::MissingField("id"));
        }
        if task.parent_id.trim().is_empty() {
            return Err(BacklogError::MissingField("parent_id"));
        }

        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&task.id);
        std::fs::write(&path, render(task))?;
        Ok(path)
    }

    pub fn remove(&self, sub_task_id: &str) -> Result<()> {
        let path = self.path_for(sub_task_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Ids of every sub-task currently present in the backlog directory.
    pub fn list_ids(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<String> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.strip_suffix(".md").map(str::to_string)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Parse a backlog file's frontmatter and title heading.
    pub fn load(&self, sub_task_id: &str) -> Result<BacklogEntry> {
        let path = self.path_for(sub_task_id);
        let content = std::fs::read_to_string(&path)?;
        parse(&path, &content)
    }
}

// ---------------------------------------------------------------------------
// Rendering / parsing
// ---------------------------------------------------------------------------

fn yaml_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn render(task: &SubTask) -> String {
    let mut out = String::new();

    out.push_str("---\n");
    out.push_str(&format!("id: {}\n", yaml_quote(&task.id)));
    out.push_str(&format!("parent_id: {}\n", yaml_quote(&task.parent_id)));
    out.push_str(&format!("status: {}\n", yaml_quote(task.status.as_str())));
    out.push_str(&format!(
        "assignee: {}\n",
        yaml_quote(task.assignee.as_deref().unwrap_or(""))
    ));
    out.push_str(&format!(
        "created: {}\n",
        yaml_quote(&task.created_at.to_rfc3339())
    ));
    out.push_str(&format!(
        "updated: {}\n",
        yaml_quote(&task.updated_at.to_rfc3339())
    ));
    out.push_str("---\n\n");

    out.push_str(&format!("# {}\n\n", task.title));

    out.push_str("## Purpose\n\n");
    out.push_str(&task.description);
    out.push_str("\n\n");

    out.push_str("## Scope\n\n- _To be refined during implementation._\n\n");

    out.push_str("## DoD\n\n");
    if task.acceptance_criteria.is_empty() {
        out.push_str("- [ ] Task completed as described\n");
    } else {
        for crit in &task.acceptance_criteria {
            out.push_str(&format!("- [ ] {}\n", crit));
        }
    }
    out.push('\n');

    out.push_str("## Risk\n\n| Risk | Mitigation |\n| --- | --- |\n| _TBD_ | _TBD_ |\n\n");

    out.push_str("## Rollback\n\n_Revert the task branch._\n\n");

    out.push_str("## Work Log\n\n");
    out.push_str(&format!("### {}\n\n", Utc::now().format("%Y-%m-%d")));
    out.push_str("- Created from decomposition.\n");

    out
}

fn parse(path: &Path, content: &str) -> Result<BacklogEntry> {
    let malformed = |reason: &str| BacklogError::Malformed {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };

    let rest = content
        .strip_prefix("---\n")
        .ok_or_else(|| malformed("missing frontmatter open"))?;
    let end = rest
        .find("\n---\n")
        .ok_or_else(|| malformed("missing frontmatter close"))?;
    let frontmatter = &rest[..end];
    let body = &rest[end + 5..];

    let field = |key: &str| -> Option<String> {
        frontmatter.lines().find_map(|line| {
            let value = line.strip_prefix(&format!("{}: ", key))?;
            let value = value.trim();
            let value = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .unwrap_or(value);
            Some(value.replace("''", "'"))
        })
    };

    let id = field("id").ok_or_else(|| malformed("missing id"))?;
    let parent_id = field("parent_id").ok_or_else(|| malformed("missing parent_id"))?;
    let status = field("status").unwrap_or_default();
    let assignee = field("assignee").unwrap_or_default();

    let title = body
        .lines()
        .find_map(|l| l.strip_prefix("# "))
        .unwrap_or("")
        .to_string();

    Ok(BacklogEntry {
        id,
        parent_id,
        status,
        assignee,
        title,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> SubTask {
        let mut t = SubTask::new(
            "task-p1-000000-001",
            "task-p1-000000",
            "Create user model",
            "Define the user entity and its persistence.",
        );
        t.acceptance_criteria = vec![
            "Schema migration exists".to_string(),
            "Model round-trips through the store".to_string(),
        ];
        t
    }

    #[test]
    fn save_writes_frontmatter_and_sections() {
        let dir = tempfile::tempdir().unwrap();
        let store = BacklogStore::new(dir.path().join("workflows/backlog"));

        let path = store.save(&sample_task()).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();

        assert!(content.starts_with("---\n"));
        assert!(content.contains("id: 'task-p1-000000-001'"));
        assert!(content.contains("parent_id: 'task-p1-000000'"));
        assert!(content.contains("status: 'pending'"));
        assert!(content.contains("assignee: ''"));
        assert!(content.contains("# Create user model"));
        assert!(content.contains("## Purpose"));
        assert!(content.contains("## Scope"));
        assert!(content.contains("## DoD"));
        assert!(content.contains("- [ ] Schema migration exists"));
        assert!(content.contains("## Risk"));
        assert!(content.contains("## Rollback"));
        assert!(content.contains("## Work Log"));
    }

    #[test]
    fn empty_criteria_get_default_checkbox() {
        let dir = tempfile::tempdir().unwrap();
        let store = BacklogStore::new(dir.path());
        let mut t = sample_task();
        t.acceptance_criteria.clear();

        store.save(&t).unwrap();
        let content = std::fs::read_to_string(store.path_for(&t.id)).unwrap();
        assert!(content.contains("- [ ] Task completed as described"));
    }

    #[test]
    fn empty_parent_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = BacklogStore::new(dir.path());
        let mut t = sample_task();
        t.parent_id = String::new();

        let err = store.save(&t).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }

    #[test]
    fn empty_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = BacklogStore::new(dir.path());
        let mut t = sample_task();
        t.id = "  ".to_string();
        assert!(store.save(&t).is_err());
    }

    #[test]
    fn directory_is_created_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c/backlog");
        let store = BacklogStore::new(&nested);
        store.save(&sample_task()).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn contains_tracks_file_existence() {
        let dir = tempfile::tempdir().unwrap();
        let store = BacklogStore::new(dir.path());
        let t = sample_task();

        assert!(!store.contains(&t.id));
        store.save(&t).unwrap();
        assert!(store.contains(&t.id));
        store.remove(&t.id).unwrap();
        assert!(!store.contains(&t.id));
    }

    #[test]
    fn load_round_trips_frontmatter() {
        let dir = tempfile::tempdir().unwrap();
        let store = BacklogStore::new(dir.path());
        let mut t = sample_task();
        t.assignee = Some("worker-a-bcdef1".to_string());
        store.save(&t).unwrap();

        let entry = store.load(&t.id).unwrap();
        assert_eq!(entry.id, t.id);
        assert_eq!(entry.parent_id, t.parent_id);
        assert_eq!(entry.status, "pending");
        assert_eq!(entry.assignee, "worker-a-bcdef1");
        assert_eq!(entry.title, "Create user model");
    }

    #[test]
    fn list_ids_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = BacklogStore::new(dir.path());
        let mut a = sample_task();
        a.id = "task-x-000000-002".to_string();
        let mut b = sample_task();
        b.id = "task-x-000000-001".to_string();
        store.save(&a).unwrap();
        store.save(&b).unwrap();

        assert_eq!(
            store.list_ids().unwrap(),
            vec![
                "task-x-000000-001".to_string(),
                "task-x-000000-002".to_string()
            ]
        );
    }

    #[test]
    fn titles_with_quotes_survive() {
        let dir = tempfile::tempdir().unwrap();
        let store = BacklogStore::new(dir.path());
        let mut t = sample_task();
        t.id = "task-q-000000-001".to_string();
        t.assignee = Some("it's-a-worker".to_string());
        store.save(&t).unwrap();
        let entry = store.load(&t.id).unwrap();
        assert_eq!(entry.assignee, "it's-a-worker");
    }
}
