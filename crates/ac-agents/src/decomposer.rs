//! Instruction decomposition.
//!
//! Turns one operator instruction plus project context into a validated
//! set of sub-tasks: the adapter is asked for a JSON plan, the plan is
//! parsed and normalised, ids are allocated, and every sub-task is
//! mirrored into the backlog directory.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use ac_adapters::{Adapter, AdapterError, ChatMessage};
use ac_core::error::ErrorCode;
use ac_core::ids;
use ac_core::types::{EffortEstimate, SubTask};

use crate::backlog::{BacklogError, BacklogStore};
use crate::graph::{self, DependencyGraph};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DecomposerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("could not extract a plan from the model response: {0}")]
    Parse(String),

    #[error("sub-task {index} is invalid: {reason}")]
    Validation { index: usize, reason: String },

    #[error("expected at least {min} sub-tasks, got {got}")]
    InsufficientSubtasks { got: usize, min: usize },

    #[error("adapter call failed: {0}")]
    Ai(#[from] AdapterError),

    #[error(transparent)]
    Backlog(#[from] BacklogError),
}

impl DecomposerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DecomposerError::InvalidInput(_) => ErrorCode::InvalidInput,
            DecomposerError::Parse(_) => ErrorCode::ParseError,
            DecomposerError::Validation { .. } => ErrorCode::ValidationError,
            DecomposerError::InsufficientSubtasks { .. } => ErrorCode::InsufficientSubtasks,
            DecomposerError::Ai(AdapterError::Timeout) => ErrorCode::AdapterTimeout,
            DecomposerError::Ai(AdapterError::Connection(_)) => ErrorCode::AdapterConnectionError,
            DecomposerError::Ai(_) => ErrorCode::AiError,
            DecomposerError::Backlog(e) => e.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DecomposerError>;

// ---------------------------------------------------------------------------
// Options / context / outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposeOptions {
    pub min_subtasks: usize,
    pub max_subtasks: usize,
    pub include_estimates: bool,
    pub generate_acceptance_criteria: bool,
}

impl Default for DecomposeOptions {
    fn default() -> Self {
        Self {
            min_subtasks: 1,
            max_subtasks: 10,
            include_estimates: false,
            generate_acceptance_criteria: true,
        }
    }
}

/// Project facts embedded into the planning prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectContext {
    pub project_id: String,
    pub tech_stack: Vec<String>,
    pub files: Vec<String>,
    pub notes: Option<String>,
}

impl ProjectContext {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposeOutcome {
    pub parent_id: String,
    pub sub_tasks: Vec<SubTask>,
    pub tokens: u64,
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Plan wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPlan {
    sub_tasks: Vec<RawSubTask>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSubTask {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
    #[serde(default)]
    estimated_effort: Option<String>,
}

// ---------------------------------------------------------------------------
// TaskDecomposer
// ---------------------------------------------------------------------------

pub struct TaskDecomposer {
    adapter: Arc<dyn Adapter>,
    backlog: BacklogStore,
    options: DecomposeOptions,
}

impl TaskDecomposer {
    pub fn new(adapter: Arc<dyn Adapter>, backlog: BacklogStore) -> Self {
        Self {
            adapter,
            backlog,
            options: DecomposeOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DecomposeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &DecomposeOptions {
        &self.options
    }

    /// Decompose one instruction into persisted, pending sub-tasks.
    pub async fn decompose(
        &self,
        instruction: &str,
        context: &ProjectContext,
    ) -> Result<DecomposeOutcome> {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(DecomposerError::InvalidInput(
                "instruction must not be empty".into(),
            ));
        }
        if context.project_id.trim().is_empty() {
            return Err(DecomposerError::InvalidInput(
                "context must carry a project id".into(),
            ));
        }

        let started = std::time::Instant::now();
        let messages = [
            ChatMessage::system(self.system_prompt()),
            ChatMessage::user(self.user_prompt(instruction, context)),
        ];
        let completion = self.adapter.chat(&messages).await?;
        debug!(
            model = %completion.model,
            tokens = completion.tokens,
            "decomposition plan received"
        );

        let json = extract_json(&completion.content)
            .ok_or_else(|| DecomposerError::Parse("no JSON object in response".into()))?;
        let plan: RawPlan =
            serde_json::from_str(&json).map_err(|e| DecomposerError::Parse(e.to_string()))?;

        let mut entries = plan.sub_tasks;
        for (i, entry) in entries.iter().enumerate() {
            if entry.title.trim().is_empty() {
                return Err(DecomposerError::Validation {
                    index: i + 1,
                    reason: "empty title".into(),
                });
            }
            if entry.description.trim().is_empty() {
                return Err(DecomposerError::Validation {
                    index: i + 1,
                    reason: "empty description".into(),
                });
            }
        }

        if entries.len() < self.options.min_subtasks {
            return Err(DecomposerError::InsufficientSubtasks {
                got: entries.len(),
                min: self.options.min_subtasks,
            });
        }
        entries.truncate(self.options.max_subtasks);

        let parent_id = ids::task_id();
        let mut sub_tasks = Vec::with_capacity(entries.len());
        for (i, entry) in entries.into_iter().enumerate() {
            let mut task = SubTask::new(
                ids::sub_task_id(&parent_id, i + 1),
                &parent_id,
                entry.title.trim(),
                entry.description.trim(),
            );
            task.acceptance_criteria = entry
                .acceptance_criteria
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
            if self.options.include_estimates {
                task.estimated_effort = Some(
                    entry
                        .estimated_effort
                        .as_deref()
                        .map(EffortEstimate::normalize)
                        .unwrap_or(EffortEstimate::Medium),
                );
            }
            self.backlog.save(&task)?;
            sub_tasks.push(task);
        }

        info!(
            parent_id = %parent_id,
            count = sub_tasks.len(),
            "instruction decomposed"
        );

        Ok(DecomposeOutcome {
            parent_id,
            sub_tasks,
            tokens: completion.tokens,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Dependency edges over a decomposition result.
    pub fn analyze_dependencies(&self, sub_tasks: &[SubTask]) -> DependencyGraph {
        graph::analyze(sub_tasks)
    }

    /// Parallel execution levels for a dependency graph.
    pub fn parallel_levels(&self, graph: &DependencyGraph) -> Vec<Vec<String>> {
        graph::parallel_levels(graph)
    }

    pub fn backlog(&self) -> &BacklogStore {
        &self.backlog
    }

    fn system_prompt(&self) -> String {
        let criteria = if self.options.generate_acceptance_criteria {
            "Each sub-task must include an acceptanceCriteria array of verifiable statements."
        } else {
            "acceptanceCriteria may be omitted."
        };
        let estimates = if self.options.include_estimates {
            " Include an estimatedEffort field for each sub-task: one of small, medium, large."
        } else {
            ""
        };
        format!(
            "You are a software delivery planner. Split the given instruction into \
             independent sub-tasks that separate workers can execute in isolation. \
             Respond with JSON only, of the shape \
             {{\"subTasks\": [{{\"title\": \"...\", \"description\": \"...\", \
             \"acceptanceCriteria\": [\"...\"]}}]}}. {}{} \
             Produce between {} and {} sub-tasks.",
            criteria, estimates, self.options.min_subtasks, self.options.max_subtasks
        )
    }

    fn user_prompt(&self, instruction: &str, context: &ProjectContext) -> String {
        let mut prompt = format!("Project: {}\n", context.project_id);
        if !context.tech_stack.is_empty() {
            prompt.push_str(&format!("Tech stack: {}\n", context.tech_stack.join(", ")));
        }
        if !context.files.is_empty() {
            prompt.push_str("Key files:\n");
            for f in context.files.iter().take(40) {
                prompt.push_str(&format!("  - {}\n", f));
            }
        }
        if let Some(ref notes) = context.notes {
            prompt.push_str(&format!("Notes: {}\n", notes));
        }
        prompt.push_str(&format!("\nInstruction:\n{}\n", instruction));
        prompt
    }
}

// ---------------------------------------------------------------------------
// JSON extraction
// ---------------------------------------------------------------------------

/// Pull a JSON object out of a model response: a fenced ```json block when
/// present, otherwise the longest brace-balanced `{...}` slice.
fn extract_json(content: &str) -> Option<String> {
    if let Some(start) = content.find("```json") {
        let after = &content[start + 7..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if !inner.is_empty() {
                return Some(inner.to_string());
            }
        }
    }

    let bytes = content.as_bytes();
    let mut best: Option<(usize, usize)> = None;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            let mut depth = 0usize;
            let mut in_string = false;
            let mut escaped = false;
            for (j, &b) in bytes.iter().enumerate().skip(i) {
                if in_string {
                    if escaped {
                        escaped = false;
                    } else if b == b'\\' {
                        escaped = true;
                    } else if b == b'"' {
                        in_string = false;
                    }
                    continue;
                }
                match b {
                    b'"' => in_string = true,
                    b'{' => depth += 1,
                    b'}' => {
                        depth -= 1;
                        if depth == 0 {
                            let len = j + 1 - i;
                            if best.is_none_or(|(_, l)| len > l) {
                                best = Some((i, len));
                            }
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }
        i += 1;
    }

    best.map(|(start, len)| content[start..start + len].to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ac_adapters::MockAdapter;

    fn decomposer(mock: MockAdapter, dir: &std::path::Path) -> TaskDecomposer {
        TaskDecomposer::new(
            Arc::new(mock),
            BacklogStore::new(dir.join("workflows/backlog")),
        )
    }

    fn two_task_plan() -> &'static str {
        r#"{"subTasks": [
            {"title": "Create user model", "description": "Define the user entity"},
            {"title": "Implement user API", "description": "Expose CRUD endpoints"}
        ]}"#
    }

    #[tokio::test]
    async fn decompose_produces_sequential_ids() {
        let dir = tempfile::tempdir().unwrap();
        let d = decomposer(MockAdapter::new().with_content(two_task_plan()), dir.path());

        let outcome = d
            .decompose(
                "Create a user management feature",
                &ProjectContext::new("proj-1"),
            )
            .await
            .unwrap();

        assert_eq!(outcome.sub_tasks.len(), 2);
        assert_eq!(
            outcome.sub_tasks[0].id,
            format!("{}-001", outcome.parent_id)
        );
        assert_eq!(
            outcome.sub_tasks[1].id,
            format!("{}-002", outcome.parent_id)
        );
        for t in &outcome.sub_tasks {
            assert_eq!(t.parent_id, outcome.parent_id);
            assert_eq!(t.status, ac_core::types::SubTaskStatus::Pending);
            assert_eq!(t.created_at, t.updated_at);
            assert!(d.backlog().contains(&t.id));
        }
        assert_eq!(outcome.tokens, 42);
    }

    #[tokio::test]
    async fn empty_instruction_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let d = decomposer(MockAdapter::new(), dir.path());
        let err = d
            .decompose("   ", &ProjectContext::new("proj-1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn missing_project_id_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let d = decomposer(MockAdapter::new(), dir.path());
        let err = d
            .decompose("do something", &ProjectContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn fenced_json_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let content = format!("Here is the plan:\n```json\n{}\n```\nDone.", two_task_plan());
        let d = decomposer(MockAdapter::new().with_content(content), dir.path());

        let outcome = d
            .decompose("plan it", &ProjectContext::new("proj-1"))
            .await
            .unwrap();
        assert_eq!(outcome.sub_tasks.len(), 2);
    }

    #[tokio::test]
    async fn prose_without_json_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let d = decomposer(
            MockAdapter::new().with_content("I cannot split this task."),
            dir.path(),
        );
        let err = d
            .decompose("plan it", &ProjectContext::new("proj-1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ParseError);
    }

    #[tokio::test]
    async fn empty_title_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let d = decomposer(
            MockAdapter::new().with_content(
                r#"{"subTasks": [{"title": " ", "description": "something"}]}"#,
            ),
            dir.path(),
        );
        let err = d
            .decompose("plan it", &ProjectContext::new("proj-1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn too_few_subtasks_fails() {
        let dir = tempfile::tempdir().unwrap();
        let d = decomposer(
            MockAdapter::new().with_content(two_task_plan()),
            dir.path(),
        )
        .with_options(DecomposeOptions {
            min_subtasks: 3,
            ..Default::default()
        });
        let err = d
            .decompose("plan it", &ProjectContext::new("proj-1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InsufficientSubtasks);
    }

    #[tokio::test]
    async fn excess_subtasks_are_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let plan = r#"{"subTasks": [
            {"title": "a", "description": "a"},
            {"title": "b", "description": "b"},
            {"title": "c", "description": "c"}
        ]}"#;
        let d = decomposer(MockAdapter::new().with_content(plan), dir.path()).with_options(
            DecomposeOptions {
                max_subtasks: 2,
                ..Default::default()
            },
        );
        let outcome = d
            .decompose("plan it", &ProjectContext::new("proj-1"))
            .await
            .unwrap();
        assert_eq!(outcome.sub_tasks.len(), 2);
    }

    #[tokio::test]
    async fn criteria_are_cleaned_and_effort_normalised() {
        let dir = tempfile::tempdir().unwrap();
        let plan = r#"{"subTasks": [{
            "title": "Build it",
            "description": "Do the work",
            "acceptanceCriteria": ["  works  ", "", "   "],
            "estimatedEffort": "Enormous"
        }]}"#;
        let d = decomposer(MockAdapter::new().with_content(plan), dir.path()).with_options(
            DecomposeOptions {
                include_estimates: true,
                ..Default::default()
            },
        );
        let outcome = d
            .decompose("plan it", &ProjectContext::new("proj-1"))
            .await
            .unwrap();
        let t = &outcome.sub_tasks[0];
        assert_eq!(t.acceptance_criteria, vec!["works".to_string()]);
        assert_eq!(t.estimated_effort, Some(EffortEstimate::Medium));
    }

    #[tokio::test]
    async fn adapter_errors_surface_as_ai_errors() {
        let dir = tempfile::tempdir().unwrap();
        let d = decomposer(
            MockAdapter::new().with_error(AdapterError::Timeout),
            dir.path(),
        );
        let err = d
            .decompose("plan it", &ProjectContext::new("proj-1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AdapterTimeout);
    }

    #[tokio::test]
    async fn prompt_embeds_project_facts() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockAdapter::new().with_content(two_task_plan()));
        let d = TaskDecomposer::new(
            mock.clone(),
            BacklogStore::new(dir.path().join("backlog")),
        );

        let mut ctx = ProjectContext::new("shop-api");
        ctx.tech_stack = vec!["rust".into(), "postgres".into()];
        ctx.notes = Some("monorepo".into());
        d.decompose("add carts", &ctx).await.unwrap();

        let captured = mock.captured_prompts();
        assert_eq!(captured.len(), 1);
        assert!(captured[0].contains("shop-api"));
        assert!(captured[0].contains("rust, postgres"));
        assert!(captured[0].contains("monorepo"));
        assert!(captured[0].contains("add carts"));
        assert!(captured[0].contains("subTasks"));
    }

    #[test]
    fn extract_json_prefers_fenced_block() {
        let content = "intro {\"stray\": 1} \n```json\n{\"subTasks\": []}\n```";
        assert_eq!(extract_json(content).unwrap(), "{\"subTasks\": []}");
    }

    #[test]
    fn extract_json_takes_longest_slice() {
        let content = r#"small {"a":1} and bigger {"subTasks": [{"title": "t"}]} end"#;
        let json = extract_json(content).unwrap();
        assert!(json.contains("subTasks"));
    }

    #[test]
    fn extract_json_handles_braces_in_strings() {
        let content = r#"{"title": "has } brace", "n": 1}"#;
        let json = extract_json(content).unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["n"], 1);
    }

    #[test]
    fn extract_json_none_for_prose() {
        assert!(extract_json("no braces here").is_none());
    }
}
