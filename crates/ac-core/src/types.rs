use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Instruction
// ---------------------------------------------------------------------------

/// A free-form operator request against one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    pub text: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
}

impl Instruction {
    pub fn new(text: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            project_id: project_id.into(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// ParentStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentStatus {
    Pending,
    Decomposing,
    Executing,
    Reviewing,
    Completed,
    Failed,
}

impl ParentStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// The happy path is pending -> decomposing -> executing -> reviewing ->
    /// completed; any non-terminal state may fail.
    pub fn can_transition_to(&self, target: ParentStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if target == ParentStatus::Failed {
            return true;
        }
        matches!(
            (self, target),
            (ParentStatus::Pending, ParentStatus::Decomposing)
                | (ParentStatus::Decomposing, ParentStatus::Executing)
                | (ParentStatus::Executing, ParentStatus::Reviewing)
                | (ParentStatus::Reviewing, ParentStatus::Completed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ParentStatus::Completed | ParentStatus::Failed)
    }
}

// ---------------------------------------------------------------------------
// ParentTask
// ---------------------------------------------------------------------------

/// Root of a decomposition: one operator instruction under one manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentTask {
    pub id: String,
    pub project_id: String,
    pub instruction: String,
    pub status: ParentStatus,
    pub assigned_manager: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ParentTask {
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project_id: project_id.into(),
            instruction: instruction.into(),
            status: ParentStatus::Pending,
            assigned_manager: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// SubTaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Blocked,
}

impl SubTaskStatus {
    /// pending -> assigned -> running -> completed; assigned/running may go
    /// to failed or blocked; blocked and failed return to pending on
    /// reassignment.
    pub fn can_transition_to(&self, target: SubTaskStatus) -> bool {
        matches!(
            (self, target),
            (SubTaskStatus::Pending, SubTaskStatus::Assigned)
                | (SubTaskStatus::Assigned, SubTaskStatus::Running)
                | (SubTaskStatus::Assigned, SubTaskStatus::Failed)
                | (SubTaskStatus::Assigned, SubTaskStatus::Blocked)
                | (SubTaskStatus::Running, SubTaskStatus::Completed)
                | (SubTaskStatus::Running, SubTaskStatus::Failed)
                | (SubTaskStatus::Running, SubTaskStatus::Blocked)
                | (SubTaskStatus::Blocked, SubTaskStatus::Pending)
                | (SubTaskStatus::Failed, SubTaskStatus::Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubTaskStatus::Pending => "pending",
            SubTaskStatus::Assigned => "assigned",
            SubTaskStatus::Running => "running",
            SubTaskStatus::Completed => "completed",
            SubTaskStatus::Failed => "failed",
            SubTaskStatus::Blocked => "blocked",
        }
    }
}

// ---------------------------------------------------------------------------
// EffortEstimate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffortEstimate {
    Small,
    Medium,
    Large,
}

impl EffortEstimate {
    /// Case-insensitive normalisation; anything unrecognised is `Medium`.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "small" => EffortEstimate::Small,
            "large" => EffortEstimate::Large,
            _ => EffortEstimate::Medium,
        }
    }
}

// ---------------------------------------------------------------------------
// SubTask
// ---------------------------------------------------------------------------

/// Unit of work produced by decomposition and executed by one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: String,
    pub parent_id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub status: SubTaskStatus,
    pub assignee: Option<String>,
    pub estimated_effort: Option<EffortEstimate>,
    pub artifacts: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubTask {
    pub fn new(
        id: impl Into<String>,
        parent_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            parent_id: parent_id.into(),
            title: title.into(),
            description: description.into(),
            acceptance_criteria: Vec::new(),
            status: SubTaskStatus::Pending,
            assignee: None,
            estimated_effort: None,
            artifacts: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
    Error,
    Terminated,
}

/// Hiring specification for a new worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub name: String,
    pub capabilities: Vec<String>,
    pub priority: i32,
    pub adapter: Option<String>,
    pub model: Option<String>,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: vec!["general".to_string()],
            priority: 0,
            adapter: None,
            model: None,
        }
    }

    pub fn with_capabilities(mut self, caps: Vec<String>) -> Self {
        self.capabilities = caps;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Pool-member record. Owned exclusively by the manager; other components
/// hold worker ids only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub status: WorkerStatus,
    pub hired_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub completed_count: u32,
    pub failed_count: u32,
    pub consecutive_failures: u32,
    pub health_score: f64,
    pub priority: i32,
    pub adapter: Option<String>,
    pub model: Option<String>,
}

impl WorkerInfo {
    pub fn from_spec(id: impl Into<String>, spec: WorkerSpec) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: spec.name,
            capabilities: spec.capabilities,
            status: WorkerStatus::Idle,
            hired_at: now,
            last_activity: now,
            completed_count: 0,
            failed_count: 0,
            consecutive_failures: 0,
            health_score: 100.0,
            priority: spec.priority,
            adapter: spec.adapter,
            model: spec.model,
        }
    }

    /// Fraction of finished tasks that succeeded; 0.0 with no history.
    pub fn success_rate(&self) -> f64 {
        let total = self.completed_count + self.failed_count;
        if total == 0 {
            return 0.0;
        }
        f64::from(self.completed_count) / f64::from(total)
    }

    /// Fraction of finished tasks that failed; 0.0 with no history.
    pub fn failure_rate(&self) -> f64 {
        let total = self.completed_count + self.failed_count;
        if total == 0 {
            return 0.0;
        }
        f64::from(self.failed_count) / f64::from(total)
    }
}

// ---------------------------------------------------------------------------
// Failure / escalation records
// ---------------------------------------------------------------------------

/// Error payload reported by a worker alongside `task_failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerError {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

/// Audit record of one worker failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: String,
    pub worker_id: String,
    pub sub_task_id: String,
    pub error: WorkerError,
    pub timestamp: DateTime<Utc>,
    pub support_provided: bool,
    pub resolved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    Error,
    Blocked,
    HelpNeeded,
    QualityFailed,
}

/// A worker's request for manager or reviewer help.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,
    pub from_worker: String,
    pub sub_task_id: String,
    pub issue: String,
    pub kind: EscalationKind,
    pub timestamp: DateTime<Utc>,
}

/// Guidance returned by the manager when supporting a struggling worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guidance {
    pub advice: String,
    pub suggested_actions: Vec<String>,
    pub additional_resources: Vec<String>,
}

// ---------------------------------------------------------------------------
// Pull requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrStatus {
    Open,
    Approved,
    Merged,
    Closed,
}

impl PrStatus {
    /// open -> approved -> merged, strictly monotonic; closed absorbs any
    /// non-merged state.
    pub fn can_transition_to(&self, target: PrStatus) -> bool {
        matches!(
            (self, target),
            (PrStatus::Open, PrStatus::Approved)
                | (PrStatus::Approved, PrStatus::Merged)
                | (PrStatus::Open, PrStatus::Closed)
                | (PrStatus::Approved, PrStatus::Closed)
        )
    }
}

/// Merge proposal owned by the merger agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: String,
    pub title: String,
    pub description: String,
    pub source_branch: String,
    pub target_branch: String,
    pub ticket_id: String,
    pub status: PrStatus,
    pub changed_files: Vec<String>,
    pub commit_count: u32,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Conflict reporting
// ---------------------------------------------------------------------------

/// Per-file snapshot of an unresolved merge conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictFile {
    pub path: String,
    pub has_base: bool,
    pub has_ours: bool,
    pub has_theirs: bool,
    pub auto_resolvable: bool,
}

/// Snapshot of a merge that auto-resolution could not complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictReport {
    pub timestamp: DateTime<Utc>,
    pub branch: String,
    pub total: usize,
    pub files: Vec<ConflictFile>,
    pub summary: String,
}

// ---------------------------------------------------------------------------
// External file contracts
// ---------------------------------------------------------------------------

/// Project descriptor handed to the daemon as an input argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDescriptor {
    pub id: String,
    pub name: String,
    pub git_url: String,
    pub default_branch: String,
    pub integration_branch: String,
    pub work_dir: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
    Running,
}

/// `runtime/runs/<run-id>/result.json`, written by worker collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: String,
    pub ticket_id: String,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub logs: Vec<String>,
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JudgmentStatus {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "WAIVER")]
    Waiver,
}

/// Per-gate outcomes inside a quality judgment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityChecks {
    pub lint: bool,
    pub test: bool,
    pub e2e: bool,
    pub format: bool,
}

/// `runtime/runs/<run-id>/judgment.json`, written by the quality authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityJudgment {
    pub status: JudgmentStatus,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub checks: QualityChecks,
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiver_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
