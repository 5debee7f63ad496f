//! ManagerAgent — scheduler-supervisor for one worker pool.
//!
//! The manager owns a parent task's lifecycle end to end: it drives the
//! decomposer, holds the worker pool and the assignment map, reacts to
//! completion/failure/escalation traffic on the bus, arbitrates quality
//! gates, and adjusts pool size against the pending workload.
//!
//! Ownership rules: workers and sub-tasks are held by id in maps the
//! manager alone mutates; everything that crosses the bus is an id plus a
//! JSON payload, never a shared reference.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ac_adapters::Adapter;
use ac_bus::{AgentMessage, BusError, MessageBus, MessageKind};
use ac_core::error::ErrorCode;
use ac_core::ids;
use ac_core::runlog::RunPaths;
use ac_core::shutdown::ShutdownSignal;
use ac_core::types::{
    Escalation, EscalationKind, FailureRecord, Guidance, ParentStatus, ParentTask, QualityChecks,
    SubTask, SubTaskStatus, WorkerError, WorkerInfo, WorkerSpec, WorkerStatus,
};

use crate::backlog::BacklogStore;
use crate::decomposer::{DecomposeOutcome, DecomposerError, ProjectContext, TaskDecomposer};
use crate::graph::DependencyGraph;
use crate::pool::{PoolConfig, PoolError, ScaleAction, WorkerPool};

/// Bus address of the external quality authority collaborator.
pub const QUALITY_AUTHORITY: &str = "quality_authority";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("worker {worker} already has an active sub-task")]
    WorkerBusy { worker: String },

    #[error("sub-task {id} is not assignable in status {status:?}")]
    NotAssignable { id: String, status: SubTaskStatus },

    #[error("sub-task {id} cannot complete from status {status:?}")]
    NotCompletable { id: String, status: SubTaskStatus },

    #[error("dependency graph for {0} contains a cycle")]
    CyclicDependencies(String),

    #[error("decomposition failed: {0}")]
    Decomposition(#[from] DecomposerError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl ManagerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ManagerError::InvalidInput(_) => ErrorCode::InvalidInput,
            ManagerError::TaskNotFound(_) => ErrorCode::NoCurrentTask,
            ManagerError::WorkerNotFound(_) => ErrorCode::WorkerNotFound,
            ManagerError::WorkerBusy { .. }
            | ManagerError::NotAssignable { .. }
            | ManagerError::NotCompletable { .. } => ErrorCode::AssignmentError,
            ManagerError::CyclicDependencies(_) => ErrorCode::DecompositionError,
            ManagerError::Decomposition(e) => match e.code() {
                // Adapter-level codes pass through; everything else is a
                // decomposition failure from the manager's point of view.
                ErrorCode::AdapterTimeout | ErrorCode::AdapterConnectionError => e.code(),
                _ => ErrorCode::DecompositionError,
            },
            ManagerError::Pool(e) => e.code(),
            ManagerError::Bus(_) => ErrorCode::CommunicationError,
        }
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Bus address of this manager.
    pub name: String,
    pub pool: PoolConfig,
    pub monitor_interval: Duration,
    pub autoscale_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: "manager".to_string(),
            pool: PoolConfig::default(),
            monitor_interval: Duration::from_secs(2),
            autoscale_interval: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Progress / decision types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusTotals {
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub totals: StatusTotals,
    /// worker id -> sub-task id; absence means idle.
    pub assignments: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerProgress {
    pub worker_id: String,
    pub name: String,
    pub status: WorkerStatus,
    pub current_sub_task: Option<String>,
    pub consecutive_failures: u32,
    pub health_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailedProgress {
    pub snapshot: ProgressSnapshot,
    pub workers: Vec<WorkerProgress>,
    pub failure_count: usize,
    pub overall_percent: f64,
    pub active_escalations: usize,
}

/// What the manager did about one reported failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    /// Recoverable error below every threshold: the worker may try again.
    Retried,
    /// Support threshold reached: guidance dispatched.
    SupportProvided,
    /// Past the support threshold: handed to a different worker.
    Reassigned { new_worker: Option<String> },
    /// Replace threshold or health floor hit: fresh hire took over.
    Replaced { new_worker: String },
    /// Far past every threshold: escalated to the quality authority.
    Escalated,
    /// Non-recoverable but below thresholds: back to the pending queue.
    Requeued,
}

/// Quality-gate arbitration result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Retry { instructions: String },
    Reassign { new_worker: Option<String> },
    Escalate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSnapshot {
    pub pending_tasks: usize,
    pub active_workers: usize,
    pub idle_workers: usize,
    /// Pending per active worker; equals the pending count when the pool
    /// is empty.
    pub workload_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingReport {
    pub action: String,
    pub workers_added: usize,
    pub workers_removed: usize,
    pub pool_size: usize,
    pub workload_ratio: f64,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct ManagerState {
    tasks: HashMap<String, ParentTask>,
    sub_tasks: HashMap<String, SubTask>,
    graphs: HashMap<String, DependencyGraph>,
    /// worker id -> sub-task id. No entry means the worker is idle.
    assignments: HashMap<String, String>,
    /// sub-task id -> run id of its latest assignment.
    assignment_runs: HashMap<String, String>,
    pool: WorkerPool,
    failures: Vec<FailureRecord>,
    escalations: Vec<Escalation>,
}

struct LoopHandle {
    shutdown: ShutdownSignal,
    handle: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// ManagerAgent
// ---------------------------------------------------------------------------

pub struct ManagerAgent {
    config: ManagerConfig,
    bus: MessageBus,
    decomposer: TaskDecomposer,
    backlog: BacklogStore,
    runtime_root: PathBuf,
    state: Arc<Mutex<ManagerState>>,
    monitor: Mutex<Option<LoopHandle>>,
    autoscaler: Mutex<Option<LoopHandle>>,
}

impl ManagerAgent {
    pub fn new(
        config: ManagerConfig,
        adapter: Arc<dyn Adapter>,
        bus: MessageBus,
        backlog: BacklogStore,
        runtime_root: impl Into<PathBuf>,
    ) -> Self {
        let pool = WorkerPool::new(config.pool.clone());
        Self {
            decomposer: TaskDecomposer::new(adapter, backlog.clone()),
            backlog,
            bus,
            runtime_root: runtime_root.into(),
            state: Arc::new(Mutex::new(ManagerState {
                tasks: HashMap::new(),
                sub_tasks: HashMap::new(),
                graphs: HashMap::new(),
                assignments: HashMap::new(),
                assignment_runs: HashMap::new(),
                pool,
                failures: Vec::new(),
                escalations: Vec::new(),
            })),
            monitor: Mutex::new(None),
            autoscaler: Mutex::new(None),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn scaling_config(&self) -> PoolConfig {
        self.config.pool.clone()
    }

    fn run_paths(&self, run_id: &str) -> RunPaths {
        RunPaths::new(&self.runtime_root, run_id)
    }

    // -----------------------------------------------------------------------
    // Task intake
    // -----------------------------------------------------------------------

    /// Accept a parent task: validates it, stamps this manager as the
    /// assignee and moves it into `decomposing`.
    pub async fn receive_task(&self, mut task: ParentTask) -> Result<ParentTask> {
        if task.id.trim().is_empty() {
            return Err(ManagerError::InvalidInput("task id must not be empty".into()));
        }
        if task.instruction.trim().is_empty() {
            return Err(ManagerError::InvalidInput(
                "task instruction must not be empty".into(),
            ));
        }
        if !task.status.can_transition_to(ParentStatus::Decomposing) {
            return Err(ManagerError::InvalidInput(format!(
                "task {} cannot start decomposition from {:?}",
                task.id, task.status
            )));
        }

        task.status = ParentStatus::Decomposing;
        task.assigned_manager = Some(self.config.name.clone());
        task.updated_at = Utc::now();

        let mut state = self.state.lock().await;
        state.tasks.insert(task.id.clone(), task.clone());
        info!(task = %task.id, "parent task accepted");
        Ok(task)
    }

    /// Decompose a received task into sub-tasks and move it to `executing`.
    /// A cyclic dependency graph is refused as a schedule and fails the
    /// parent.
    pub async fn decompose_task(
        &self,
        task_id: &str,
        context: &ProjectContext,
    ) -> Result<DecomposeOutcome> {
        let instruction = {
            let state = self.state.lock().await;
            let task = state
                .tasks
                .get(task_id)
                .ok_or_else(|| ManagerError::TaskNotFound(task_id.to_string()))?;
            task.instruction.clone()
        };

        let outcome = match self.decomposer.decompose(&instruction, context).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let mut state = self.state.lock().await;
                if let Some(task) = state.tasks.get_mut(task_id) {
                    task.status = ParentStatus::Failed;
                    task.updated_at = Utc::now();
                }
                return Err(e.into());
            }
        };

        let graph = self.decomposer.analyze_dependencies(&outcome.sub_tasks);

        let mut state = self.state.lock().await;
        for sub in &outcome.sub_tasks {
            state.sub_tasks.insert(sub.id.clone(), sub.clone());
        }

        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ManagerError::TaskNotFound(task_id.to_string()))?;
        if graph.has_cycle {
            task.status = ParentStatus::Failed;
            task.updated_at = Utc::now();
            state.graphs.insert(outcome.parent_id.clone(), graph);
            return Err(ManagerError::CyclicDependencies(outcome.parent_id.clone()));
        }
        task.status = ParentStatus::Executing;
        task.updated_at = Utc::now();
        state.graphs.insert(outcome.parent_id.clone(), graph);

        info!(
            task = %task_id,
            parent = %outcome.parent_id,
            sub_tasks = outcome.sub_tasks.len(),
            "task decomposed"
        );
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Assignment
    // -----------------------------------------------------------------------

    /// Assign one pending sub-task to one worker. Returns the run id that
    /// scopes the assignment's audit logs.
    pub async fn assign_task(&self, sub_task_id: &str, worker_id: &str) -> Result<String> {
        if worker_id.trim().is_empty() {
            return Err(ManagerError::InvalidInput(
                "worker id must not be empty".into(),
            ));
        }

        let mut state = self.state.lock().await;

        let sub = state
            .sub_tasks
            .get(sub_task_id)
            .ok_or_else(|| ManagerError::TaskNotFound(sub_task_id.to_string()))?
            .clone();
        if !state.tasks.contains_key(&sub.parent_id) {
            return Err(ManagerError::TaskNotFound(sub.parent_id.clone()));
        }
        if !sub.status.can_transition_to(SubTaskStatus::Assigned) {
            return Err(ManagerError::NotAssignable {
                id: sub.id.clone(),
                status: sub.status,
            });
        }
        if state.assignments.contains_key(worker_id) {
            return Err(ManagerError::WorkerBusy {
                worker: worker_id.to_string(),
            });
        }

        state.pool.register(worker_id)?;
        {
            let worker = state
                .pool
                .get_mut(worker_id)
                .ok_or_else(|| ManagerError::WorkerNotFound(worker_id.to_string()))?;
            worker.status = WorkerStatus::Working;
            worker.last_activity = Utc::now();
        }

        let run_id = ids::run_id();
        let project_id = state
            .tasks
            .get(&sub.parent_id)
            .map(|t| t.project_id.clone())
            .unwrap_or_default();

        {
            let sub = state.sub_tasks.get_mut(sub_task_id).expect("checked above");
            sub.status = SubTaskStatus::Assigned;
            sub.assignee = Some(worker_id.to_string());
            sub.updated_at = Utc::now();
            let _ = self.backlog.save(sub);
        }
        state
            .assignments
            .insert(worker_id.to_string(), sub_task_id.to_string());
        state
            .assignment_runs
            .insert(sub_task_id.to_string(), run_id.clone());

        let payload = serde_json::json!({
            "subTask": state.sub_tasks.get(sub_task_id),
            "project": { "projectId": project_id, "parentId": sub.parent_id },
        });
        drop(state);

        self.bus.send(
            AgentMessage::new(MessageKind::TaskAssign, &self.config.name, worker_id, payload)
                .with_run_id(&run_id),
        )?;

        info!(sub_task = %sub_task_id, worker = %worker_id, run = %run_id, "sub-task assigned");
        Ok(run_id)
    }

    /// Assign a batch of (sub-task, worker) pairs concurrently.
    pub async fn assign_tasks_in_parallel(
        &self,
        pairs: Vec<(String, String)>,
    ) -> Vec<Result<String>> {
        futures::future::join_all(
            pairs
                .iter()
                .map(|(sub, worker)| self.assign_task(sub, worker)),
        )
        .await
    }

    /// Pending sub-tasks whose dependencies are all completed.
    pub async fn eligible_sub_tasks(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .sub_tasks
            .values()
            .filter(|s| s.status == SubTaskStatus::Pending)
            .filter(|s| {
                state
                    .graphs
                    .get(&s.parent_id)
                    .map(|g| {
                        g.dependencies_of(&s.id).iter().all(|dep| {
                            state
                                .sub_tasks
                                .get(*dep)
                                .is_some_and(|d| d.status == SubTaskStatus::Completed)
                        })
                    })
                    .unwrap_or(true)
            })
            .map(|s| s.id.clone())
            .collect()
    }

    /// Best idle worker for a sub-task (capability/health/priority score).
    pub async fn select_best_worker(&self, sub_task_id: &str) -> Result<Option<String>> {
        let state = self.state.lock().await;
        let sub = state
            .sub_tasks
            .get(sub_task_id)
            .ok_or_else(|| ManagerError::TaskNotFound(sub_task_id.to_string()))?;
        Ok(state.pool.select_best(sub))
    }

    /// Assign every eligible sub-task to the best available worker.
    /// Sub-tasks with no matching idle worker stay pending; the
    /// auto-scaler closes that gap.
    pub async fn dispatch_pending(&self) -> Vec<(String, String)> {
        let eligible = self.eligible_sub_tasks().await;
        let mut assigned = Vec::new();
        for sub_id in eligible {
            let pick = {
                let state = self.state.lock().await;
                state
                    .sub_tasks
                    .get(&sub_id)
                    .and_then(|sub| state.pool.select_best(sub))
            };
            let Some(worker_id) = pick else { continue };
            match self.assign_task(&sub_id, &worker_id).await {
                Ok(_) => assigned.push((sub_id, worker_id)),
                Err(e) => warn!(sub_task = %sub_id, error = %e, "dispatch failed"),
            }
        }
        assigned
    }

    // -----------------------------------------------------------------------
    // Progress
    // -----------------------------------------------------------------------

    pub async fn monitor_progress(&self) -> ProgressSnapshot {
        let state = self.state.lock().await;
        let mut totals = StatusTotals::default();
        for sub in state.sub_tasks.values() {
            match sub.status {
                SubTaskStatus::Pending => totals.pending += 1,
                SubTaskStatus::Assigned => totals.assigned += 1,
                SubTaskStatus::Running => totals.running += 1,
                SubTaskStatus::Completed => totals.completed += 1,
                SubTaskStatus::Failed => totals.failed += 1,
                SubTaskStatus::Blocked => totals.blocked += 1,
            }
        }
        ProgressSnapshot {
            totals,
            assignments: state.assignments.clone(),
        }
    }

    pub async fn monitor_detailed_progress(&self) -> DetailedProgress {
        let snapshot = self.monitor_progress().await;
        let state = self.state.lock().await;

        let workers = state
            .pool
            .all()
            .into_iter()
            .map(|w| WorkerProgress {
                worker_id: w.id.clone(),
                name: w.name.clone(),
                status: w.status,
                current_sub_task: state.assignments.get(&w.id).cloned(),
                consecutive_failures: w.consecutive_failures,
                health_score: w.health_score,
            })
            .collect();

        let total = state.sub_tasks.len();
        let overall_percent = if total == 0 {
            0.0
        } else {
            100.0 * snapshot.totals.completed as f64 / total as f64
        };

        DetailedProgress {
            snapshot,
            workers,
            failure_count: state.failures.len(),
            overall_percent,
            active_escalations: state.escalations.len(),
        }
    }

    pub async fn worker_info(&self, worker_id: &str) -> Option<WorkerInfo> {
        self.state.lock().await.pool.get(worker_id).cloned()
    }

    pub async fn workers(&self) -> Vec<WorkerInfo> {
        self.state
            .lock()
            .await
            .pool
            .all()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn failure_history(&self) -> Vec<FailureRecord> {
        self.state.lock().await.failures.clone()
    }

    pub async fn workload(&self) -> WorkloadSnapshot {
        let state = self.state.lock().await;
        let pending_tasks = state
            .sub_tasks
            .values()
            .filter(|s| s.status == SubTaskStatus::Pending)
            .count();
        let active_workers = state.pool.size();
        WorkloadSnapshot {
            pending_tasks,
            active_workers,
            idle_workers: state.pool.idle().len(),
            workload_ratio: pending_tasks as f64 / active_workers.max(1) as f64,
        }
    }

    // -----------------------------------------------------------------------
    // Pool mutations
    // -----------------------------------------------------------------------

    pub async fn hire_worker(&self, spec: WorkerSpec) -> Result<String> {
        let mut state = self.state.lock().await;
        Ok(state.pool.hire(spec)?)
    }

    /// Terminate a worker. Any sub-task it held goes back to pending with
    /// the assignee cleared.
    pub async fn fire_worker(&self, worker_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.pool.fire(worker_id)?;
        Self::release_assignment(&mut state, worker_id, &self.backlog);
        Ok(())
    }

    pub async fn replace_worker(
        &self,
        worker_id: &str,
        spec: Option<WorkerSpec>,
    ) -> Result<String> {
        let mut state = self.state.lock().await;
        let new_id = state.pool.replace(worker_id, spec)?;
        Self::release_assignment(&mut state, worker_id, &self.backlog);
        Ok(new_id)
    }

    /// Drop a worker's assignment and reset the sub-task to pending.
    fn release_assignment(state: &mut ManagerState, worker_id: &str, backlog: &BacklogStore) {
        if let Some(sub_id) = state.assignments.remove(worker_id) {
            if let Some(sub) = state.sub_tasks.get_mut(&sub_id) {
                if sub.status == SubTaskStatus::Assigned || sub.status == SubTaskStatus::Running {
                    sub.status = SubTaskStatus::Failed;
                }
                if sub.status.can_transition_to(SubTaskStatus::Pending) {
                    sub.status = SubTaskStatus::Pending;
                }
                sub.assignee = None;
                sub.updated_at = Utc::now();
                let _ = backlog.save(sub);
            }
        }
    }

    /// Replace every worker past the replace threshold or under the health
    /// floor. Returns `(old, new)` pairs.
    pub async fn perform_health_check(&self) -> Vec<(String, String)> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let ids: Vec<String> = state.pool.active().iter().map(|w| w.id.clone()).collect();
        for id in &ids {
            state.pool.recompute_health(id, now);
        }

        let mut replaced = Vec::new();
        for old_id in state.pool.unhealthy() {
            match state.pool.replace(&old_id, None) {
                Ok(new_id) => {
                    Self::release_assignment(&mut state, &old_id, &self.backlog);
                    info!(old = %old_id, new = %new_id, "unhealthy worker replaced");
                    replaced.push((old_id, new_id));
                }
                Err(e) => warn!(worker = %old_id, error = %e, "replacement failed"),
            }
        }
        replaced
    }

    /// One scaling pass driven by the pending workload.
    pub async fn scale_workers_by_workload(&self) -> ScalingReport {
        let mut state = self.state.lock().await;
        let pending = state
            .sub_tasks
            .values()
            .filter(|s| s.status == SubTaskStatus::Pending)
            .count();
        let decision = state.pool.scaling_decision(pending, Instant::now());

        match decision.action {
            ScaleAction::ScaleUp { workers_to_add } => {
                let mut added = 0;
                for _ in 0..workers_to_add {
                    match state.pool.hire(WorkerSpec::new("auto-worker")) {
                        Ok(_) => added += 1,
                        Err(e) => {
                            warn!(error = %e, "scale-up hire failed");
                            break;
                        }
                    }
                }
                if added > 0 {
                    state.pool.record_scale(Instant::now());
                }
                info!(added, pending, "pool scaled up");
                ScalingReport {
                    action: "scaled_up".into(),
                    workers_added: added,
                    workers_removed: 0,
                    pool_size: state.pool.size(),
                    workload_ratio: decision.workload_ratio,
                    reason: decision.reason,
                }
            }
            ScaleAction::ScaleDown { candidates } => {
                let mut removed = 0;
                for id in &candidates {
                    match state.pool.fire(id) {
                        Ok(()) => {
                            Self::release_assignment(&mut state, id, &self.backlog);
                            removed += 1;
                        }
                        Err(e) => warn!(worker = %id, error = %e, "scale-down fire failed"),
                    }
                }
                if removed > 0 {
                    state.pool.record_scale(Instant::now());
                }
                info!(removed, "pool scaled down");
                ScalingReport {
                    action: "scaled_down".into(),
                    workers_added: 0,
                    workers_removed: removed,
                    pool_size: state.pool.size(),
                    workload_ratio: decision.workload_ratio,
                    reason: decision.reason,
                }
            }
            ScaleAction::NoChange => ScalingReport {
                action: "no_change".into(),
                workers_added: 0,
                workers_removed: 0,
                pool_size: state.pool.size(),
                workload_ratio: decision.workload_ratio,
                reason: decision.reason,
            },
        }
    }

    // -----------------------------------------------------------------------
    // Completion / failure handling
    // -----------------------------------------------------------------------

    /// A worker finished its sub-task.
    ///
    /// A completion that does not fit the sub-task's current status (a
    /// stray or duplicate message after the task was already failed or
    /// requeued) is rejected before any state changes.
    pub async fn handle_task_complete(&self, worker_id: &str, sub_task_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        let parent_id = {
            let sub = state
                .sub_tasks
                .get_mut(sub_task_id)
                .ok_or_else(|| ManagerError::TaskNotFound(sub_task_id.to_string()))?;
            if sub.status == SubTaskStatus::Assigned {
                sub.status = SubTaskStatus::Running;
            }
            if !sub.status.can_transition_to(SubTaskStatus::Completed) {
                return Err(ManagerError::NotCompletable {
                    id: sub.id.clone(),
                    status: sub.status,
                });
            }
            sub.status = SubTaskStatus::Completed;
            sub.updated_at = Utc::now();
            let _ = self.backlog.save(sub);
            sub.parent_id.clone()
        };

        state.assignments.remove(worker_id);
        state.assignment_runs.remove(sub_task_id);

        if let Some(worker) = state.pool.get_mut(worker_id) {
            worker.consecutive_failures = 0;
            worker.completed_count += 1;
            worker.status = WorkerStatus::Idle;
            worker.last_activity = Utc::now();
        }
        for record in state
            .failures
            .iter_mut()
            .filter(|f| f.worker_id == worker_id && !f.resolved)
        {
            record.resolved = true;
        }
        state.pool.recompute_health(worker_id, Utc::now());

        // Parent review check: every sub-task under this parent done?
        let all_done = state
            .sub_tasks
            .values()
            .filter(|s| s.parent_id == parent_id)
            .all(|s| s.status == SubTaskStatus::Completed);
        if all_done {
            if let Some(task) = state.tasks.get_mut(&parent_id) {
                if task.status.can_transition_to(ParentStatus::Reviewing) {
                    task.status = ParentStatus::Reviewing;
                    task.updated_at = Utc::now();
                    info!(task = %parent_id, "all sub-tasks completed; task under review");
                }
            }
        }

        debug!(worker = %worker_id, sub_task = %sub_task_id, "completion recorded");
        Ok(())
    }

    /// A worker reported a failure. Records it, updates worker health, and
    /// decides what happens next.
    pub async fn handle_task_failed(
        &self,
        worker_id: &str,
        sub_task_id: &str,
        error: WorkerError,
    ) -> Result<FailureAction> {
        let run_id = {
            let mut state = self.state.lock().await;

            state.assignments.remove(worker_id);
            let run_id = state.assignment_runs.get(sub_task_id).cloned();

            let record = FailureRecord {
                id: format!("failure-{}", state.failures.len() + 1),
                worker_id: worker_id.to_string(),
                sub_task_id: sub_task_id.to_string(),
                error: error.clone(),
                timestamp: Utc::now(),
                support_provided: false,
                resolved: false,
            };
            state.failures.push(record);

            if let Some(worker) = state.pool.get_mut(worker_id) {
                worker.failed_count += 1;
                worker.consecutive_failures += 1;
                worker.status = WorkerStatus::Error;
                worker.last_activity = Utc::now();
            }
            state.pool.recompute_health(worker_id, Utc::now());

            if let Some(sub) = state.sub_tasks.get_mut(sub_task_id) {
                if sub.status.can_transition_to(SubTaskStatus::Failed) {
                    sub.status = SubTaskStatus::Failed;
                }
                sub.assignee = None;
                sub.updated_at = Utc::now();
                let _ = self.backlog.save(sub);
            }
            run_id
        };

        if let Some(ref run_id) = run_id {
            self.run_paths(run_id).log_error_raw(
                &error.code,
                error.recoverable,
                &format!("worker {} failed {}: {}", worker_id, sub_task_id, error.message),
            );
        }

        let consecutive = {
            let state = self.state.lock().await;
            state
                .pool
                .get(worker_id)
                .map(|w| w.consecutive_failures)
                .unwrap_or(0)
        };
        let cfg = &self.config.pool;

        // Far past every threshold: hand the whole thing to the quality
        // authority. The sub-task stays failed until the authority acts.
        if consecutive >= 3 * cfg.support_threshold {
            self.escalate_to_authority(worker_id, sub_task_id).await?;
            return Ok(FailureAction::Escalated);
        }

        // Health-floor replacement happens on the periodic health check;
        // inline replacement is driven by the consecutive count alone so a
        // struggling worker still gets its support window first.
        if consecutive >= cfg.replace_threshold {
            let new_worker = {
                let mut state = self.state.lock().await;
                let new_id = state.pool.replace(worker_id, None)?;
                Self::requeue_sub_task(&mut state, sub_task_id, &self.backlog);
                new_id
            };
            warn!(old = %worker_id, new = %new_worker, "worker replaced after repeated failures");
            return Ok(FailureAction::Replaced { new_worker });
        }

        if consecutive >= cfg.support_threshold {
            let guidance = self.provide_support(worker_id, &error.message).await?;
            debug!(worker = %worker_id, advice = %guidance.advice, "support dispatched");

            if consecutive > cfg.support_threshold {
                // Support already went out on an earlier failure; move the
                // work to somebody else.
                let new_worker = self.reassign_elsewhere(sub_task_id, worker_id).await?;
                return Ok(FailureAction::Reassigned { new_worker });
            }
            {
                let mut state = self.state.lock().await;
                Self::requeue_sub_task(&mut state, sub_task_id, &self.backlog);
            }
            return Ok(FailureAction::SupportProvided);
        }

        {
            let mut state = self.state.lock().await;
            Self::requeue_sub_task(&mut state, sub_task_id, &self.backlog);
            if error.recoverable {
                // Same worker may retry: put it back in rotation.
                if let Some(worker) = state.pool.get_mut(worker_id) {
                    worker.status = WorkerStatus::Idle;
                }
            }
        }
        if error.recoverable {
            Ok(FailureAction::Retried)
        } else {
            Ok(FailureAction::Requeued)
        }
    }

    /// Put a sub-task back in the pending queue: any holder is released,
    /// an in-flight status is walked through `failed` first so every step
    /// stays on the transition table.
    fn requeue_sub_task(state: &mut ManagerState, sub_task_id: &str, backlog: &BacklogStore) {
        let holders: Vec<String> = state
            .assignments
            .iter()
            .filter(|(_, sub)| sub.as_str() == sub_task_id)
            .map(|(worker, _)| worker.clone())
            .collect();
        for worker_id in holders {
            state.assignments.remove(&worker_id);
            if let Some(worker) = state.pool.get_mut(&worker_id) {
                if worker.status == WorkerStatus::Working {
                    worker.status = WorkerStatus::Idle;
                }
            }
        }

        if let Some(sub) = state.sub_tasks.get_mut(sub_task_id) {
            if sub.status == SubTaskStatus::Assigned || sub.status == SubTaskStatus::Running {
                sub.status = SubTaskStatus::Failed;
            }
            if sub.status.can_transition_to(SubTaskStatus::Pending) {
                sub.status = SubTaskStatus::Pending;
                sub.assignee = None;
                sub.updated_at = Utc::now();
                let _ = backlog.save(sub);
            }
        }
    }

    /// Pick a different worker and assign the sub-task to it.
    async fn reassign_elsewhere(
        &self,
        sub_task_id: &str,
        excluded_worker: &str,
    ) -> Result<Option<String>> {
        let pick = {
            let mut state = self.state.lock().await;
            Self::requeue_sub_task(&mut state, sub_task_id, &self.backlog);
            let sub = state
                .sub_tasks
                .get(sub_task_id)
                .ok_or_else(|| ManagerError::TaskNotFound(sub_task_id.to_string()))?;
            state
                .pool
                .select_best_excluding(sub, &[excluded_worker.to_string()])
        };
        match pick {
            Some(worker_id) => {
                self.assign_task(sub_task_id, &worker_id).await?;
                Ok(Some(worker_id))
            }
            None => Ok(None),
        }
    }

    async fn escalate_to_authority(&self, worker_id: &str, sub_task_id: &str) -> Result<()> {
        let history: Vec<FailureRecord> = {
            let state = self.state.lock().await;
            state
                .failures
                .iter()
                .filter(|f| f.sub_task_id == sub_task_id)
                .cloned()
                .collect()
        };
        let run_id = {
            let state = self.state.lock().await;
            state.assignment_runs.get(sub_task_id).cloned()
        };

        let payload = serde_json::json!({
            "subTaskId": sub_task_id,
            "workerId": worker_id,
            "failureHistory": history,
        });
        let mut msg = AgentMessage::new(
            MessageKind::Escalate,
            &self.config.name,
            QUALITY_AUTHORITY,
            payload,
        );
        if let Some(run_id) = run_id {
            msg = msg.with_run_id(run_id);
        }
        self.bus.send(msg)?;
        warn!(sub_task = %sub_task_id, worker = %worker_id, "escalated to quality authority");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Escalations and support
    // -----------------------------------------------------------------------

    /// A worker asked for help. Updates the sub-task status and dispatches
    /// by escalation kind.
    pub async fn handle_escalation(&self, escalation: Escalation) -> Result<Option<Guidance>> {
        {
            let mut state = self.state.lock().await;
            state.escalations.push(escalation.clone());

            let target = match escalation.kind {
                EscalationKind::Error => Some(SubTaskStatus::Failed),
                EscalationKind::Blocked | EscalationKind::QualityFailed => {
                    Some(SubTaskStatus::Blocked)
                }
                EscalationKind::HelpNeeded => None,
            };
            if let Some(target) = target {
                if let Some(sub) = state.sub_tasks.get_mut(&escalation.sub_task_id) {
                    if sub.status.can_transition_to(target) {
                        sub.status = target;
                        sub.updated_at = Utc::now();
                        let _ = self.backlog.save(sub);
                    }
                }
            }
        }

        match escalation.kind {
            EscalationKind::Error | EscalationKind::Blocked | EscalationKind::HelpNeeded => {
                let guidance = self
                    .provide_support(&escalation.from_worker, &escalation.issue)
                    .await?;
                Ok(Some(guidance))
            }
            EscalationKind::QualityFailed => {
                let checks = QualityChecks {
                    lint: false,
                    test: false,
                    e2e: true,
                    format: true,
                };
                self.handle_quality_gate(
                    &escalation.from_worker,
                    &escalation.sub_task_id,
                    checks,
                    vec![escalation.issue.clone()],
                )
                .await?;
                Ok(None)
            }
        }
    }

    /// Analyse a worker's failure history and send it tailored guidance.
    pub async fn provide_support(&self, worker_id: &str, issue: &str) -> Result<Guidance> {
        let (recent, run_id) = {
            let mut state = self.state.lock().await;
            let recent: Vec<FailureRecord> = state
                .failures
                .iter()
                .filter(|f| f.worker_id == worker_id)
                .cloned()
                .collect();
            for record in state
                .failures
                .iter_mut()
                .filter(|f| f.worker_id == worker_id && !f.resolved)
            {
                record.support_provided = true;
            }
            // A supported worker goes back into rotation.
            if let Some(worker) = state.pool.get_mut(worker_id) {
                if worker.status == WorkerStatus::Error {
                    worker.status = WorkerStatus::Idle;
                }
            }
            let run_id = recent
                .last()
                .and_then(|f| state.assignment_runs.get(&f.sub_task_id).cloned());
            (recent, run_id)
        };

        let recoverable = recent.iter().filter(|f| f.error.recoverable).count();
        let advice = if recent.is_empty() {
            format!("Reported issue: {}. Re-read the acceptance criteria and retry.", issue)
        } else if recoverable == recent.len() {
            format!(
                "All {} recent failures look transient ({}). Retry with smaller steps and \
                 verify the environment before each one.",
                recent.len(),
                issue
            )
        } else {
            format!(
                "{} of {} recent failures are not transient. Reduce the change surface: \
                 split the work, land the smallest verifiable piece first. Issue: {}",
                recent.len() - recoverable,
                recent.len(),
                issue
            )
        };

        let guidance = Guidance {
            advice,
            suggested_actions: vec![
                "Re-run the failing step in isolation".to_string(),
                "Commit intermediate progress to the task branch".to_string(),
                "Escalate with a conflict report if the workspace is wedged".to_string(),
            ],
            additional_resources: vec!["workflows/backlog".to_string()],
        };

        let mut msg = AgentMessage::new(
            MessageKind::Guidance,
            &self.config.name,
            worker_id,
            serde_json::to_value(&guidance).unwrap_or(serde_json::Value::Null),
        );
        if let Some(run_id) = run_id {
            msg = msg.with_run_id(run_id);
        }
        self.bus.send(msg)?;
        info!(worker = %worker_id, "guidance sent");
        Ok(guidance)
    }

    pub async fn active_escalations(&self) -> Vec<Escalation> {
        self.state.lock().await.escalations.clone()
    }

    // -----------------------------------------------------------------------
    // Quality gates
    // -----------------------------------------------------------------------

    /// Arbitrate a failed quality gate for a worker's ticket.
    ///
    /// With the worker's consecutive-failure count N: N = 0 retries with
    /// tailored instructions, N in {1, 2} reassigns to a different worker,
    /// N >= 3 escalates to the quality authority.
    pub async fn handle_quality_gate(
        &self,
        worker_id: &str,
        sub_task_id: &str,
        checks: QualityChecks,
        reasons: Vec<String>,
    ) -> Result<GateDecision> {
        let run_id = {
            let state = self.state.lock().await;
            state.assignment_runs.get(sub_task_id).cloned()
        };
        if let Some(ref run_id) = run_id {
            self.run_paths(run_id).log_error(
                ErrorCode::QualityGateFailure,
                true,
                &format!(
                    "gate failed for {} (lint={}, test={}, e2e={}, format={}): {}",
                    sub_task_id,
                    checks.lint,
                    checks.test,
                    checks.e2e,
                    checks.format,
                    reasons.join("; ")
                ),
            );
        }

        let consecutive = {
            let state = self.state.lock().await;
            state
                .pool
                .get(worker_id)
                .map(|w| w.consecutive_failures)
                .unwrap_or(0)
        };

        let decision = if consecutive == 0 {
            let mut instructions = Vec::new();
            if !checks.lint {
                instructions.push(
                    "Run the linter locally and fix every reported issue before resubmitting.",
                );
            }
            if !checks.test {
                instructions.push(
                    "Reproduce the failing tests locally; do not weaken assertions to pass them.",
                );
            }
            if !checks.format {
                instructions.push("Apply the project formatter to the changed files.");
            }
            if !checks.e2e {
                instructions.push("Re-run the end-to-end suite against a clean workspace.");
            }
            if instructions.is_empty() {
                instructions.push("Review the gate report and address every reason listed.");
            }
            let instructions = instructions.join(" ");

            let mut msg = AgentMessage::new(
                MessageKind::Guidance,
                &self.config.name,
                worker_id,
                serde_json::json!({
                    "subTaskId": sub_task_id,
                    "instructions": instructions,
                    "reasons": reasons,
                }),
            );
            if let Some(ref run_id) = run_id {
                msg = msg.with_run_id(run_id.clone());
            }
            self.bus.send(msg)?;
            GateDecision::Retry { instructions }
        } else if consecutive <= 2 {
            let new_worker = self.reassign_elsewhere(sub_task_id, worker_id).await?;
            GateDecision::Reassign { new_worker }
        } else {
            self.escalate_to_authority(worker_id, sub_task_id).await?;
            {
                let mut state = self.state.lock().await;
                if let Some(sub) = state.sub_tasks.get_mut(sub_task_id) {
                    if sub.status.can_transition_to(SubTaskStatus::Blocked) {
                        sub.status = SubTaskStatus::Blocked;
                        sub.updated_at = Utc::now();
                        let _ = self.backlog.save(sub);
                    }
                }
            }
            GateDecision::Escalate
        };

        info!(
            worker = %worker_id,
            sub_task = %sub_task_id,
            consecutive,
            decision = ?decision,
            "quality gate arbitrated"
        );
        Ok(decision)
    }

    // -----------------------------------------------------------------------
    // Bus message dispatch
    // -----------------------------------------------------------------------

    /// Dispatch one inbound bus message by kind.
    pub async fn process_message(&self, msg: &AgentMessage) -> Result<()> {
        match msg.kind {
            MessageKind::TaskComplete => {
                let sub_task_id = payload_str(&msg.payload, "subTaskId")?;
                self.handle_task_complete(&msg.from, &sub_task_id).await?;
            }
            MessageKind::TaskFailed => {
                let sub_task_id = payload_str(&msg.payload, "subTaskId")?;
                let error: WorkerError = serde_json::from_value(
                    msg.payload.get("error").cloned().unwrap_or_default(),
                )
                .unwrap_or(WorkerError {
                    code: "UNKNOWN".to_string(),
                    message: "unspecified worker failure".to_string(),
                    recoverable: false,
                });
                self.handle_task_failed(&msg.from, &sub_task_id, error)
                    .await?;
            }
            MessageKind::Escalate => {
                let escalation = Escalation {
                    id: msg.id.to_string(),
                    from_worker: msg.from.clone(),
                    sub_task_id: payload_str(&msg.payload, "subTaskId").unwrap_or_default(),
                    issue: payload_str(&msg.payload, "issue").unwrap_or_default(),
                    kind: serde_json::from_value(
                        msg.payload.get("kind").cloned().unwrap_or_default(),
                    )
                    .unwrap_or(EscalationKind::HelpNeeded),
                    timestamp: msg.timestamp,
                };
                self.handle_escalation(escalation).await?;
            }
            MessageKind::QualityGateFailed => {
                let sub_task_id = payload_str(&msg.payload, "subTaskId")?;
                let worker_id = payload_str(&msg.payload, "workerId")
                    .unwrap_or_else(|_| msg.from.clone());
                let checks: QualityChecks = serde_json::from_value(
                    msg.payload.get("checks").cloned().unwrap_or_default(),
                )
                .unwrap_or(QualityChecks {
                    lint: false,
                    test: false,
                    e2e: false,
                    format: false,
                });
                let reasons: Vec<String> = serde_json::from_value(
                    msg.payload.get("reasons").cloned().unwrap_or_default(),
                )
                .unwrap_or_default();
                self.handle_quality_gate(&worker_id, &sub_task_id, checks, reasons)
                    .await?;
            }
            MessageKind::StatusResponse => {
                let mut state = self.state.lock().await;
                if let Some(worker) = state.pool.get_mut(&msg.from) {
                    worker.last_activity = Utc::now();
                }
            }
            MessageKind::TaskAssign | MessageKind::StatusRequest | MessageKind::Guidance => {
                debug!(kind = ?msg.kind, from = %msg.from, "ignoring message kind");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Monitoring / auto-scaling loops
    // -----------------------------------------------------------------------

    /// Start the progress-monitor ticker. Starting twice is a no-op.
    pub async fn start_monitoring(self: Arc<Self>, run_id: &str) {
        let mut guard = self.monitor.lock().await;
        if guard.is_some() {
            debug!("monitor already running");
            return;
        }

        let shutdown = ShutdownSignal::new();
        let mut shutdown_rx = shutdown.subscribe();
        let agent = Arc::clone(&self);
        let run_id = run_id.to_string();
        let interval = self.config.monitor_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(run = %run_id, "progress monitor started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(run = %run_id, "progress monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        agent.monitor_tick().await;
                    }
                }
            }
        });

        *guard = Some(LoopHandle { shutdown, handle });
    }

    /// One monitor round: drain the bus, dispatch every message, surface
    /// failure patterns.
    async fn monitor_tick(&self) {
        for msg in self.bus.drain(&self.config.name) {
            if let Err(e) = self.process_message(&msg).await {
                warn!(kind = ?msg.kind, error = %e, "message handling failed");
            }
            self.bus.ack(&msg);
        }

        let struggling: Vec<(String, u32)> = {
            let state = self.state.lock().await;
            state
                .pool
                .active()
                .into_iter()
                .filter(|w| w.consecutive_failures >= self.config.pool.support_threshold)
                .map(|w| (w.id.clone(), w.consecutive_failures))
                .collect()
        };
        for (worker, failures) in struggling {
            warn!(worker = %worker, failures, "worker is struggling");
        }
    }

    /// Stop the progress monitor. Idempotent.
    pub async fn stop_monitoring(&self) {
        let handle = self.monitor.lock().await.take();
        if let Some(LoopHandle { shutdown, handle }) = handle {
            shutdown.trigger();
            let _ = handle.await;
        }
    }

    /// Start the auto-scaler ticker (scaling pass + health check).
    /// Starting twice is a no-op.
    pub async fn start_auto_scaling(self: Arc<Self>) {
        let mut guard = self.autoscaler.lock().await;
        if guard.is_some() {
            debug!("auto-scaler already running");
            return;
        }

        let shutdown = ShutdownSignal::new();
        let mut shutdown_rx = shutdown.subscribe();
        let agent = Arc::clone(&self);
        let interval = self.config.autoscale_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("auto-scaler started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("auto-scaler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = agent.scale_workers_by_workload().await;
                        if report.action != "no_change" {
                            info!(action = %report.action, pool = report.pool_size, "auto-scale");
                        }
                        agent.perform_health_check().await;
                        agent.dispatch_pending().await;
                    }
                }
            }
        });

        *guard = Some(LoopHandle { shutdown, handle });
    }

    /// Stop the auto-scaler. Idempotent.
    pub async fn stop_auto_scaling(&self) {
        let handle = self.autoscaler.lock().await.take();
        if let Some(LoopHandle { shutdown, handle }) = handle {
            shutdown.trigger();
            let _ = handle.await;
        }
    }
}

fn payload_str(payload: &serde_json::Value, key: &str) -> Result<String> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ManagerError::InvalidInput(format!("payload is missing {}", key)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
