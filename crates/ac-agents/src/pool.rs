//! Worker pool bookkeeping.
//!
//! Pure pool logic lives here, independent of the bus and the schedulers:
//! hire/fire/replace with min/max gating, capability extraction and worker
//! scoring, health recomputation, and scale-up/scale-down decisions with a
//! cooldown. The manager wraps this behind its own lock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use ac_core::error::ErrorCode;
use ac_core::ids;
use ac_core::types::{SubTask, WorkerInfo, WorkerSpec, WorkerStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool is at max capacity ({0})")]
    AtMaxCapacity(usize),

    #[error("pool is at min capacity ({0})")]
    AtMinCapacity(usize),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("worker already terminated: {0}")]
    AlreadyTerminated(String),
}

impl PoolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PoolError::WorkerNotFound(_) | PoolError::AlreadyTerminated(_) => {
                ErrorCode::WorkerNotFound
            }
            _ => ErrorCode::AssignmentError,
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Pending-per-active-worker ratio that triggers scale-up.
    pub scale_up_threshold: f64,
    /// Idle fraction of the pool that triggers scale-down.
    pub scale_down_threshold: f64,
    /// Minimum gap between two scaling actions.
    pub cooldown: Duration,
    /// Consecutive failures after which support is dispatched automatically.
    pub support_threshold: u32,
    /// Consecutive failures after which a worker is replaced.
    pub replace_threshold: u32,
    /// Health score below which a worker is replaced.
    pub health_floor: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 5,
            scale_up_threshold: 2.0,
            scale_down_threshold: 0.5,
            cooldown: Duration::from_secs(30),
            support_threshold: 3,
            replace_threshold: 5,
            health_floor: 10.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Scaling decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleAction {
    ScaleUp { workers_to_add: usize },
    ScaleDown { candidates: Vec<String> },
    NoChange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub action: ScaleAction,
    pub reason: String,
    pub workload_ratio: f64,
}

// ---------------------------------------------------------------------------
// Capability keywords
// ---------------------------------------------------------------------------

const CAPABILITY_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "frontend",
        &["frontend", "ui", "css", "react", "component", "style"],
    ),
    (
        "backend",
        &["backend", "api", "server", "database", "endpoint", "sql"],
    ),
    ("testing", &["test", "testing", "spec", "coverage"]),
    ("devops", &["deploy", "docker", "ci", "pipeline", "infra"]),
    (
        "documentation",
        &["doc", "docs", "documentation", "readme"],
    ),
];

/// Keyword buckets present in a sub-task's title and description.
/// Falls back to `general` when nothing matches.
pub fn extract_capabilities(task: &SubTask) -> Vec<String> {
    let text = format!("{} {}", task.title, task.description).to_lowercase();
    let mut caps: Vec<String> = CAPABILITY_KEYWORDS
        .iter()
        .filter(|(_, words)| {
            words
                .iter()
                .any(|w| text.split(|c: char| !c.is_ascii_alphanumeric()).any(|t| t == *w))
        })
        .map(|(cap, _)| cap.to_string())
        .collect();
    if caps.is_empty() {
        caps.push("general".to_string());
    }
    caps
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct WorkerPool {
    workers: HashMap<String, WorkerInfo>,
    config: PoolConfig,
    last_scale_at: Option<Instant>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            workers: HashMap::new(),
            config,
            last_scale_at: None,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Non-terminated pool size.
    pub fn size(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.status != WorkerStatus::Terminated)
            .count()
    }

    pub fn get(&self, id: &str) -> Option<&WorkerInfo> {
        self.workers.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut WorkerInfo> {
        self.workers.get_mut(id)
    }

    /// All records, terminated history included.
    pub fn all(&self) -> Vec<&WorkerInfo> {
        self.workers.values().collect()
    }

    pub fn active(&self) -> Vec<&WorkerInfo> {
        self.workers
            .values()
            .filter(|w| w.status != WorkerStatus::Terminated)
            .collect()
    }

    pub fn idle(&self) -> Vec<&WorkerInfo> {
        self.workers
            .values()
            .filter(|w| w.status == WorkerStatus::Idle)
            .collect()
    }

    /// Hire a new worker. Fails when the pool is already at max.
    pub fn hire(&mut self, spec: WorkerSpec) -> Result<String> {
        if self.size() >= self.config.max_workers {
            return Err(PoolError::AtMaxCapacity(self.config.max_workers));
        }
        let id = ids::worker_id();
        let info = WorkerInfo::from_spec(&id, spec);
        info!(worker = %id, name = %info.name, "worker hired");
        self.workers.insert(id.clone(), info);
        Ok(id)
    }

    /// Register an externally named worker (one that introduced itself on
    /// the bus). Ignores the max bound check only when already present.
    pub fn register(&mut self, id: &str) -> Result<()> {
        if self.workers.contains_key(id) {
            return Ok(());
        }
        if self.size() >= self.config.max_workers {
            return Err(PoolError::AtMaxCapacity(self.config.max_workers));
        }
        let info = WorkerInfo::from_spec(id, WorkerSpec::new(id));
        self.workers.insert(id.to_string(), info);
        Ok(())
    }

    /// Terminate a worker. Fails when the pool would drop below min.
    /// The record is retained for history.
    pub fn fire(&mut self, id: &str) -> Result<()> {
        let worker = self
            .workers
            .get(id)
            .ok_or_else(|| PoolError::WorkerNotFound(id.to_string()))?;
        if worker.status == WorkerStatus::Terminated {
            return Err(PoolError::AlreadyTerminated(id.to_string()));
        }
        if self.size() <= self.config.min_workers {
            return Err(PoolError::AtMinCapacity(self.config.min_workers));
        }
        let worker = self.workers.get_mut(id).expect("checked above");
        worker.status = WorkerStatus::Terminated;
        worker.last_activity = Utc::now();
        info!(worker = %id, "worker terminated");
        Ok(())
    }

    /// Replace a worker with a fresh hire. When no spec is given the new
    /// worker inherits the old one's capabilities and priority. The swap
    /// is atomic with respect to pool-size bounds.
    pub fn replace(&mut self, old_id: &str, spec: Option<WorkerSpec>) -> Result<String> {
        let old = self
            .workers
            .get(old_id)
            .ok_or_else(|| PoolError::WorkerNotFound(old_id.to_string()))?;
        if old.status == WorkerStatus::Terminated {
            return Err(PoolError::AlreadyTerminated(old_id.to_string()));
        }

        let spec = spec.unwrap_or_else(|| {
            WorkerSpec::new(format!("{}-replacement", old.name))
                .with_capabilities(old.capabilities.clone())
                .with_priority(old.priority)
        });

        let old = self.workers.get_mut(old_id).expect("checked above");
        old.status = WorkerStatus::Terminated;
        old.last_activity = Utc::now();

        let new_id = ids::worker_id();
        let info = WorkerInfo::from_spec(&new_id, spec);
        info!(old = %old_id, new = %new_id, "worker replaced");
        self.workers.insert(new_id.clone(), info);
        Ok(new_id)
    }

    // -----------------------------------------------------------------------
    // Scoring and selection
    // -----------------------------------------------------------------------

    /// Score one worker against required capabilities. Deterministic in its
    /// inputs; higher is better.
    pub fn score(worker: &WorkerInfo, required: &[String]) -> f64 {
        let matching = worker
            .capabilities
            .iter()
            .filter(|c| required.contains(c))
            .count() as f64;
        20.0 * matching + 0.3 * worker.health_score + 5.0 * f64::from(worker.priority)
            + 30.0 * worker.success_rate()
            - 10.0 * f64::from(worker.consecutive_failures)
    }

    /// Pick the best idle worker for a sub-task. Ties break on higher
    /// priority, then earlier hire time. `None` when nobody is idle.
    pub fn select_best(&self, task: &SubTask) -> Option<String> {
        self.select_best_excluding(task, &[])
    }

    pub fn select_best_excluding(&self, task: &SubTask, excluded: &[String]) -> Option<String> {
        let required = extract_capabilities(task);
        let mut best: Option<(&WorkerInfo, f64)> = None;

        for worker in self.idle() {
            if excluded.iter().any(|e| e == &worker.id) {
                continue;
            }
            let score = Self::score(worker, &required);
            debug!(worker = %worker.id, score, "worker scored");
            best = match best {
                None => Some((worker, score)),
                Some((cur, cur_score)) => {
                    let better = score > cur_score
                        || (score == cur_score
                            && (worker.priority > cur.priority
                                || (worker.priority == cur.priority
                                    && worker.hired_at < cur.hired_at)));
                    if better {
                        Some((worker, score))
                    } else {
                        Some((cur, cur_score))
                    }
                }
            };
        }

        best.map(|(w, _)| w.id.clone())
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    /// Recompute one worker's health score:
    /// `100 - 15*consecutive - 30*failure_rate - inactivity - 30*(error)`,
    /// clamped to `[0, 100]`. Inactivity costs 20 points after 30 minutes.
    pub fn recompute_health(&mut self, id: &str, now: DateTime<Utc>) {
        let Some(worker) = self.workers.get_mut(id) else {
            return;
        };
        let mut score = 100.0;
        score -= 15.0 * f64::from(worker.consecutive_failures);
        score -= 30.0 * worker.failure_rate();
        let inactive = now.signed_duration_since(worker.last_activity);
        if inactive.num_minutes() > 30 {
            score -= 20.0;
        }
        if worker.status == WorkerStatus::Error {
            score -= 30.0;
        }
        worker.health_score = score.clamp(0.0, 100.0);
    }

    /// Workers due for replacement: too many consecutive failures or
    /// health under the floor.
    pub fn unhealthy(&self) -> Vec<String> {
        self.active()
            .into_iter()
            .filter(|w| {
                w.consecutive_failures >= self.config.replace_threshold
                    || w.health_score < self.config.health_floor
            })
            .map(|w| w.id.clone())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Scaling
    // -----------------------------------------------------------------------

    /// Decide whether to scale, given the pending-task count.
    pub fn scaling_decision(&self, pending: usize, now: Instant) -> ScalingDecision {
        let active = self.size();
        // With no active workers the denominator collapses to 1, so the
        // ratio equals the pending count; scale-up depends on this.
        let workload_ratio = pending as f64 / active.max(1) as f64;

        if let Some(last) = self.last_scale_at {
            if now.duration_since(last) < self.config.cooldown {
                return ScalingDecision {
                    action: ScaleAction::NoChange,
                    reason: "cooldown active".into(),
                    workload_ratio,
                };
            }
        }

        if workload_ratio >= self.config.scale_up_threshold && active < self.config.max_workers {
            let workers_to_add = pending.div_ceil(2).min(self.config.max_workers - active);
            return ScalingDecision {
                action: ScaleAction::ScaleUp { workers_to_add },
                reason: format!("workload ratio {:.1}", workload_ratio),
                workload_ratio,
            };
        }

        let idle = self.idle().len();
        if pending == 0 && active > self.config.min_workers && active > 0 {
            let idle_fraction = idle as f64 / active as f64;
            if idle_fraction >= self.config.scale_down_threshold {
                let removable = active - self.config.min_workers;
                let mut candidates: Vec<&WorkerInfo> = self.idle();
                candidates.sort_by(|a, b| {
                    a.priority
                        .cmp(&b.priority)
                        .then(a.hired_at.cmp(&b.hired_at))
                });
                let candidates: Vec<String> = candidates
                    .into_iter()
                    .take(removable)
                    .map(|w| w.id.clone())
                    .collect();
                if !candidates.is_empty() {
                    return ScalingDecision {
                        action: ScaleAction::ScaleDown { candidates },
                        reason: format!("idle fraction {:.2}", idle_fraction),
                        workload_ratio,
                    };
                }
            }
        }

        ScalingDecision {
            action: ScaleAction::NoChange,
            reason: "within thresholds".into(),
            workload_ratio,
        }
    }

    /// Record that a scaling action happened (starts the cooldown).
    pub fn record_scale(&mut self, now: Instant) {
        self.last_scale_at = Some(now);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
