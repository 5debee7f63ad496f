//! Agent control plane for autocrew.
//!
//! This crate carries the orchestration logic: instruction decomposition
//! into a dependency-checked set of sub-tasks, the manager agent that owns
//! the worker pool and arbitrates failures and quality gates, and the
//! merger agent that guards protected branches behind pull requests.

pub mod backlog;
pub mod decomposer;
pub mod graph;
pub mod manager;
pub mod merger;
pub mod pool;

pub use decomposer::{DecomposeOptions, DecomposeOutcome, ProjectContext, TaskDecomposer};
pub use graph::DependencyGraph;
pub use manager::{ManagerAgent, ManagerConfig};
pub use merger::{MergeRequest, MergeResult, MergerAgent, MergerConfig, PullRequestSpec};
pub use pool::{PoolConfig, ScaleAction, WorkerPool};
