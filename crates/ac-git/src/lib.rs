//! Git plumbing for autocrew.
//!
//! Everything the control plane does to a repository goes through this
//! crate: the [`process::ProcessRunner`] contract, the [`manager::GitManager`]
//! shell-out operations with per-run audit logging, SSH host-key validation,
//! and three-way conflict auto-resolution.

pub mod auth;
pub mod conflict;
pub mod hostkeys;
pub mod manager;
pub mod process;

pub use auth::GitAuth;
pub use conflict::{ConflictResolver, Resolution};
pub use hostkeys::HostKeyValidator;
pub use manager::{GitError, GitManager, MergeOutput, StatusEntry};
pub use process::{CommandOutput, CommandSpec, ProcessError, ProcessRunner, TokioProcessRunner};
