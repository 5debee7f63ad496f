use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// The error-code taxonomy surfaced in `errors.log` and across the bus.
///
/// Each code carries a default recoverability used when a failure is
/// recorded without a more specific judgment from the reporting component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    DecompositionError,
    ParseError,
    ValidationError,
    InsufficientSubtasks,
    AiError,
    AdapterConnectionError,
    AdapterTimeout,
    AdapterFallback,
    WorkerNotFound,
    NoCurrentTask,
    AssignmentError,
    CommunicationError,
    GitConflict,
    KnownHostsInvalid,
    MergeRejectedProtected,
    PrNotApproved,
    PrNotFound,
    QualityGateFailure,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::DecompositionError => "DECOMPOSITION_ERROR",
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::InsufficientSubtasks => "INSUFFICIENT_SUBTASKS",
            ErrorCode::AiError => "AI_ERROR",
            ErrorCode::AdapterConnectionError => "ADAPTER_CONNECTION_ERROR",
            ErrorCode::AdapterTimeout => "ADAPTER_TIMEOUT",
            ErrorCode::AdapterFallback => "ADAPTER_FALLBACK",
            ErrorCode::WorkerNotFound => "WORKER_NOT_FOUND",
            ErrorCode::NoCurrentTask => "NO_CURRENT_TASK",
            ErrorCode::AssignmentError => "ASSIGNMENT_ERROR",
            ErrorCode::CommunicationError => "COMMUNICATION_ERROR",
            ErrorCode::GitConflict => "GIT_CONFLICT",
            ErrorCode::KnownHostsInvalid => "KNOWN_HOSTS_INVALID",
            ErrorCode::MergeRejectedProtected => "MERGE_REJECTED_PROTECTED",
            ErrorCode::PrNotApproved => "PR_NOT_APPROVED",
            ErrorCode::PrNotFound => "PR_NOT_FOUND",
            ErrorCode::QualityGateFailure => "QUALITY_GATE_FAILURE",
        }
    }

    /// Default recoverability. Connection-shaped and gate-shaped failures
    /// are worth retrying; contract violations are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCode::AdapterConnectionError
                | ErrorCode::AdapterTimeout
                | ErrorCode::AdapterFallback
                | ErrorCode::CommunicationError
                | ErrorCode::GitConflict
                | ErrorCode::QualityGateFailure
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
