//! Error types for scheduler operations.

use thiserror::Error;

/// Errors returned by the recurrence calculator, rule engine and task generator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    /// Recurrence pattern violates a structural invariant.
    #[error("Invalid recurrence pattern: {0}")]
    InvalidPattern(String),

    /// The pattern's end condition has been reached.
    #[error("Recurrence exhausted: {0}")]
    ExhaustedPattern(String),

    /// Unknown rule, definition or instance id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation requires an active/enabled entity.
    #[error("Inactive: {0}")]
    Inactive(String),

    /// A counter or state invariant would be broken.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Transport-reported action failure. Captured per action, never raised out of `execute`.
    #[error("Action failed: {0}")]
    ActionFailure(String),

    /// Rule definition rejected at register/edit time.
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// Persistence adapter failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(e: rusqlite::Error) -> Self {
        SchedulerError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        SchedulerError::Storage(format!("serialization: {e}"))
    }
}

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
