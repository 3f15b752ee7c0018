//! Error types for the scheduler.

use chrono::{DateTime, Utc};
use thiserror::Error;

use hourglass_objstore::StoreError;

use crate::RunState;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid workflow configuration.
    #[error("invalid workflow configuration: {0}")]
    InvalidWorkflow(String),

    /// The instant is not a slot of this workflow.
    #[error("invalid slot {slot}: {reason}")]
    InvalidSlot { slot: DateTime<Utc>, reason: String },

    /// Run state file could not be read or written.
    #[error("run store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Run state file is corrupt.
    #[error("run store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No run exists for the slot.
    #[error("run not found: {workflow} @ {slot}")]
    RunNotFound {
        workflow: String,
        slot: DateTime<Utc>,
    },

    /// The requested state change is not allowed from the run's current state.
    #[error("invalid run transition for {slot}: {from} -> {to}")]
    InvalidTransition {
        slot: DateTime<Utc>,
        from: RunState,
        to: RunState,
    },

    /// The slot's predecessor has not succeeded yet.
    #[error("slot {slot} is held: predecessor {predecessor} is {state}")]
    OrderingViolation {
        slot: DateTime<Utc>,
        predecessor: DateTime<Utc>,
        state: RunState,
    },

    /// The run reached Failed.
    #[error("run for slot {slot} failed: {reason}")]
    RunFailed { slot: DateTime<Utc>, reason: String },

    /// The run is already executing.
    #[error("run for slot {0} is already running")]
    SlotBusy(DateTime<Utc>),

    /// The run was cancelled before reaching a terminal state.
    #[error("run for slot {0} was interrupted")]
    Interrupted(DateTime<Utc>),

    /// The object store could not be set up.
    #[error("object store error: {0}")]
    Store(#[from] StoreError),
}

/// Failure of a single task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Network or store unavailable; worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Missing or invalid configuration; retrying cannot help.
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        if err.is_retryable() {
            Self::Transient(err.to_string())
        } else {
            Self::Configuration(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_keep_retryability() {
        let transient: TaskError = StoreError::NoSuchBucket("okx".into()).into();
        assert!(transient.is_retryable());

        let fatal: TaskError = StoreError::InvalidConfig("secret key is empty".into()).into();
        assert_eq!(
            fatal,
            TaskError::Configuration(
                "invalid object store configuration: secret key is empty".into()
            )
        );
        assert!(!fatal.is_retryable());
    }
}
