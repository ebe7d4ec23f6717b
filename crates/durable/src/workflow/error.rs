//! Errors surfaced to workflow code

use chrono::{DateTime, Utc};

use super::WorkflowError;
use crate::journal::StoreError;
use crate::step::ActionError;

/// Error codes recorded on failed invocations
pub mod error_codes {
    /// A step action failed and the failure was not recovered
    pub const STEP_ACTION: &str = "STEP_ACTION";
    /// The journal store or scheduler was unavailable
    pub const INFRASTRUCTURE: &str = "INFRASTRUCTURE";
    /// Replay diverged from the journal
    pub const NON_DETERMINISM: &str = "NON_DETERMINISM";
    /// Another writer won the race for the journal
    pub const CONFLICT: &str = "CONFLICT";
    /// The invocation was cancelled
    pub const CANCELLED: &str = "CANCELLED";
    /// Invocation input could not be decoded for the workflow
    pub const INVALID_INPUT: &str = "INVALID_INPUT";
    /// A step was given an empty or reserved name
    pub const INVALID_STEP_NAME: &str = "INVALID_STEP_NAME";
    /// Invocation-level retries ran out
    pub const RETRIES_EXHAUSTED: &str = "RETRIES_EXHAUSTED";
}

/// Errors returned by invocation context operations and workflow bodies
///
/// `Suspended` is not a failure: it unwinds the body when a durable timer is
/// not yet due, and the driver parks the invocation until the wake-up.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DurableError {
    /// A step's action failed; the failure is journaled
    #[error("step '{step}' failed: {error}")]
    StepAction { step: String, error: ActionError },

    /// The workflow body failed on its own account
    #[error("workflow error: {0}")]
    Workflow(WorkflowError),

    /// Journal store or scheduler unavailable; nothing was journaled
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// Replay found a journal entry that does not match what the code asked for
    #[error("non-determinism detected: {0}")]
    NonDeterminism(String),

    /// Another writer raced this execution on the invocation's journal
    #[error("journal conflict: {0}")]
    Conflict(String),

    /// A durable timer is pending
    #[error("invocation suspended until {fire_at}")]
    Suspended { fire_at: DateTime<Utc> },

    /// The invocation was cancelled
    #[error("invocation cancelled: {reason}")]
    Cancelled { reason: String },
}

impl DurableError {
    /// Create a workflow-level error
    pub fn workflow(message: impl Into<String>) -> Self {
        Self::Workflow(WorkflowError::new(message))
    }

    /// Name of the failed step, if this error came from a step action
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::StepAction { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Convert to the error record persisted on a failed invocation
    pub fn to_workflow_error(&self) -> WorkflowError {
        match self {
            Self::StepAction { error, .. } => {
                let mut record = WorkflowError::new(self.to_string())
                    .with_code(error.error_type.as_deref().unwrap_or(error_codes::STEP_ACTION));
                record.retryable = error.retryable;
                record
            }
            Self::Workflow(error) => error.clone(),
            Self::Infrastructure(_) => {
                WorkflowError::retryable(self.to_string()).with_code(error_codes::INFRASTRUCTURE)
            }
            Self::NonDeterminism(_) => {
                WorkflowError::new(self.to_string()).with_code(error_codes::NON_DETERMINISM)
            }
            Self::Conflict(_) => WorkflowError::new(self.to_string()).with_code(error_codes::CONFLICT),
            Self::Cancelled { .. } => {
                WorkflowError::new(self.to_string()).with_code(error_codes::CANCELLED)
            }
            Self::Suspended { .. } => WorkflowError::retryable(self.to_string()),
        }
    }
}

impl From<WorkflowError> for DurableError {
    fn from(err: WorkflowError) -> Self {
        Self::Workflow(err)
    }
}

impl From<StoreError> for DurableError {
    fn from(err: StoreError) -> Self {
        if err.is_conflict() {
            Self::Conflict(err.to_string())
        } else {
            Self::Infrastructure(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DurableError {
    fn from(err: serde_json::Error) -> Self {
        Self::NonDeterminism(format!("journaled value does not decode: {err}"))
    }
}
