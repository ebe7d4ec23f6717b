//! Step action results

use serde::{Deserialize, Serialize};

/// Error type for step action failures
///
/// A failed action is journaled with this record and handed back to the
/// workflow body as [`DurableError::StepAction`](crate::DurableError::StepAction).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether this error is retryable
    ///
    /// The failure classifier may honor this flag when deciding whether a
    /// failed invocation gets a fresh attempt.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl ActionError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActionError {}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Journaled outcome of a step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    /// The action returned a value
    Success { value: serde_json::Value },

    /// The action returned an error
    Failure { error: ActionError },
}

impl StepOutcome {
    /// Check if the step failed
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }
}
