//! Failure classification
//!
//! Decides whether an error that escaped a workflow body earns the
//! invocation a fresh attempt or ends it.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::workflow::{error_codes, DurableError};

/// What happens to an invocation after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry the whole invocation; journaled steps are replayed, not re-run
    Transient,
    /// Fail the invocation permanently
    Terminal,
}

/// How user-level failures (step actions and workflow errors) are classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UserErrorPolicy {
    /// Always terminal; retrying is the workflow body's business
    #[default]
    Terminal,
    /// Always transient
    Transient,
    /// Transient when the error is flagged `retryable`
    RetryableFlag,
}

impl FromStr for UserErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "terminal" => Ok(Self::Terminal),
            "transient" => Ok(Self::Transient),
            "retryable-flag" | "retryable" => Ok(Self::RetryableFlag),
            other => Err(format!("unknown user error policy: {other}")),
        }
    }
}

/// Classifies failed attempts
///
/// Infrastructure errors are always transient. Non-determinism, lost races
/// and cancellation are always terminal. Everything the user's code raised
/// follows [`UserErrorPolicy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureClassifier {
    pub user_errors: UserErrorPolicy,
}

impl FailureClassifier {
    pub fn new(user_errors: UserErrorPolicy) -> Self {
        Self { user_errors }
    }

    /// Set the user error policy
    pub fn with_user_error_policy(mut self, policy: UserErrorPolicy) -> Self {
        self.user_errors = policy;
        self
    }

    pub fn classify(&self, error: &DurableError) -> FailureClass {
        match error {
            DurableError::Infrastructure(_) | DurableError::Suspended { .. } => {
                FailureClass::Transient
            }
            DurableError::NonDeterminism(_)
            | DurableError::Conflict(_)
            | DurableError::Cancelled { .. } => FailureClass::Terminal,
            DurableError::StepAction { error, .. } => self.classify_user(error.retryable),
            DurableError::Workflow(error) if is_malformed(error.code.as_deref()) => {
                FailureClass::Terminal
            }
            DurableError::Workflow(error) => self.classify_user(error.retryable),
        }
    }

    fn classify_user(&self, retryable: bool) -> FailureClass {
        match self.user_errors {
            UserErrorPolicy::Terminal => FailureClass::Terminal,
            UserErrorPolicy::Transient => FailureClass::Transient,
            UserErrorPolicy::RetryableFlag if retryable => FailureClass::Transient,
            UserErrorPolicy::RetryableFlag => FailureClass::Terminal,
        }
    }
}

/// Bad input or step names fail the same way on every attempt
fn is_malformed(code: Option<&str>) -> bool {
    matches!(
        code,
        Some(error_codes::INVALID_INPUT | error_codes::INVALID_STEP_NAME)
    )
}
