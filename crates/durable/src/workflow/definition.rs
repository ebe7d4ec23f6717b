//! Workflow trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use super::DurableError;
use crate::context::InvocationContext;

/// Error type for workflow failures
///
/// This is the record persisted in the journal when an invocation fails, and the
/// error a workflow body raises for its own (non-step) failures.
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,

    /// Whether this error is retryable
    pub retryable: bool,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    /// Create a retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// A workflow is application code executed durably against an invocation journal
///
/// The body runs from the top on every (re)entry. Calls into the
/// [`InvocationContext`] consult the journal first, so already-completed steps
/// return their recorded results instead of running again.
///
/// # Determinism
///
/// Given the same journal, a workflow must make the same sequence of context
/// calls. Wall-clock time, randomness and identifiers must come from the
/// context (`now`, `rng`, `uuid`), never directly from the environment.
///
/// # Example
///
/// ```ignore
/// use hammond_durable::prelude::*;
///
/// struct OrderWorkflow;
///
/// #[async_trait]
/// impl Workflow for OrderWorkflow {
///     const TYPE: &'static str = "order_workflow";
///     type Input = OrderInput;
///     type Output = OrderResult;
///
///     async fn run(
///         &self,
///         ctx: &mut InvocationContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, DurableError> {
///         let receipt: String = ctx.run("charge", || async { charge(&input).await }).await?;
///         ctx.sleep(Duration::from_secs(60)).await?;
///         Ok(OrderResult { receipt })
///     }
/// }
/// ```
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier for this workflow
    ///
    /// This is used to look up the workflow in the registry during replay.
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send + Sync;

    /// Output type when workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send;

    /// Run the workflow body
    ///
    /// Returning [`DurableError::Suspended`] (usually via `?` on
    /// [`InvocationContext::sleep`]) parks the invocation until its timer fires.
    async fn run(
        &self,
        ctx: &mut InvocationContext,
        input: Self::Input,
    ) -> Result<Self::Output, DurableError>;
}
