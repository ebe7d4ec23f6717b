//! Step executor

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::{ActionError, StepOutcome};
use crate::context::{InvocationContext, RESERVED_PREFIX};
use crate::journal::EntryPayload;
use crate::workflow::{error_codes, DurableError, WorkflowError};

impl InvocationContext {
    /// Run a named side effect at most once
    ///
    /// The first call for `name` in the invocation's history runs `action`
    /// and journals its result, success or failure. Every later call for the
    /// same name, in this execution or any replay, returns the journaled
    /// result and leaves `action` untouched. Failures are never retried here.
    pub async fn run<T, A, Fut>(&mut self, name: impl Into<String>, action: A) -> Result<T, DurableError>
    where
        T: Serialize + DeserializeOwned + Send,
        A: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, ActionError>> + Send,
    {
        let name = name.into();
        if name.is_empty() || name.starts_with(RESERVED_PREFIX) {
            return Err(DurableError::Workflow(
                WorkflowError::new(format!("invalid step name '{name}'"))
                    .with_code(error_codes::INVALID_STEP_NAME),
            ));
        }
        self.run_step(name, action).await
    }

    pub(crate) async fn run_step<T, A, Fut>(&mut self, name: String, action: A) -> Result<T, DurableError>
    where
        T: Serialize + DeserializeOwned + Send,
        A: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, ActionError>> + Send,
    {
        if let Some(outcome) = self.cached_step(&name) {
            return decode(&name, outcome.clone());
        }

        match self.peek_command() {
            Some(entry) if entry.name == name => {
                let Some(EntryPayload::StepResult { outcome }) =
                    self.consume_command().map(|entry| entry.payload)
                else {
                    return Err(DurableError::NonDeterminism(format!(
                        "'{name}' is journaled as a timer, not a step"
                    )));
                };
                debug!(invocation_id = %self.invocation_id(), step = %name, "replayed step");
                self.remember_step(name.clone(), outcome.clone());
                return decode(&name, outcome);
            }
            Some(_) => return Err(self.divergence(&format!("step '{name}'"))),
            None => {}
        }

        self.ensure_not_cancelled()?;

        debug!(invocation_id = %self.invocation_id(), step = %name, "executing step");
        let outcome = match action().await {
            Ok(value) => StepOutcome::Success {
                value: serde_json::to_value(&value).map_err(|e| {
                    DurableError::workflow(format!("step '{name}' result does not serialize: {e}"))
                })?,
            },
            Err(error) => {
                warn!(
                    invocation_id = %self.invocation_id(),
                    step = %name,
                    error = %error,
                    "step action failed"
                );
                StepOutcome::Failure { error }
            }
        };

        self.append(
            &name,
            EntryPayload::StepResult {
                outcome: outcome.clone(),
            },
        )
        .await?;
        self.remember_step(name.clone(), outcome.clone());
        decode(&name, outcome)
    }
}

fn decode<T: DeserializeOwned>(name: &str, outcome: StepOutcome) -> Result<T, DurableError> {
    match outcome {
        StepOutcome::Success { value } => Ok(serde_json::from_value(value)?),
        StepOutcome::Failure { error } => Err(DurableError::StepAction {
            step: name.to_string(),
            error,
        }),
    }
}
