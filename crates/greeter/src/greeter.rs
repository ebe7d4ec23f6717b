//! The greeter workflow
//!
//! Notify, wait, remind. Each send is a journaled step, so a greeting that
//! crashes or retries never notifies or reminds twice once a send was recorded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hammond_durable::{DurableError, InvocationContext, Workflow};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::notifier::Notifier;

/// Who to greet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetingRequest {
    pub name: String,
}

impl GreetingRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// The greeting handed back once both messages went out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    pub message: String,
}

impl Greeting {
    pub fn for_name(name: &str) -> Self {
        Self {
            message: format!("You said hi to {name}!"),
        }
    }
}

/// Greets a person durably
pub struct GreeterWorkflow {
    notifier: Arc<dyn Notifier>,
    reminder_delay: Duration,
}

impl GreeterWorkflow {
    pub const NOTIFICATION_STEP: &'static str = "notification";
    pub const REMINDER_STEP: &'static str = "reminder";

    pub fn new(notifier: Arc<dyn Notifier>, reminder_delay: Duration) -> Self {
        Self {
            notifier,
            reminder_delay,
        }
    }
}

#[async_trait]
impl Workflow for GreeterWorkflow {
    const TYPE: &'static str = "greeter";
    type Input = GreetingRequest;
    type Output = Greeting;

    async fn run(
        &self,
        ctx: &mut InvocationContext,
        input: GreetingRequest,
    ) -> Result<Greeting, DurableError> {
        let greeting_id = ctx.uuid().await?;

        let notifier = self.notifier.clone();
        let name = input.name.clone();
        ctx.run(Self::NOTIFICATION_STEP, move || async move {
            notifier.send_notification(greeting_id, &name).await
        })
        .await?;

        ctx.sleep(self.reminder_delay).await?;

        let notifier = self.notifier.clone();
        let name = input.name.clone();
        ctx.run(Self::REMINDER_STEP, move || async move {
            notifier.send_reminder(greeting_id, &name).await
        })
        .await?;

        info!(%greeting_id, name = %input.name, "greeting finished");
        Ok(Greeting::for_name(&input.name))
    }
}

impl std::fmt::Debug for GreeterWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GreeterWorkflow")
            .field("reminder_delay", &self.reminder_delay)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_message() {
        assert_eq!(Greeting::for_name("Bob").message, "You said hi to Bob!");
    }

    #[test]
    fn test_request_wire_format() {
        let request: GreetingRequest = serde_json::from_value(serde_json::json!({
            "name": "Alice"
        }))
        .unwrap();
        assert_eq!(request, GreetingRequest::new("Alice"));
    }
}
