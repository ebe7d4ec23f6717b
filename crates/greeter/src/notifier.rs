//! Outbound messages sent by the greeter
//!
//! Sends are the side effects the greeter journals. `SimulatedNotifier`
//! stands in for a real delivery channel and fails at random for a
//! configurable set of recipients.

use std::collections::HashSet;

use async_trait::async_trait;
use hammond_durable::ActionError;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};
use uuid::Uuid;

/// Error type recorded for simulated delivery failures
pub const SIMULATED_FAILURE: &str = "simulated_failure";

/// Delivers greeting messages
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Tell `name` they were greeted
    async fn send_notification(&self, greeting_id: Uuid, name: &str) -> Result<(), ActionError>;

    /// Remind `name` about the greeting
    async fn send_reminder(&self, greeting_id: Uuid, name: &str) -> Result<(), ActionError>;
}

/// Kind of message a notifier sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Notification,
    Reminder,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Notification => write!(f, "notification"),
            Self::Reminder => write!(f, "reminder"),
        }
    }
}

/// A delivery attempt seen by a [`SimulatedNotifier`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub kind: MessageKind,
    pub greeting_id: Uuid,
    pub name: String,
    pub delivered: bool,
}

/// Notifier that only logs, failing at random for flaky recipients
pub struct SimulatedNotifier {
    failure_rate: f64,
    flaky_names: HashSet<String>,
    rng: Mutex<StdRng>,
    deliveries: Mutex<Vec<Delivery>>,
}

impl SimulatedNotifier {
    /// Create a notifier failing with probability `failure_rate` for `flaky_names`
    pub fn new(failure_rate: f64, flaky_names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::with_rng(failure_rate, flaky_names, StdRng::from_entropy())
    }

    /// Same as [`SimulatedNotifier::new`] with reproducible failures
    pub fn seeded(
        failure_rate: f64,
        flaky_names: impl IntoIterator<Item = impl Into<String>>,
        seed: u64,
    ) -> Self {
        Self::with_rng(failure_rate, flaky_names, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        failure_rate: f64,
        flaky_names: impl IntoIterator<Item = impl Into<String>>,
        rng: StdRng,
    ) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            flaky_names: flaky_names.into_iter().map(Into::into).collect(),
            rng: Mutex::new(rng),
            deliveries: Mutex::new(Vec::new()),
        }
    }

    /// Every delivery attempt so far, in order
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    /// Number of attempts of `kind` for `name`
    pub fn attempts(&self, kind: MessageKind, name: &str) -> usize {
        self.deliveries
            .lock()
            .iter()
            .filter(|d| d.kind == kind && d.name == name)
            .count()
    }

    fn should_fail(&self, name: &str) -> bool {
        self.flaky_names.contains(name) && self.rng.lock().gen::<f64>() < self.failure_rate
    }

    fn deliver(&self, kind: MessageKind, greeting_id: Uuid, name: &str) -> Result<(), ActionError> {
        let delivered = !self.should_fail(name);
        self.deliveries.lock().push(Delivery {
            kind,
            greeting_id,
            name: name.to_string(),
            delivered,
        });

        if delivered {
            info!(%greeting_id, %name, "{kind} sent");
            return Ok(());
        }

        let message = format!("[SIMULATED] Failed to send {kind}: {greeting_id} - {name}");
        warn!(%greeting_id, %name, "{message}");
        Err(ActionError::retryable(message).with_type(SIMULATED_FAILURE))
    }
}

#[async_trait]
impl Notifier for SimulatedNotifier {
    async fn send_notification(&self, greeting_id: Uuid, name: &str) -> Result<(), ActionError> {
        self.deliver(MessageKind::Notification, greeting_id, name)
    }

    async fn send_reminder(&self, greeting_id: Uuid, name: &str) -> Result<(), ActionError> {
        self.deliver(MessageKind::Reminder, greeting_id, name)
    }
}

impl std::fmt::Debug for SimulatedNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedNotifier")
            .field("failure_rate", &self.failure_rate)
            .field("flaky_names", &self.flaky_names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reliable_recipient_always_delivered() {
        let notifier = SimulatedNotifier::seeded(1.0, ["Alice"], 7);
        let id = Uuid::now_v7();

        notifier.send_notification(id, "Bob").await.unwrap();
        notifier.send_reminder(id, "Bob").await.unwrap();

        assert_eq!(notifier.attempts(MessageKind::Notification, "Bob"), 1);
        assert_eq!(notifier.attempts(MessageKind::Reminder, "Bob"), 1);
        assert!(notifier.deliveries().iter().all(|d| d.delivered));
    }

    #[tokio::test]
    async fn test_flaky_recipient_fails_with_retryable_error() {
        let notifier = SimulatedNotifier::seeded(1.0, ["Alice"], 7);
        let err = notifier
            .send_notification(Uuid::now_v7(), "Alice")
            .await
            .unwrap_err();

        assert!(err.retryable);
        assert_eq!(err.error_type.as_deref(), Some(SIMULATED_FAILURE));
        assert!(err.message.starts_with("[SIMULATED] Failed to send notification"));
        assert!(!notifier.deliveries()[0].delivered);
    }

    #[tokio::test]
    async fn test_zero_failure_rate_never_fails() {
        let notifier = SimulatedNotifier::seeded(0.0, ["Alice"], 7);
        for _ in 0..20 {
            notifier
                .send_reminder(Uuid::now_v7(), "Alice")
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_failure_rate_is_clamped() {
        let notifier = SimulatedNotifier::seeded(3.5, Vec::<String>::new(), 1);
        assert_eq!(notifier.failure_rate, 1.0);
    }
}
