//! Greeter workflow tests against the in-memory journal
//!
//! Run with: cargo test -p hammond-greeter --test greeter_test

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hammond_durable::{
    ActionError, DriverConfig, EntryKind, FailureClassifier, InMemoryJournalStore,
    InvocationOutcome, JournalStore, ManualClock, RetryPolicy, UserErrorPolicy, WorkflowDriver,
};
use hammond_greeter::notifier::SIMULATED_FAILURE;
use hammond_greeter::{
    register_greeter, GreeterConfig, GreeterRunner, GreeterWorkflow, GreetingRequest,
    MessageKind, Notifier, SimulatedNotifier,
};
use serde_json::json;
use uuid::Uuid;

/// Fails the first `failures` notifications, then delivers everything
#[derive(Default)]
struct ScriptedNotifier {
    failures: AtomicU32,
    notifications: AtomicU32,
    reminders: AtomicU32,
}

impl ScriptedNotifier {
    fn failing(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Notifier for ScriptedNotifier {
    async fn send_notification(&self, _greeting_id: Uuid, name: &str) -> Result<(), ActionError> {
        self.notifications.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ActionError::retryable(format!("mailbox of {name} is full")));
        }
        Ok(())
    }

    async fn send_reminder(&self, _greeting_id: Uuid, _name: &str) -> Result<(), ActionError> {
        self.reminders.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn config(policy: UserErrorPolicy) -> GreeterConfig {
    GreeterConfig {
        reminder_delay: Duration::from_secs(1),
        driver: DriverConfig::default()
            .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(100), 5))
            .with_classifier(FailureClassifier::new(policy)),
        ..Default::default()
    }
}

fn driver(
    store: Arc<InMemoryJournalStore>,
    clock: &ManualClock,
    notifier: Arc<dyn Notifier>,
    config: &GreeterConfig,
) -> WorkflowDriver<InMemoryJournalStore> {
    let mut driver =
        WorkflowDriver::from_shared(store, config.driver.clone()).with_clock(clock.clone());
    register_greeter(&mut driver, notifier, config);
    driver
}

#[test_log::test(tokio::test)]
async fn test_greeting_sends_each_message_once() {
    let store = Arc::new(InMemoryJournalStore::new());
    let clock = ManualClock::starting_now();
    let notifier = Arc::new(SimulatedNotifier::seeded(0.7, ["Alice"], 1));
    let config = config(UserErrorPolicy::RetryableFlag);
    let driver = driver(store.clone(), &clock, notifier.clone(), &config);

    let report = driver
        .invoke_and_wait::<GreeterWorkflow>(None, GreetingRequest::new("Bob"))
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        InvocationOutcome::Completed {
            output: json!({ "message": "You said hi to Bob!" })
        }
    );
    assert_eq!(notifier.attempts(MessageKind::Notification, "Bob"), 1);
    assert_eq!(notifier.attempts(MessageKind::Reminder, "Bob"), 1);

    // Both sends carry the journaled greeting id
    let deliveries = notifier.deliveries();
    assert_eq!(deliveries[0].greeting_id, deliveries[1].greeting_id);

    let kinds: Vec<_> = store
        .read_all(report.invocation_id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind())
        .collect();
    assert_eq!(
        kinds,
        vec![
            EntryKind::InvocationCreated,
            EntryKind::StepResult,
            EntryKind::StepResult,
            EntryKind::TimerArmed,
            EntryKind::TimerFired,
            EntryKind::StepResult,
            EntryKind::InvocationCompleted,
        ]
    );
}

#[test_log::test(tokio::test)]
async fn test_failed_notification_is_retried_by_invocation() {
    let store = Arc::new(InMemoryJournalStore::new());
    let clock = ManualClock::starting_now();
    let notifier = Arc::new(ScriptedNotifier::failing(2));
    let config = config(UserErrorPolicy::RetryableFlag);
    let driver = driver(store.clone(), &clock, notifier.clone(), &config);

    let report = driver
        .invoke_and_wait::<GreeterWorkflow>(None, GreetingRequest::new("Alice"))
        .await
        .unwrap();

    assert!(matches!(report.outcome, InvocationOutcome::Completed { .. }));
    assert_eq!(notifier.notifications.load(Ordering::SeqCst), 3);
    assert_eq!(notifier.reminders.load(Ordering::SeqCst), 1);

    let snapshot = driver.snapshot(report.invocation_id).await.unwrap();
    assert_eq!(snapshot.attempt, 3);
}

#[test_log::test(tokio::test)]
async fn test_terminal_policy_fails_on_first_send_error() {
    let store = Arc::new(InMemoryJournalStore::new());
    let clock = ManualClock::starting_now();
    let notifier = Arc::new(SimulatedNotifier::seeded(1.0, ["Alice"], 1));
    let config = config(UserErrorPolicy::Terminal);
    let driver = driver(store, &clock, notifier.clone(), &config);

    let report = driver
        .invoke_and_wait::<GreeterWorkflow>(None, GreetingRequest::new("Alice"))
        .await
        .unwrap();

    let InvocationOutcome::Failed { error } = report.outcome else {
        panic!("expected failure, got {:?}", report.outcome);
    };
    assert!(error.message.contains("[SIMULATED] Failed to send notification"));
    assert_eq!(error.code.as_deref(), Some(SIMULATED_FAILURE));
    assert_eq!(notifier.attempts(MessageKind::Notification, "Alice"), 1);
    assert_eq!(notifier.attempts(MessageKind::Reminder, "Alice"), 0);
}

#[test_log::test(tokio::test)]
async fn test_restart_during_delay_does_not_resend_notification() {
    let store = Arc::new(InMemoryJournalStore::new());
    let clock = ManualClock::starting_now();
    let notifier = Arc::new(ScriptedNotifier::default());
    let config = config(UserErrorPolicy::RetryableFlag);

    let before = driver(store.clone(), &clock, notifier.clone(), &config);
    let report = before
        .invoke::<GreeterWorkflow>(None, GreetingRequest::new("Carol"))
        .await
        .unwrap();
    assert!(matches!(report.outcome, InvocationOutcome::Suspended { .. }));
    drop(before);

    let after = driver(store.clone(), &clock, notifier.clone(), &config);
    let done = after.resume_until_done(report.invocation_id).await.unwrap();

    assert_eq!(
        done.outcome,
        InvocationOutcome::Completed {
            output: json!({ "message": "You said hi to Carol!" })
        }
    );
    assert_eq!(notifier.notifications.load(Ordering::SeqCst), 1);
    assert_eq!(notifier.reminders.load(Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test)]
async fn test_runner_greets_everyone() {
    let config = GreeterConfig {
        reminder_delay: Duration::from_millis(100),
        ..config(UserErrorPolicy::RetryableFlag)
    };
    let notifier = Arc::new(ScriptedNotifier::failing(1));
    let runner = GreeterRunner::start(InMemoryJournalStore::new(), &config, notifier.clone());

    let names = vec!["Alice".to_string(), "Bob".to_string()];
    let results = tokio::time::timeout(Duration::from_secs(10), runner.greet_all(&names))
        .await
        .expect("greetings should finish")
        .unwrap();

    assert_eq!(results.len(), 2);
    for (result, name) in results.iter().zip(&names) {
        assert_eq!(&result.name, name);
        assert_eq!(
            result.outcome,
            InvocationOutcome::Completed {
                output: json!({ "message": format!("You said hi to {name}!") })
            }
        );
    }
    assert_eq!(notifier.reminders.load(Ordering::SeqCst), 2);

    runner.shutdown().await.unwrap();
}
