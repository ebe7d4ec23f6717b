//! Running greetings through a driver
//!
//! `GreeterRunner` owns a driver with the greeter registered, a timer task and
//! the wake-up loop that resumes suspended greetings.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::future::try_join_all;
use hammond_durable::{
    DriverError, InvocationOutcome, InvocationReport, JournalStore, TokioWakeupScheduler,
    WorkflowDriver,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::GreeterConfig;
use crate::greeter::{GreeterWorkflow, GreetingRequest};
use crate::notifier::Notifier;

/// Final outcome of one greeting
#[derive(Debug, Clone, PartialEq)]
pub struct GreetingResult {
    pub name: String,
    pub invocation_id: Uuid,
    pub outcome: InvocationOutcome,
}

/// Register the greeter workflow on `driver`
pub fn register_greeter<S: JournalStore>(
    driver: &mut WorkflowDriver<S>,
    notifier: Arc<dyn Notifier>,
    config: &GreeterConfig,
) {
    let reminder_delay = config.reminder_delay;
    driver.register(move || GreeterWorkflow::new(notifier.clone(), reminder_delay));
}

/// A driver plus the background tasks that wake suspended greetings
pub struct GreeterRunner<S: JournalStore> {
    driver: Arc<WorkflowDriver<S>>,
    shutdown: CancellationToken,
    wakeup_loop: JoinHandle<()>,
}

impl<S: JournalStore> GreeterRunner<S> {
    /// Build the driver and start the wake-up loop
    pub fn start(store: S, config: &GreeterConfig, notifier: Arc<dyn Notifier>) -> Self {
        let shutdown = CancellationToken::new();
        let (scheduler, wakeups) = TokioWakeupScheduler::spawn(shutdown.clone());

        let mut driver = WorkflowDriver::with_config(store, config.driver.clone())
            .with_scheduler(Arc::new(scheduler));
        register_greeter(&mut driver, notifier, config);
        let driver = Arc::new(driver);

        let wakeup_loop = tokio::spawn(driver.clone().serve_wakeups(wakeups, shutdown.clone()));

        Self {
            driver,
            shutdown,
            wakeup_loop,
        }
    }

    pub fn driver(&self) -> &Arc<WorkflowDriver<S>> {
        &self.driver
    }

    /// Resume greetings left unfinished by an earlier process
    pub async fn recover(&self) -> Result<Vec<InvocationReport>, DriverError> {
        self.driver.recover().await
    }

    /// Greet everyone in `names` and wait until every greeting is terminal
    ///
    /// Results come back in the order of `names`.
    pub async fn greet_all(&self, names: &[String]) -> Result<Vec<GreetingResult>> {
        // Subscribe first so no terminal outcome slips past
        let mut outcomes = self.driver.outcomes();

        let started = try_join_all(names.iter().map(|name| async move {
            self.driver
                .invoke::<GreeterWorkflow>(None, GreetingRequest::new(name.clone()))
                .await
                .with_context(|| format!("Failed to start greeting for {name}"))
        }))
        .await?;

        let mut results: Vec<Option<GreetingResult>> = vec![None; names.len()];
        let mut pending: HashMap<Uuid, usize> = HashMap::new();
        for (index, report) in started.into_iter().enumerate() {
            if report.outcome.is_terminal() {
                results[index] = Some(GreetingResult {
                    name: names[index].clone(),
                    invocation_id: report.invocation_id,
                    outcome: report.outcome,
                });
            } else {
                info!(invocation_id = %report.invocation_id, name = %names[index], "greeting suspended");
                pending.insert(report.invocation_id, index);
            }
        }

        while !pending.is_empty() {
            match outcomes.recv().await {
                Ok(report) => {
                    if let Some(index) = pending.remove(&report.invocation_id) {
                        results[index] = Some(GreetingResult {
                            name: names[index].clone(),
                            invocation_id: report.invocation_id,
                            outcome: report.outcome,
                        });
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "missed outcome notifications, checking journals");
                    for (invocation_id, index) in pending.clone() {
                        let snapshot = self.driver.snapshot(invocation_id).await?;
                        if let Some(outcome) = InvocationOutcome::from_snapshot(&snapshot) {
                            pending.remove(&invocation_id);
                            results[index] = Some(GreetingResult {
                                name: names[index].clone(),
                                invocation_id,
                                outcome,
                            });
                        }
                    }
                }
                Err(RecvError::Closed) => bail!("driver stopped publishing outcomes"),
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    /// Stop the wake-up loop and wait for in-flight resumes
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.wakeup_loop
            .await
            .context("Wake-up loop panicked")
    }
}
