//! Workflow driver with replay support
//!
//! The `WorkflowDriver` is responsible for:
//! - Creating invocations and running them to a terminal or suspended state
//! - Replaying the journal on every (re)entry so completed steps are skipped
//! - Serializing executions of one invocation (process-local guard plus a
//!   store lease across processes)
//! - Applying the failure classifier and invocation-level retries
//! - Cancellation and crash recovery

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::context::{ContextServices, InvocationContext};
use crate::journal::{
    EntryPayload, InvocationSnapshot, InvocationStatus, JournalEntry, JournalStore, ReplayLog,
    StoreError,
};
use crate::reliability::RetryPolicy;
use crate::timer::{Clock, InMemoryWakeups, SystemClock, WakeupScheduler};
use crate::workflow::{error_codes, DurableError, Workflow, WorkflowError};

use super::classifier::{FailureClass, FailureClassifier};
use super::registry::{RegistryError, WorkflowRegistry};

/// First delay before a parked invocation is tried again
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Floor for the lease heartbeat period
const MIN_LEASE_RENEWAL: Duration = Duration::from_millis(10);

/// Configuration for the workflow driver
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Identity written into exclusivity leases
    pub owner_id: String,

    /// How long a lease stays valid without renewal
    pub lease_ttl: Duration,

    /// Maximum journal entries per invocation (for safety)
    pub max_journal_entries: usize,

    /// Invocation-level retries for transient failures
    pub retry_policy: RetryPolicy,

    /// Transient/terminal classification
    pub classifier: FailureClassifier,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            owner_id: format!("driver-{}", Uuid::now_v7()),
            lease_ttl: Duration::from_secs(60),
            max_journal_entries: 10_000,
            retry_policy: RetryPolicy::default(),
            classifier: FailureClassifier::default(),
        }
    }
}

impl DriverConfig {
    /// Set the lease owner id
    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    /// Set the lease TTL
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Set the journal size limit
    pub fn with_max_journal_entries(mut self, max: usize) -> Self {
        self.max_journal_entries = max;
        self
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the failure classifier
    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }
}

/// Errors from driver operations
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Store error
    #[error("store error: {0}")]
    Store(StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Invocation not found
    #[error("invocation not found: {0}")]
    InvocationNotFound(Uuid),

    /// Another execution owns the invocation; this one abandoned its work
    #[error("conflict: {0}")]
    Conflict(String),

    /// Another driver holds the invocation's exclusivity lease
    #[error("invocation {invocation_id} is leased by {holder} until {expires_at}")]
    LeaseHeld {
        invocation_id: Uuid,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    /// The invocation already reached a terminal status
    #[error("invocation {0} is already {1}")]
    AlreadyTerminal(Uuid, InvocationStatus),

    /// Too many journal entries
    #[error("invocation {0} has too many journal entries ({1} > {2})")]
    TooManyEntries(Uuid, usize, usize),

    /// Infrastructure stayed unavailable through every retry
    #[error("infrastructure unavailable: {0}")]
    Unavailable(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DriverError {
    /// Check if another execution got in the way
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::LeaseHeld { .. })
    }
}

impl From<StoreError> for DriverError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LeaseConflict {
                invocation_id,
                holder,
                expires_at,
            } => Self::LeaseHeld {
                invocation_id,
                holder,
                expires_at,
            },
            err if err.is_conflict() => Self::Conflict(err.to_string()),
            err => Self::Store(err),
        }
    }
}

/// Where an execution left an invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InvocationOutcome {
    /// The workflow returned a value
    Completed { output: Value },
    /// The invocation failed permanently
    Failed { error: WorkflowError },
    /// The invocation was cancelled
    Cancelled { reason: String },
    /// Waiting for a durable timer, or parked until another try
    Suspended { fire_at: DateTime<Utc> },
}

impl InvocationOutcome {
    /// Check if the invocation will not run again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Suspended { .. })
    }

    /// Terminal outcome recorded in a snapshot, if any
    pub fn from_snapshot(snapshot: &InvocationSnapshot) -> Option<Self> {
        match snapshot.status {
            InvocationStatus::Completed => Some(Self::Completed {
                output: snapshot.output.clone().unwrap_or(Value::Null),
            }),
            InvocationStatus::Failed => Some(Self::Failed {
                error: snapshot
                    .error
                    .clone()
                    .unwrap_or_else(|| WorkflowError::new("invocation failed")),
            }),
            InvocationStatus::Cancelled => Some(Self::Cancelled {
                reason: snapshot.cancel_reason.clone().unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

/// Outcome of one driver call for one invocation
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationReport {
    pub invocation_id: Uuid,
    pub outcome: InvocationOutcome,
}

/// How one leased attempt ended
enum Attempt {
    Settled(InvocationOutcome),
    /// A transient failure was journaled; try again at this time
    RetryAt(DateTime<Utc>),
    /// Infrastructure failed inside the body
    Unavailable(String),
}

/// Removes the process-local running marker when an execution ends
struct RunningGuard<'a> {
    running: &'a DashMap<Uuid, CancellationToken>,
    invocation_id: Uuid,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.invocation_id);
    }
}

/// Workflow driver
///
/// Drives invocations by replaying their journals and running workflow code
/// until it completes, fails, or suspends on a timer.
///
/// # Example
///
/// ```ignore
/// use hammond_durable::prelude::*;
///
/// let mut driver = WorkflowDriver::new(InMemoryJournalStore::new());
/// driver.register(|| GreeterWorkflow::default());
///
/// let report = driver
///     .invoke_and_wait::<GreeterWorkflow>(None, GreetingRequest { name: "Alice".into() })
///     .await?;
/// ```
pub struct WorkflowDriver<S: JournalStore> {
    store: Arc<S>,
    registry: WorkflowRegistry,
    config: DriverConfig,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn WakeupScheduler>,
    running: DashMap<Uuid, CancellationToken>,
    /// Consecutive failed resumes of parked invocations
    parked: DashMap<Uuid, u32>,
    outcomes: broadcast::Sender<InvocationReport>,
}

impl<S: JournalStore> WorkflowDriver<S> {
    /// Create a new driver with the given store
    pub fn new(store: S) -> Self {
        Self::with_config(store, DriverConfig::default())
    }

    /// Create a new driver with custom config
    pub fn with_config(store: S, config: DriverConfig) -> Self {
        Self::from_shared(Arc::new(store), config)
    }

    /// Create a driver over a store shared with other drivers
    pub fn from_shared(store: Arc<S>, config: DriverConfig) -> Self {
        let (outcomes, _) = broadcast::channel(1024);
        Self {
            store,
            registry: WorkflowRegistry::new(),
            config,
            clock: Arc::new(SystemClock),
            scheduler: Arc::new(InMemoryWakeups::new()),
            running: DashMap::new(),
            parked: DashMap::new(),
            outcomes,
        }
    }

    /// Use a different clock
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Use a different wake-up scheduler
    pub fn with_scheduler<W: WakeupScheduler>(mut self, scheduler: Arc<W>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Register a workflow type
    pub fn register<W, F>(&mut self, factory: F)
    where
        W: Workflow,
        F: Fn() -> W + Send + Sync + 'static,
    {
        self.registry.register(factory);
        info!(workflow_type = W::TYPE, "registered workflow type");
    }

    /// Get a reference to the store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Get the driver configuration
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Subscribe to terminal outcomes of invocations run by this driver
    pub fn outcomes(&self) -> broadcast::Receiver<InvocationReport> {
        self.outcomes.subscribe()
    }

    /// Create an invocation of `W` and run it until it completes, fails, or suspends
    ///
    /// Passing an existing `invocation_id` of the same type is idempotent: the
    /// invocation is resumed rather than created twice.
    #[instrument(skip(self, input), fields(workflow_type = W::TYPE))]
    pub async fn invoke<W: Workflow>(
        &self,
        invocation_id: Option<Uuid>,
        input: W::Input,
    ) -> Result<InvocationReport, DriverError> {
        let input = serde_json::to_value(&input)?;
        self.invoke_json(W::TYPE, invocation_id, input).await
    }

    /// Create an invocation by type name with JSON input
    #[instrument(skip(self, input))]
    pub async fn invoke_json(
        &self,
        workflow_type: &str,
        invocation_id: Option<Uuid>,
        input: Value,
    ) -> Result<InvocationReport, DriverError> {
        self.registry.validate_input(workflow_type, &input)?;
        let invocation_id = invocation_id.unwrap_or_else(Uuid::now_v7);

        self.create(invocation_id, workflow_type, input).await?;
        self.resume(invocation_id).await
    }

    /// Invoke and keep resuming through suspensions until a terminal outcome
    pub async fn invoke_and_wait<W: Workflow>(
        &self,
        invocation_id: Option<Uuid>,
        input: W::Input,
    ) -> Result<InvocationReport, DriverError> {
        let report = self.invoke::<W>(invocation_id, input).await?;
        self.wait_through(report).await
    }

    /// Resume and keep resuming through suspensions until a terminal outcome
    pub async fn resume_until_done(&self, invocation_id: Uuid) -> Result<InvocationReport, DriverError> {
        let report = self.resume(invocation_id).await?;
        self.wait_through(report).await
    }

    async fn wait_through(&self, mut report: InvocationReport) -> Result<InvocationReport, DriverError> {
        while let InvocationOutcome::Suspended { fire_at } = report.outcome {
            self.clock.sleep_until(fire_at).await;
            report = self.resume(report.invocation_id).await?;
        }
        Ok(report)
    }

    async fn create(
        &self,
        invocation_id: Uuid,
        workflow_type: &str,
        input: Value,
    ) -> Result<(), DriverError> {
        let created = JournalEntry::new(
            0,
            workflow_type,
            EntryPayload::InvocationCreated {
                workflow_type: workflow_type.to_string(),
                input,
            },
            self.clock.now(),
        );

        match self.store.append(invocation_id, created).await {
            Ok(_) => {
                info!(%invocation_id, %workflow_type, "created invocation");
                Ok(())
            }
            // Already exists: fine if it is the same workflow
            Err(StoreError::ConcurrencyConflict { .. }) => {
                let entries = self.store.read_all(invocation_id).await?;
                let existing = InvocationSnapshot::fold(invocation_id, &entries)
                    .ok_or(DriverError::InvocationNotFound(invocation_id))?;
                if existing.workflow_type != workflow_type {
                    return Err(DriverError::Conflict(format!(
                        "invocation {invocation_id} already exists as {}",
                        existing.workflow_type
                    )));
                }
                debug!(%invocation_id, "invocation already exists");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Replay an invocation and continue executing it
    ///
    /// Returns the stored outcome unchanged for a terminal invocation. Fails
    /// with [`DriverError::Conflict`] if this driver is already running the
    /// invocation, and with [`DriverError::LeaseHeld`] if another driver owns it.
    ///
    /// The lease is held (and renewed) only while an attempt runs; it is
    /// released during retry backoff so another driver may take over.
    #[instrument(skip(self))]
    pub async fn resume(&self, invocation_id: Uuid) -> Result<InvocationReport, DriverError> {
        let token = CancellationToken::new();
        let _guard = match self.running.entry(invocation_id) {
            Entry::Occupied(_) => {
                return Err(DriverError::Conflict(format!(
                    "invocation {invocation_id} is already running in this driver"
                )));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(token.clone());
                RunningGuard {
                    running: &self.running,
                    invocation_id,
                }
            }
        };

        let policy = &self.config.retry_policy;
        let mut infrastructure_failures = 0u32;

        loop {
            let message = match self.leased_attempt(invocation_id, &token).await {
                Ok(Attempt::Settled(outcome)) => {
                    return Ok(InvocationReport {
                        invocation_id,
                        outcome,
                    });
                }
                Ok(Attempt::RetryAt(retry_at)) => {
                    self.clock.sleep_until(retry_at).await;
                    continue;
                }
                Ok(Attempt::Unavailable(message)) => message,
                // Store failures around the body count like failures inside it
                Err(DriverError::Store(err)) => err.to_string(),
                Err(err) => return Err(err),
            };

            infrastructure_failures += 1;
            if !policy.has_attempts_remaining(infrastructure_failures) {
                error!(%invocation_id, %message, "infrastructure still unavailable, giving up");
                return Err(DriverError::Unavailable(message));
            }
            warn!(%invocation_id, %message, infrastructure_failures, "infrastructure error, retrying");
            let retry_at = policy.next_attempt_at(self.clock.now(), infrastructure_failures);
            self.clock.sleep_until(retry_at).await;
        }
    }

    /// Broadcast a terminal transition made by this driver
    fn publish(&self, invocation_id: Uuid, outcome: &InvocationOutcome) {
        // No subscribers is fine
        let _ = self.outcomes.send(InvocationReport {
            invocation_id,
            outcome: outcome.clone(),
        });
    }

    /// Take the lease, run one attempt while renewing it, release it
    async fn leased_attempt(
        &self,
        invocation_id: Uuid,
        token: &CancellationToken,
    ) -> Result<Attempt, DriverError> {
        self.store
            .acquire_lease(invocation_id, &self.config.owner_id, self.config.lease_ttl)
            .await?;

        let lease_lost = CancellationToken::new();
        let attempt = self.run_attempt(invocation_id, token.clone(), lease_lost.clone());
        tokio::pin!(attempt);
        let result = tokio::select! {
            result = &mut attempt => result,
            // The lease is gone; let the attempt stop at its next boundary
            () = self.keep_lease(invocation_id, &lease_lost) => attempt.await,
        };

        let result = match result {
            // Lost to a concurrent cancel: the invocation ended, just not here
            Err(DriverError::Conflict(message)) => match self.terminal_outcome(invocation_id).await {
                Ok(Some(outcome @ InvocationOutcome::Cancelled { .. })) => {
                    Ok(Attempt::Settled(outcome))
                }
                _ => {
                    warn!(%invocation_id, %message, "lost journal race, abandoning execution");
                    Err(DriverError::Conflict(message))
                }
            },
            other => other,
        };

        if let Err(e) = self
            .store
            .release_lease(invocation_id, &self.config.owner_id)
            .await
        {
            warn!(%invocation_id, error = %e, "failed to release lease");
        }

        result
    }

    /// Renew the lease every third of its TTL
    ///
    /// Returns, with `lost` cancelled, once another owner has the lease or
    /// renewals have failed for a whole TTL. Never returns otherwise.
    async fn keep_lease(&self, invocation_id: Uuid, lost: &CancellationToken) {
        let ttl = self.config.lease_ttl;
        let mut renewals = tokio::time::interval((ttl / 3).max(MIN_LEASE_RENEWAL));
        renewals.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        renewals.tick().await;
        let mut renewed_at = Instant::now();

        loop {
            renewals.tick().await;
            match self
                .store
                .acquire_lease(invocation_id, &self.config.owner_id, ttl)
                .await
            {
                Ok(()) => {
                    trace!(%invocation_id, "renewed lease");
                    renewed_at = Instant::now();
                }
                Err(err) if err.is_conflict() => {
                    warn!(%invocation_id, error = %err, "lease taken over, abandoning at next step");
                    break;
                }
                Err(err) if renewed_at.elapsed() >= ttl => {
                    warn!(%invocation_id, error = %err, "lease expired while renewals failed, abandoning at next step");
                    break;
                }
                Err(err) => {
                    warn!(%invocation_id, error = %err, "failed to renew lease, retrying");
                }
            }
        }
        lost.cancel();
    }

    /// Replay the journal and run the body once
    async fn run_attempt(
        &self,
        invocation_id: Uuid,
        token: CancellationToken,
        lease_lost: CancellationToken,
    ) -> Result<Attempt, DriverError> {
        let policy = &self.config.retry_policy;

        let entries = self.store.read_all(invocation_id).await?;
        if entries.len() > self.config.max_journal_entries {
            return Err(DriverError::TooManyEntries(
                invocation_id,
                entries.len(),
                self.config.max_journal_entries,
            ));
        }

        let snapshot = InvocationSnapshot::fold(invocation_id, &entries)
            .ok_or(DriverError::InvocationNotFound(invocation_id))?;
        if let Some(outcome) = InvocationOutcome::from_snapshot(&snapshot) {
            debug!(%invocation_id, status = %snapshot.status, "invocation already terminal");
            return Ok(Attempt::Settled(outcome));
        }

        let workflow = self.registry.create(&snapshot.workflow_type)?;
        let log = ReplayLog::from_entries(&entries);
        let attempt = log.attempt();
        let mut ctx = InvocationContext::new(
            invocation_id,
            &snapshot.workflow_type,
            log,
            self.services(),
            token,
        )
        .with_lease_fence(lease_lost.clone());

        debug!(%invocation_id, attempt, entries = entries.len(), "running invocation");
        let result = workflow.run_json(&mut ctx, snapshot.input.clone()).await;
        let seq = ctx.next_seq();
        let workflow_type = snapshot.workflow_type.as_str();

        let err = match result {
            Ok(_) | Err(DurableError::Infrastructure(_)) if lease_lost.is_cancelled() =>
            {
                return Err(DriverError::Conflict(format!(
                    "lease on invocation {invocation_id} was lost"
                )));
            }
            Ok(output) => {
                self.finish(
                    invocation_id,
                    workflow_type,
                    seq,
                    EntryPayload::InvocationCompleted {
                        output: output.clone(),
                    },
                )
                .await?;
                info!(%invocation_id, attempt, "invocation completed");
                let outcome = InvocationOutcome::Completed { output };
                self.publish(invocation_id, &outcome);
                return Ok(Attempt::Settled(outcome));
            }
            Err(DurableError::Suspended { fire_at }) => {
                info!(%invocation_id, %fire_at, "invocation suspended");
                return Ok(Attempt::Settled(InvocationOutcome::Suspended { fire_at }));
            }
            Err(err) => err,
        };

        match err {
            DurableError::Cancelled { reason } => {
                return self
                    .settle_cancelled(invocation_id, workflow_type, reason)
                    .await
                    .map(Attempt::Settled);
            }
            DurableError::Conflict(message) => return Err(DriverError::Conflict(message)),
            DurableError::Infrastructure(message) => return Ok(Attempt::Unavailable(message)),
            _ if lease_lost.is_cancelled() => {
                return Err(DriverError::Conflict(format!(
                    "lease on invocation {invocation_id} was lost"
                )));
            }
            _ => {}
        }

        let record = err.to_workflow_error();
        let transient = self.config.classifier.classify(&err) == FailureClass::Transient
            && policy.should_retry(record.code.as_deref());

        if !transient {
            warn!(%invocation_id, attempt, error = %err, "invocation failed");
            self.finish(
                invocation_id,
                workflow_type,
                seq,
                EntryPayload::InvocationFailed {
                    error: record.clone(),
                },
            )
            .await?;
            let outcome = InvocationOutcome::Failed { error: record };
            self.publish(invocation_id, &outcome);
            return Ok(Attempt::Settled(outcome));
        }

        if !policy.has_attempts_remaining(attempt) {
            let exhausted = WorkflowError::new(format!(
                "gave up after {attempt} attempts: {}",
                record.message
            ))
            .with_code(error_codes::RETRIES_EXHAUSTED);
            warn!(%invocation_id, attempt, error = %err, "retries exhausted");
            self.finish(
                invocation_id,
                workflow_type,
                seq,
                EntryPayload::InvocationFailed {
                    error: exhausted.clone(),
                },
            )
            .await?;
            let outcome = InvocationOutcome::Failed { error: exhausted };
            self.publish(invocation_id, &outcome);
            return Ok(Attempt::Settled(outcome));
        }

        self.finish(
            invocation_id,
            workflow_type,
            seq,
            EntryPayload::AttemptFailed {
                attempt,
                error: record,
                voided_step: err.failed_step().map(String::from),
            },
        )
        .await?;

        let retry_at = policy.next_attempt_at(self.clock.now(), attempt);
        warn!(%invocation_id, attempt, error = %err, %retry_at, "attempt failed, retrying");
        Ok(Attempt::RetryAt(retry_at))
    }

    fn services(&self) -> ContextServices {
        ContextServices {
            store: self.store.clone(),
            clock: self.clock.clone(),
            scheduler: self.scheduler.clone(),
        }
    }

    /// Append a lifecycle entry written by the driver rather than the body
    async fn finish(
        &self,
        invocation_id: Uuid,
        workflow_type: &str,
        seq: u64,
        payload: EntryPayload,
    ) -> Result<(), DriverError> {
        let entry = JournalEntry::new(seq, workflow_type, payload, self.clock.now());
        match self.store.append(invocation_id, entry).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_conflict() => {
                warn!(%invocation_id, seq, "journal moved underneath execution");
                Err(DriverError::Conflict(err.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn terminal_outcome(&self, invocation_id: Uuid) -> Result<Option<InvocationOutcome>, DriverError> {
        let entries = self.store.read_all(invocation_id).await?;
        Ok(InvocationSnapshot::fold(invocation_id, &entries)
            .as_ref()
            .and_then(InvocationOutcome::from_snapshot))
    }

    /// Make sure a cancelled execution ends with a cancellation entry
    async fn settle_cancelled(
        &self,
        invocation_id: Uuid,
        workflow_type: &str,
        reason: String,
    ) -> Result<InvocationOutcome, DriverError> {
        loop {
            if let Some(outcome) = self.terminal_outcome(invocation_id).await? {
                info!(%invocation_id, "invocation cancelled");
                return Ok(outcome);
            }
            let seq = self.store.read_all(invocation_id).await?.len() as u64;
            match self
                .finish(
                    invocation_id,
                    workflow_type,
                    seq,
                    EntryPayload::InvocationCancelled {
                        reason: reason.clone(),
                    },
                )
                .await
            {
                Ok(()) => {
                    let outcome = InvocationOutcome::Cancelled { reason };
                    self.publish(invocation_id, &outcome);
                    return Ok(outcome);
                }
                Err(DriverError::Conflict(_)) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Cancel an invocation
    ///
    /// Appends the cancellation entry first, then signals a running execution
    /// to stop at its next step or timer boundary. In-flight actions are not
    /// interrupted.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        invocation_id: Uuid,
        reason: impl Into<String> + std::fmt::Debug,
    ) -> Result<InvocationReport, DriverError> {
        let reason = reason.into();

        loop {
            let entries = self.store.read_all(invocation_id).await?;
            let snapshot = InvocationSnapshot::fold(invocation_id, &entries)
                .ok_or(DriverError::InvocationNotFound(invocation_id))?;
            if snapshot.is_terminal() {
                return Err(DriverError::AlreadyTerminal(invocation_id, snapshot.status));
            }

            let entry = JournalEntry::new(
                entries.len() as u64,
                snapshot.workflow_type.as_str(),
                EntryPayload::InvocationCancelled {
                    reason: reason.clone(),
                },
                self.clock.now(),
            );
            match self.store.append(invocation_id, entry).await {
                Ok(_) => break,
                Err(err) if err.is_conflict() => {
                    debug!(%invocation_id, "journal moved while cancelling, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }

        if let Some(token) = self.running.get(&invocation_id) {
            token.cancel();
        }
        if let Err(e) = self.scheduler.cancel_wakeup(invocation_id).await {
            warn!(%invocation_id, error = %e, "failed to cancel wake-up");
        }

        info!(%invocation_id, %reason, "invocation cancelled");
        let outcome = InvocationOutcome::Cancelled { reason };
        self.publish(invocation_id, &outcome);
        Ok(InvocationReport {
            invocation_id,
            outcome,
        })
    }

    /// Folded state of an invocation
    pub async fn snapshot(&self, invocation_id: Uuid) -> Result<InvocationSnapshot, DriverError> {
        let entries = self.store.read_all(invocation_id).await?;
        InvocationSnapshot::fold(invocation_id, &entries)
            .ok_or(DriverError::InvocationNotFound(invocation_id))
    }

    /// Current status of an invocation
    pub async fn status(&self, invocation_id: Uuid) -> Result<InvocationStatus, DriverError> {
        Ok(self.snapshot(invocation_id).await?.status)
    }

    /// Pick up every unfinished invocation in the store
    ///
    /// Invocations waiting on a timer that is not due get their wake-up
    /// re-registered; everything else is resumed now. An invocation still
    /// leased by a crashed driver, or hit by a store outage, is parked with a
    /// wake-up at the lease expiry or after a backoff. Other failures are
    /// logged and skipped.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<Vec<InvocationReport>, DriverError> {
        let mut reports = Vec::new();

        for invocation_id in self.store.list_invocations().await? {
            let snapshot = match self.snapshot(invocation_id).await {
                Ok(snapshot) if !snapshot.is_terminal() => snapshot,
                Ok(_) => continue,
                Err(e) => {
                    warn!(%invocation_id, error = %e, "skipping unreadable invocation");
                    continue;
                }
            };

            if let Some(fire_at) = snapshot.pending_timer.filter(|at| *at > self.clock.now()) {
                if let Err(e) = self.scheduler.register_wakeup(invocation_id, fire_at).await {
                    warn!(%invocation_id, error = %e, "failed to re-register wake-up");
                }
                reports.push(InvocationReport {
                    invocation_id,
                    outcome: InvocationOutcome::Suspended { fire_at },
                });
                continue;
            }

            match self.resume_or_park(invocation_id).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(%invocation_id, error = %e, "failed to recover invocation"),
            }
        }

        info!(recovered = reports.len(), "recovery finished");
        Ok(reports)
    }
}

impl<S: JournalStore> WorkflowDriver<S> {
    /// Resume invocations as their wake-ups arrive
    ///
    /// Invocations run in parallel; wake-ups for one invocation are
    /// serialized by the running guard. Returns once `shutdown` is cancelled
    /// (or the channel closes) and in-flight resumes have finished.
    pub async fn serve_wakeups(
        self: Arc<Self>,
        mut wakeups: mpsc::UnboundedReceiver<Uuid>,
        shutdown: CancellationToken,
    ) {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = wakeups.recv() => {
                    let Some(invocation_id) = next else { break };
                    let driver = Arc::clone(&self);
                    tasks.spawn(async move { driver.resume_on_wakeup(invocation_id).await });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "resume task panicked");
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "resume task panicked");
            }
        }
        debug!("wake-up loop stopped");
    }
}

impl<S: JournalStore> WorkflowDriver<S> {
    /// Resume for a wake-up, parking the invocation again if it cannot run yet
    async fn resume_on_wakeup(&self, invocation_id: Uuid) {
        match self.resume_or_park(invocation_id).await {
            Ok(report) => debug!(%invocation_id, outcome = ?report.outcome, "resumed on wake-up"),
            Err(e) => warn!(%invocation_id, error = %e, "wake-up resume failed"),
        }
    }

    /// Resume now, or register a wake-up for when a retry can succeed
    ///
    /// A parked invocation is reported as suspended until the retry time.
    async fn resume_or_park(&self, invocation_id: Uuid) -> Result<InvocationReport, DriverError> {
        let err = match self.resume(invocation_id).await {
            Ok(report) => {
                self.parked.remove(&invocation_id);
                return Ok(report);
            }
            Err(err) => err,
        };

        let failures = {
            let mut failures = self.parked.entry(invocation_id).or_insert(0);
            *failures = failures.saturating_add(1);
            *failures
        };
        let Some(retry_at) = self.retry_time(&err, failures) else {
            self.parked.remove(&invocation_id);
            return Err(err);
        };

        self.scheduler
            .register_wakeup(invocation_id, retry_at)
            .await
            .map_err(|e| DriverError::Unavailable(format!("cannot park invocation: {e}")))?;
        info!(%invocation_id, error = %err, %retry_at, failures, "invocation parked");
        Ok(InvocationReport {
            invocation_id,
            outcome: InvocationOutcome::Suspended { fire_at: retry_at },
        })
    }

    /// When a failed resume is worth another try, if ever
    fn retry_time(&self, err: &DriverError, failures: u32) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        let backoff = BUSY_RETRY_DELAY
            .saturating_mul(2u32.saturating_pow(failures.saturating_sub(1)))
            .min(self.config.lease_ttl.max(BUSY_RETRY_DELAY));
        let after_backoff = chrono::Duration::from_std(backoff)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        match err {
            // Lease expiry is wall-clock time; never retry before it
            DriverError::LeaseHeld { expires_at, .. } => Some((*expires_at).max(now)),
            DriverError::Conflict(_) | DriverError::Store(_) | DriverError::Unavailable(_) => {
                Some(after_backoff)
            }
            _ => None,
        }
    }
}

impl<S: JournalStore> std::fmt::Debug for WorkflowDriver<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDriver")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("running", &self.running.len())
            .field("parked", &self.parked.len())
            .finish()
    }
}
