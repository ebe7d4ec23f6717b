//! Invocation context
//!
//! The one handle workflow code receives. It owns the replay cursor over the
//! invocation's journaled commands and hands out everything non-deterministic
//! (identifiers, wall-clock time, randomness) through the journal, so a
//! replayed body sees exactly the values the first execution saw.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use uuid::Uuid;

use crate::journal::{EntryPayload, JournalEntry, JournalStore, ReplayLog};
use crate::step::StepOutcome;
use crate::timer::{Clock, WakeupScheduler};
use crate::workflow::DurableError;

/// Prefix reserved for names the context journals on its own behalf
pub(crate) const RESERVED_PREFIX: char = '$';

/// Shared services an invocation context runs against
#[derive(Clone)]
pub struct ContextServices {
    pub store: Arc<dyn JournalStore>,
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<dyn WakeupScheduler>,
}

/// Per-invocation handle threaded through workflow code
///
/// # Example
///
/// ```ignore
/// async fn run(&self, ctx: &mut InvocationContext, input: Input) -> Result<Output, DurableError> {
///     let id = ctx.uuid().await?;
///     let sent: bool = ctx.run("notify", || async { Ok(true) }).await?;
///     ctx.sleep(Duration::from_secs(1)).await?;
///     Ok(Output { id, sent })
/// }
/// ```
pub struct InvocationContext {
    invocation_id: Uuid,
    workflow_type: String,
    attempt: u32,
    services: ContextServices,
    cancellation: CancellationToken,
    /// Cancelled by the driver once its exclusivity lease is gone
    lease_lost: CancellationToken,

    /// Journaled commands this execution must reproduce, in order
    commands: Vec<JournalEntry>,
    cursor: usize,
    next_seq: u64,

    /// Step outcomes seen by this execution, replayed or live
    steps: HashMap<String, StepOutcome>,
    pub(crate) timer_count: u32,
    uuid_count: u32,
    now_count: u32,
    seed_count: u32,
}

impl InvocationContext {
    /// Create a context positioned at the start of `log`
    pub fn new(
        invocation_id: Uuid,
        workflow_type: impl Into<String>,
        log: ReplayLog,
        services: ContextServices,
        cancellation: CancellationToken,
    ) -> Self {
        let attempt = log.attempt();
        let next_seq = log.next_seq();

        Self {
            invocation_id,
            workflow_type: workflow_type.into(),
            attempt,
            services,
            cancellation,
            lease_lost: CancellationToken::new(),
            commands: log.into_commands(),
            cursor: 0,
            next_seq,
            steps: HashMap::new(),
            timer_count: 0,
            uuid_count: 0,
            now_count: 0,
            seed_count: 0,
        }
    }

    /// Stable identity of this invocation
    pub fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    /// Registered workflow type name
    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    /// Attempt number (1-based), counting invocation-level retries
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Stop live work once `lease_lost` is cancelled
    pub(crate) fn with_lease_fence(mut self, lease_lost: CancellationToken) -> Self {
        self.lease_lost = lease_lost;
        self
    }

    /// Whether the cursor is still inside the journaled history
    pub fn is_replaying(&self) -> bool {
        self.cursor < self.commands.len()
    }

    /// Whether the invocation has been asked to stop
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Journaled identifier, identical on every replay of this call site
    pub async fn uuid(&mut self) -> Result<Uuid, DurableError> {
        let name = format!("{RESERVED_PREFIX}uuid-{}", self.uuid_count);
        self.uuid_count += 1;
        self.run_step(name, || async { Ok(Uuid::now_v7()) }).await
    }

    /// Journaled wall-clock reading
    pub async fn now(&mut self) -> Result<DateTime<Utc>, DurableError> {
        let name = format!("{RESERVED_PREFIX}now-{}", self.now_count);
        self.now_count += 1;
        let now = self.services.clock.now();
        self.run_step(name, || async move { Ok(now) }).await
    }

    /// Random generator seeded from a journaled seed
    ///
    /// Every draw from the returned generator is reproduced on replay as long
    /// as the workflow draws in the same order.
    pub async fn rng(&mut self) -> Result<StdRng, DurableError> {
        let name = format!("{RESERVED_PREFIX}seed-{}", self.seed_count);
        self.seed_count += 1;
        let seed: u64 = self
            .run_step(name, || async { Ok(rand::random::<u64>()) })
            .await?;
        Ok(StdRng::seed_from_u64(seed))
    }

    pub(crate) fn services(&self) -> &ContextServices {
        &self.services
    }

    /// Sequence number the next append must carry
    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub(crate) fn peek_command(&self) -> Option<&JournalEntry> {
        self.commands.get(self.cursor)
    }

    pub(crate) fn consume_command(&mut self) -> Option<JournalEntry> {
        let entry = self.commands.get(self.cursor).cloned();
        if entry.is_some() {
            self.cursor += 1;
        }
        entry
    }

    pub(crate) fn cached_step(&self, name: &str) -> Option<&StepOutcome> {
        self.steps.get(name)
    }

    pub(crate) fn remember_step(&mut self, name: String, outcome: StepOutcome) {
        self.steps.insert(name, outcome);
    }

    /// Fail fast at a live boundary once cancellation was requested or the
    /// lease was lost
    pub(crate) fn ensure_not_cancelled(&self) -> Result<(), DurableError> {
        if self.cancellation.is_cancelled() {
            return Err(DurableError::Cancelled {
                reason: "cancellation requested".to_string(),
            });
        }
        if self.lease_lost.is_cancelled() {
            return Err(DurableError::Conflict(format!(
                "lease on invocation {} was lost",
                self.invocation_id
            )));
        }
        Ok(())
    }

    /// Error for a journal entry that does not match what the code asked for
    pub(crate) fn divergence(&self, expected: &str) -> DurableError {
        let found = match self.peek_command() {
            Some(entry) => format!("{} '{}'", entry.kind(), entry.name),
            None => "end of journal".to_string(),
        };
        DurableError::NonDeterminism(format!(
            "command {} of invocation {}: code asked for {expected}, journal has {found}",
            self.cursor, self.invocation_id
        ))
    }

    /// Append a new entry at the next sequence number
    pub(crate) async fn append(
        &mut self,
        name: &str,
        payload: EntryPayload,
    ) -> Result<(), DurableError> {
        let entry = JournalEntry::new(self.next_seq, name, payload, self.services.clock.now());
        let seq = self
            .services
            .store
            .append(self.invocation_id, entry)
            .await?;
        trace!(invocation_id = %self.invocation_id, seq, %name, "journaled");
        self.next_seq = seq + 1;
        Ok(())
    }
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("invocation_id", &self.invocation_id)
            .field("workflow_type", &self.workflow_type)
            .field("attempt", &self.attempt)
            .field("cursor", &self.cursor)
            .field("commands", &self.commands.len())
            .field("next_seq", &self.next_seq)
            .finish()
    }
}
