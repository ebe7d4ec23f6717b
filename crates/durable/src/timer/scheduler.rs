//! Wake-up scheduling for suspended invocations
//!
//! A suspended invocation holds no task or thread. All that remains of it is
//! the journal plus a wake-up registered here; when the wake-up is due the
//! driver resumes the invocation and replay carries it past the timer.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

/// Errors from wake-up scheduling
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The scheduler cannot accept wake-ups (e.g. it was shut down)
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),
}

/// Registers future wake-ups for invocations
///
/// Registering again for the same invocation replaces the earlier wake-up,
/// so re-suspending on replay never produces a duplicate.
#[async_trait]
pub trait WakeupScheduler: Send + Sync + 'static {
    /// Arrange for `invocation_id` to be resumed at or after `fire_at`
    async fn register_wakeup(
        &self,
        invocation_id: Uuid,
        fire_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError>;

    /// Drop any pending wake-up for `invocation_id`
    async fn cancel_wakeup(&self, invocation_id: Uuid) -> Result<(), SchedulerError>;
}

/// Wake-up table polled by the caller
///
/// Records the latest requested wake-up per invocation. Nothing fires on its
/// own; callers drain due entries with [`InMemoryWakeups::take_due`].
#[derive(Debug, Default)]
pub struct InMemoryWakeups {
    pending: DashMap<Uuid, DateTime<Utc>>,
}

impl InMemoryWakeups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending wake-up time for an invocation
    pub fn pending(&self, invocation_id: Uuid) -> Option<DateTime<Utc>> {
        self.pending.get(&invocation_id).map(|at| *at)
    }

    /// Number of pending wake-ups
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remove and return every invocation due at `now`, earliest first
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut due: Vec<(DateTime<Utc>, Uuid)> = self
            .pending
            .iter()
            .filter(|entry| *entry.value() <= now)
            .map(|entry| (*entry.value(), *entry.key()))
            .collect();
        due.sort();

        due.into_iter()
            .filter_map(|(at, id)| self.pending.remove_if(&id, |_, v| *v == at).map(|(id, _)| id))
            .collect()
    }

    /// Earliest pending wake-up
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.pending.iter().map(|entry| *entry.value()).min()
    }
}

#[async_trait]
impl WakeupScheduler for InMemoryWakeups {
    async fn register_wakeup(
        &self,
        invocation_id: Uuid,
        fire_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.pending.insert(invocation_id, fire_at);
        Ok(())
    }

    async fn cancel_wakeup(&self, invocation_id: Uuid) -> Result<(), SchedulerError> {
        self.pending.remove(&invocation_id);
        Ok(())
    }
}

/// One queued wake-up, ordered by due time
#[derive(Debug)]
struct Wakeup {
    fire_at: DateTime<Utc>,
    invocation_id: Uuid,
}

impl Ord for Wakeup {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then_with(|| self.invocation_id.cmp(&other.invocation_id))
    }
}

impl PartialOrd for Wakeup {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Wakeup {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Wakeup {}

/// Min-heap of wake-ups
#[derive(Debug, Default)]
struct TimerQueue {
    heap: BinaryHeap<Reverse<Wakeup>>,
    // Latest registration per invocation; heap entries that disagree are stale
    current: HashMap<Uuid, DateTime<Utc>>,
}

impl TimerQueue {
    fn schedule(&mut self, invocation_id: Uuid, fire_at: DateTime<Utc>) {
        self.current.insert(invocation_id, fire_at);
        self.heap.push(Reverse(Wakeup {
            fire_at,
            invocation_id,
        }));
    }

    fn cancel(&mut self, invocation_id: Uuid) {
        self.current.remove(&invocation_id);
    }

    fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|Reverse(wakeup)| wakeup.fire_at)
    }

    fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut due = Vec::new();
        while self
            .heap
            .peek()
            .is_some_and(|Reverse(wakeup)| wakeup.fire_at <= now)
        {
            let Some(Reverse(wakeup)) = self.heap.pop() else {
                break;
            };
            if self.current.get(&wakeup.invocation_id) == Some(&wakeup.fire_at) {
                self.current.remove(&wakeup.invocation_id);
                due.push(wakeup.invocation_id);
            }
        }
        due
    }
}

#[derive(Debug)]
enum Command {
    Register(Uuid, DateTime<Utc>),
    Cancel(Uuid),
}

/// Wake-up scheduler backed by a background tokio task
///
/// The task keeps a timer queue and sends each invocation id on the
/// returned channel when its wake-up is due. Feed the receiver to
/// [`WorkflowDriver::serve_wakeups`](crate::WorkflowDriver::serve_wakeups).
#[derive(Debug, Clone)]
pub struct TokioWakeupScheduler {
    commands: mpsc::UnboundedSender<Command>,
}

impl TokioWakeupScheduler {
    /// Spawn the timer task; it runs until `shutdown` is cancelled
    pub fn spawn(shutdown: CancellationToken) -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_timer_loop(command_rx, due_tx, shutdown));
        (Self { commands }, due_rx)
    }

    fn send(&self, command: Command) -> Result<(), SchedulerError> {
        self.commands
            .send(command)
            .map_err(|_| SchedulerError::Unavailable("timer task has stopped".to_string()))
    }
}

#[async_trait]
impl WakeupScheduler for TokioWakeupScheduler {
    async fn register_wakeup(
        &self,
        invocation_id: Uuid,
        fire_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.send(Command::Register(invocation_id, fire_at))
    }

    async fn cancel_wakeup(&self, invocation_id: Uuid) -> Result<(), SchedulerError> {
        self.send(Command::Cancel(invocation_id))
    }
}

async fn run_timer_loop(
    mut commands: mpsc::UnboundedReceiver<Command>,
    due: mpsc::UnboundedSender<Uuid>,
    shutdown: CancellationToken,
) {
    let mut queue = TimerQueue::default();

    loop {
        let sleep = match queue.next_deadline() {
            Some(deadline) => (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            // Nothing queued; wait for a command
            None => Duration::from_secs(3600),
        };

        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("wake-up scheduler shutting down");
                return;
            }
            command = commands.recv() => match command {
                Some(Command::Register(id, at)) => {
                    trace!(invocation_id = %id, fire_at = %at, "wake-up registered");
                    queue.schedule(id, at);
                }
                Some(Command::Cancel(id)) => queue.cancel(id),
                None => return,
            },
            _ = tokio::time::sleep(sleep) => {}
        }

        for invocation_id in queue.pop_due(Utc::now()) {
            debug!(%invocation_id, "wake-up due");
            if due.send(invocation_id).is_err() {
                return;
            }
        }
    }
}
