//! Folding a journal into invocation state
//!
//! Nothing about an invocation is stored outside its journal. Status, result
//! and the replay cursor's command list are all derived here by folding the
//! entries in sequence order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{EntryKind, EntryPayload, InvocationStatus, JournalEntry};
use crate::workflow::WorkflowError;

/// Point-in-time view of an invocation, derived from its journal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvocationSnapshot {
    pub invocation_id: Uuid,
    pub workflow_type: String,
    pub input: Value,
    pub status: InvocationStatus,
    /// Current attempt number (1-based)
    pub attempt: u32,
    pub output: Option<Value>,
    pub error: Option<WorkflowError>,
    pub cancel_reason: Option<String>,
    /// Due time of an armed timer that has not fired yet
    pub pending_timer: Option<DateTime<Utc>>,
    pub entry_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InvocationSnapshot {
    /// Fold a journal into a snapshot
    ///
    /// Returns `None` when the journal does not start with an
    /// `InvocationCreated` entry (including the empty journal).
    pub fn fold(invocation_id: Uuid, entries: &[JournalEntry]) -> Option<Self> {
        let (first, rest) = entries.split_first()?;
        let EntryPayload::InvocationCreated {
            workflow_type,
            input,
        } = &first.payload
        else {
            return None;
        };

        let mut snapshot = Self {
            invocation_id,
            workflow_type: workflow_type.clone(),
            input: input.clone(),
            status: InvocationStatus::Created,
            attempt: 1,
            output: None,
            error: None,
            cancel_reason: None,
            pending_timer: None,
            entry_count: entries.len(),
            created_at: first.timestamp,
            updated_at: first.timestamp,
        };

        for entry in rest {
            snapshot.updated_at = entry.timestamp;
            // Terminal entries are final; anything after them is ignored
            if snapshot.status.is_terminal() {
                continue;
            }

            match &entry.payload {
                EntryPayload::InvocationCreated { .. } => {}
                EntryPayload::StepResult { .. } => {
                    snapshot.status = InvocationStatus::Running;
                }
                EntryPayload::TimerArmed { fire_at, .. } => {
                    snapshot.status = InvocationStatus::Suspended;
                    snapshot.pending_timer = Some(*fire_at);
                }
                EntryPayload::TimerFired { .. } => {
                    snapshot.status = InvocationStatus::Running;
                    snapshot.pending_timer = None;
                }
                EntryPayload::AttemptFailed { attempt, error, .. } => {
                    snapshot.attempt = attempt + 1;
                    snapshot.error = Some(error.clone());
                    // A retry replays from the top; an armed timer stays pending
                    if snapshot.pending_timer.is_none() {
                        snapshot.status = InvocationStatus::Running;
                    }
                }
                EntryPayload::InvocationCancelled { reason } => {
                    snapshot.status = InvocationStatus::Cancelled;
                    snapshot.cancel_reason = Some(reason.clone());
                    snapshot.pending_timer = None;
                }
                EntryPayload::InvocationCompleted { output } => {
                    snapshot.status = InvocationStatus::Completed;
                    snapshot.output = Some(output.clone());
                    snapshot.error = None;
                    snapshot.pending_timer = None;
                }
                EntryPayload::InvocationFailed { error } => {
                    snapshot.status = InvocationStatus::Failed;
                    snapshot.error = Some(error.clone());
                    snapshot.pending_timer = None;
                }
            }
        }

        Some(snapshot)
    }

    /// Check if no further execution will happen
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// The commands a fresh attempt replays, in order
///
/// Commands are the entries produced by workflow code (step results and
/// timers). A step named in an `AttemptFailed` marker loses its failed
/// result, so the next attempt runs that step live again.
#[derive(Debug, Clone, Default)]
pub struct ReplayLog {
    commands: Vec<JournalEntry>,
    next_seq: u64,
    attempt: u32,
}

impl ReplayLog {
    /// Build the replay log from a full journal
    pub fn from_entries(entries: &[JournalEntry]) -> Self {
        let mut commands: Vec<JournalEntry> = Vec::new();
        let mut attempt = 1;

        for entry in entries {
            match &entry.payload {
                EntryPayload::AttemptFailed {
                    attempt: failed,
                    voided_step,
                    ..
                } => {
                    attempt = failed + 1;
                    if let Some(step) = voided_step {
                        void_last_failure(&mut commands, step);
                    }
                }
                _ if entry.kind().is_command() => commands.push(entry.clone()),
                _ => {}
            }
        }

        Self {
            commands,
            next_seq: entries.len() as u64,
            attempt,
        }
    }

    /// Effective commands in replay order
    pub fn commands(&self) -> &[JournalEntry] {
        &self.commands
    }

    /// Sequence number the next appended entry must carry
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Attempt number of the execution replaying this log
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn into_commands(self) -> Vec<JournalEntry> {
        self.commands
    }
}

/// Drop the failed result of `step` if it is the last command
///
/// Only the trailing command can be voided: removing an entry from the middle
/// would shift every later command and break positional replay.
fn void_last_failure(commands: &mut Vec<JournalEntry>, step: &str) {
    let is_failed_step = commands.last().is_some_and(|entry| {
        entry.name == step
            && matches!(&entry.payload, EntryPayload::StepResult { outcome } if outcome.is_failure())
    });
    if is_failed_step {
        commands.pop();
    }
}

/// Terminal entry kind of a journal, if any
pub fn terminal_kind(entries: &[JournalEntry]) -> Option<EntryKind> {
    entries.iter().map(JournalEntry::kind).find(EntryKind::is_terminal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{ActionError, StepOutcome};
    use serde_json::json;

    fn entry(seq: u64, name: &str, payload: EntryPayload) -> JournalEntry {
        JournalEntry::new(seq, name, payload, Utc::now())
    }

    fn created() -> JournalEntry {
        entry(
            0,
            "greeter",
            EntryPayload::InvocationCreated {
                workflow_type: "greeter".into(),
                input: json!({"name": "Alice"}),
            },
        )
    }

    fn step_ok(seq: u64, name: &str) -> JournalEntry {
        entry(
            seq,
            name,
            EntryPayload::StepResult {
                outcome: StepOutcome::Success { value: json!(name) },
            },
        )
    }

    fn step_failed(seq: u64, name: &str) -> JournalEntry {
        entry(
            seq,
            name,
            EntryPayload::StepResult {
                outcome: StepOutcome::Failure {
                    error: ActionError::retryable("boom"),
                },
            },
        )
    }

    fn attempt_failed(seq: u64, attempt: u32, voided: Option<&str>) -> JournalEntry {
        entry(
            seq,
            "greeter",
            EntryPayload::AttemptFailed {
                attempt,
                error: WorkflowError::retryable("boom"),
                voided_step: voided.map(String::from),
            },
        )
    }

    #[test]
    fn test_fold_empty_is_none() {
        assert!(InvocationSnapshot::fold(Uuid::now_v7(), &[]).is_none());
        assert!(InvocationSnapshot::fold(Uuid::now_v7(), &[step_ok(0, "a")]).is_none());
    }

    #[test]
    fn test_fold_created() {
        let snapshot = InvocationSnapshot::fold(Uuid::now_v7(), &[created()]).unwrap();
        assert_eq!(snapshot.status, InvocationStatus::Created);
        assert_eq!(snapshot.workflow_type, "greeter");
        assert_eq!(snapshot.attempt, 1);
    }

    #[test]
    fn test_fold_suspended_then_running() {
        let fire_at = Utc::now();
        let mut entries = vec![
            created(),
            step_ok(1, "notification"),
            entry(
                2,
                "sleep-0",
                EntryPayload::TimerArmed {
                    fire_at,
                    duration_ms: 1000,
                },
            ),
        ];

        let snapshot = InvocationSnapshot::fold(Uuid::now_v7(), &entries).unwrap();
        assert_eq!(snapshot.status, InvocationStatus::Suspended);
        assert_eq!(snapshot.pending_timer, Some(fire_at));

        entries.push(entry(3, "sleep-0", EntryPayload::TimerFired { fire_at }));
        let snapshot = InvocationSnapshot::fold(Uuid::now_v7(), &entries).unwrap();
        assert_eq!(snapshot.status, InvocationStatus::Running);
        assert_eq!(snapshot.pending_timer, None);
    }

    #[test]
    fn test_fold_terminal_is_final() {
        let entries = vec![
            created(),
            entry(
                1,
                "greeter",
                EntryPayload::InvocationCompleted {
                    output: json!("done"),
                },
            ),
            step_ok(2, "late"),
        ];

        let snapshot = InvocationSnapshot::fold(Uuid::now_v7(), &entries).unwrap();
        assert_eq!(snapshot.status, InvocationStatus::Completed);
        assert_eq!(snapshot.output, Some(json!("done")));
        assert_eq!(terminal_kind(&entries), Some(EntryKind::InvocationCompleted));
    }

    #[test]
    fn test_fold_counts_attempts() {
        let entries = vec![
            created(),
            step_failed(1, "b"),
            attempt_failed(2, 1, Some("b")),
        ];

        let snapshot = InvocationSnapshot::fold(Uuid::now_v7(), &entries).unwrap();
        assert_eq!(snapshot.attempt, 2);
        assert_eq!(snapshot.status, InvocationStatus::Running);
        assert!(snapshot.error.is_some());
    }

    #[test]
    fn test_replay_log_voids_trailing_failure() {
        let entries = vec![
            created(),
            step_ok(1, "a"),
            step_failed(2, "b"),
            attempt_failed(3, 1, Some("b")),
        ];

        let log = ReplayLog::from_entries(&entries);
        assert_eq!(log.next_seq(), 4);
        assert_eq!(log.attempt(), 2);
        let names: Vec<_> = log.commands().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn test_replay_log_keeps_successes_and_inner_failures() {
        // "b" failed but the body handled it and "c" failed the attempt
        let entries = vec![
            created(),
            step_failed(1, "b"),
            step_ok(2, "a"),
            attempt_failed(3, 1, Some("b")),
        ];

        let log = ReplayLog::from_entries(&entries);
        assert_eq!(log.commands().len(), 2);
    }
}
