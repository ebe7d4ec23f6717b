//! Journal entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::step::StepOutcome;
use crate::workflow::WorkflowError;

/// Kind of a journal entry, used for matching during replay and as the
/// `kind` column of persistent stores
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    InvocationCreated,
    StepResult,
    TimerArmed,
    TimerFired,
    AttemptFailed,
    InvocationCancelled,
    InvocationCompleted,
    InvocationFailed,
}

impl EntryKind {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvocationCreated => "invocation_created",
            Self::StepResult => "step_result",
            Self::TimerArmed => "timer_armed",
            Self::TimerFired => "timer_fired",
            Self::AttemptFailed => "attempt_failed",
            Self::InvocationCancelled => "invocation_cancelled",
            Self::InvocationCompleted => "invocation_completed",
            Self::InvocationFailed => "invocation_failed",
        }
    }

    /// Entries produced by workflow code through the context, consumed in
    /// order by the replay cursor
    pub fn is_command(&self) -> bool {
        matches!(self, Self::StepResult | Self::TimerArmed | Self::TimerFired)
    }

    /// Entries after which nothing else may be appended
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InvocationCancelled | Self::InvocationCompleted | Self::InvocationFailed
        )
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a journal entry
///
/// Entries are immutable once appended. Invocation state is reconstructed by
/// folding all entries in sequence order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryPayload {
    /// Invocation was created with the given input
    InvocationCreated {
        /// Registered workflow type
        workflow_type: String,
        /// The input provided when triggering the invocation
        input: serde_json::Value,
    },

    /// A named step finished (successfully or not)
    StepResult {
        /// The journaled outcome
        outcome: StepOutcome,
    },

    /// A durable timer was armed
    TimerArmed {
        /// When the timer is due
        fire_at: DateTime<Utc>,
        /// Requested duration in milliseconds
        duration_ms: u64,
    },

    /// A durable timer fired
    TimerFired {
        /// When the timer was due
        fire_at: DateTime<Utc>,
    },

    /// An attempt failed transiently and the invocation will be retried
    AttemptFailed {
        /// Attempt number (1-based)
        attempt: u32,
        /// What failed
        error: WorkflowError,
        /// Step whose failed result is void for later attempts
        voided_step: Option<String>,
    },

    /// Invocation was cancelled
    InvocationCancelled {
        /// Reason for cancellation
        reason: String,
    },

    /// Invocation completed successfully
    InvocationCompleted {
        /// The workflow's return value
        output: serde_json::Value,
    },

    /// Invocation failed permanently
    InvocationFailed {
        /// Error details
        error: WorkflowError,
    },
}

impl EntryPayload {
    /// Kind of this payload
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::InvocationCreated { .. } => EntryKind::InvocationCreated,
            Self::StepResult { .. } => EntryKind::StepResult,
            Self::TimerArmed { .. } => EntryKind::TimerArmed,
            Self::TimerFired { .. } => EntryKind::TimerFired,
            Self::AttemptFailed { .. } => EntryKind::AttemptFailed,
            Self::InvocationCancelled { .. } => EntryKind::InvocationCancelled,
            Self::InvocationCompleted { .. } => EntryKind::InvocationCompleted,
            Self::InvocationFailed { .. } => EntryKind::InvocationFailed,
        }
    }
}

/// One record in an invocation's append-only journal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEntry {
    /// Sequence number, strictly increasing from 0 within an invocation
    pub seq: u64,

    /// Step or timer name; the workflow type for lifecycle entries
    pub name: String,

    /// What happened
    pub payload: EntryPayload,

    /// When the entry was produced
    pub timestamp: DateTime<Utc>,
}

impl JournalEntry {
    /// Create a new entry
    pub fn new(
        seq: u64,
        name: impl Into<String>,
        payload: EntryPayload,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            seq,
            name: name.into(),
            payload,
            timestamp,
        }
    }

    /// Kind of this entry
    pub fn kind(&self) -> EntryKind {
        self.payload.kind()
    }

    /// Check if this entry ends the invocation
    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_serialization_is_tagged() {
        let entry = JournalEntry::new(
            0,
            "greeter",
            EntryPayload::InvocationCreated {
                workflow_type: "greeter".into(),
                input: json!({"name": "Alice"}),
            },
            Utc::now(),
        );

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["payload"]["kind"], "invocation_created");

        let parsed: JournalEntry = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_kind_matches_payload() {
        let fired = EntryPayload::TimerFired {
            fire_at: Utc::now(),
        };
        assert_eq!(fired.kind(), EntryKind::TimerFired);
        assert_eq!(fired.kind().as_str(), "timer_fired");
    }

    #[test]
    fn test_command_and_terminal_kinds() {
        assert!(EntryKind::StepResult.is_command());
        assert!(EntryKind::TimerArmed.is_command());
        assert!(!EntryKind::AttemptFailed.is_command());
        assert!(!EntryKind::InvocationCreated.is_command());

        assert!(EntryKind::InvocationCancelled.is_terminal());
        assert!(EntryKind::InvocationFailed.is_terminal());
        assert!(!EntryKind::TimerFired.is_terminal());
    }
}
