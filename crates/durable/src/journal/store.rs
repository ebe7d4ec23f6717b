//! JournalStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::JournalEntry;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Concurrency conflict (sequence number already taken or skipped)
    ///
    /// `expected` is the store's next sequence number, `actual` the one the
    /// writer tried to append.
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: u64, actual: u64 },

    /// Another owner holds the invocation's exclusivity lease
    #[error("invocation {invocation_id} is leased by {holder} until {expires_at}")]
    LeaseConflict {
        invocation_id: Uuid,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    /// Store temporarily unavailable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Check if this error means another writer won a race
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. } | Self::LeaseConflict { .. }
        )
    }
}

/// Invocation status, folded from the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    /// Invocation created but its body has not produced anything yet
    Created,

    /// Invocation is running (or was interrupted while running)
    Running,

    /// Invocation is waiting for a durable timer
    Suspended,

    /// Invocation completed successfully
    Completed,

    /// Invocation failed permanently
    Failed,

    /// Invocation was cancelled
    Cancelled,
}

impl InvocationStatus {
    /// Check if no further execution will happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Suspended => write!(f, "suspended"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Append-only store of per-invocation journals
///
/// Implementations must be thread-safe. `append` and `read_all` are atomic
/// per invocation; an append is acknowledged only once it is durable, so a
/// crash before acknowledgment is the same as the append never happening.
#[async_trait]
pub trait JournalStore: Send + Sync + 'static {
    /// Append an entry to an invocation's journal
    ///
    /// `entry.seq` must be exactly the next sequence number (the current
    /// journal length); anything else is a [`StoreError::ConcurrencyConflict`].
    /// Returns the sequence number of the appended entry.
    async fn append(&self, invocation_id: Uuid, entry: JournalEntry) -> Result<u64, StoreError>;

    /// Load all entries of an invocation in append order
    ///
    /// Returns an empty list for an invocation that was never started.
    async fn read_all(&self, invocation_id: Uuid) -> Result<Vec<JournalEntry>, StoreError>;

    /// List every invocation with at least one journal entry
    async fn list_invocations(&self) -> Result<Vec<Uuid>, StoreError>;

    /// Take the exclusivity lease for an invocation
    ///
    /// Succeeds if the lease is free, expired, or already held by `owner`
    /// (which renews it). Fails with [`StoreError::LeaseConflict`] otherwise.
    async fn acquire_lease(
        &self,
        invocation_id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Release a lease held by `owner` (no-op if not held by `owner`)
    async fn release_lease(&self, invocation_id: Uuid, owner: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        assert!(StoreError::ConcurrencyConflict {
            expected: 1,
            actual: 2
        }
        .is_conflict());
        assert!(StoreError::LeaseConflict {
            invocation_id: Uuid::now_v7(),
            holder: "driver-a".into(),
            expires_at: Utc::now(),
        }
        .is_conflict());
        assert!(!StoreError::Unavailable("down".into()).is_conflict());
        assert!(!StoreError::Database("syntax".into()).is_conflict());
    }

    #[test]
    fn test_status_terminal() {
        assert!(InvocationStatus::Completed.is_terminal());
        assert!(InvocationStatus::Cancelled.is_terminal());
        assert!(!InvocationStatus::Suspended.is_terminal());
        assert_eq!(InvocationStatus::Suspended.to_string(), "suspended");
    }
}
