//! In-memory implementation of JournalStore for testing

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::{JournalStore, StoreError};
use super::JournalEntry;

/// Lease held on an invocation
struct Lease {
    owner: String,
    expires_at: DateTime<Utc>,
}

/// In-memory implementation of JournalStore
///
/// Provides the same append semantics as the PostgreSQL implementation.
/// Everything is lost when the store is dropped; a "restart" in tests means
/// building a new driver over the same store.
///
/// # Example
///
/// ```
/// use hammond_durable::InMemoryJournalStore;
///
/// let store = InMemoryJournalStore::new();
/// assert_eq!(store.invocation_count(), 0);
/// ```
pub struct InMemoryJournalStore {
    journals: RwLock<HashMap<Uuid, Vec<JournalEntry>>>,
    leases: RwLock<HashMap<Uuid, Lease>>,
}

impl InMemoryJournalStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            journals: RwLock::new(HashMap::new()),
            leases: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of invocations with a journal
    pub fn invocation_count(&self) -> usize {
        self.journals.read().len()
    }

    /// Get the number of entries in an invocation's journal
    pub fn entry_count(&self, invocation_id: Uuid) -> usize {
        self.journals
            .read()
            .get(&invocation_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.journals.write().clear();
        self.leases.write().clear();
    }
}

impl Default for InMemoryJournalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JournalStore for InMemoryJournalStore {
    async fn append(&self, invocation_id: Uuid, entry: JournalEntry) -> Result<u64, StoreError> {
        let mut journals = self.journals.write();
        let journal = journals.entry(invocation_id).or_default();

        let next = journal.len() as u64;
        if entry.seq != next {
            return Err(StoreError::ConcurrencyConflict {
                expected: next,
                actual: entry.seq,
            });
        }

        journal.push(entry);
        Ok(next)
    }

    async fn read_all(&self, invocation_id: Uuid) -> Result<Vec<JournalEntry>, StoreError> {
        Ok(self
            .journals
            .read()
            .get(&invocation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_invocations(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut ids: Vec<Uuid> = self.journals.read().keys().copied().collect();
        // v7 ids sort by creation time
        ids.sort();
        Ok(ids)
    }

    async fn acquire_lease(
        &self,
        invocation_id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut leases = self.leases.write();

        if let Some(lease) = leases.get(&invocation_id) {
            if lease.owner != owner && lease.expires_at > now {
                return Err(StoreError::LeaseConflict {
                    invocation_id,
                    holder: lease.owner.clone(),
                    expires_at: lease.expires_at,
                });
            }
        }

        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        leases.insert(
            invocation_id,
            Lease {
                owner: owner.to_string(),
                expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            },
        );
        Ok(())
    }

    async fn release_lease(&self, invocation_id: Uuid, owner: &str) -> Result<(), StoreError> {
        let mut leases = self.leases.write();
        if leases
            .get(&invocation_id)
            .is_some_and(|lease| lease.owner == owner)
        {
            leases.remove(&invocation_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::EntryPayload;
    use serde_json::json;

    fn created(seq: u64) -> JournalEntry {
        JournalEntry::new(
            seq,
            "greeter",
            EntryPayload::InvocationCreated {
                workflow_type: "greeter".into(),
                input: json!({"name": "Alice"}),
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let store = InMemoryJournalStore::new();
        let id = Uuid::now_v7();

        assert_eq!(store.append(id, created(0)).await.unwrap(), 0);
        let entries = store.read_all(id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(store.entry_count(id), 1);
        assert_eq!(store.list_invocations().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_read_unknown_is_empty() {
        let store = InMemoryJournalStore::new();
        assert!(store.read_all(Uuid::now_v7()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_sequence_conflicts() {
        let store = InMemoryJournalStore::new();
        let id = Uuid::now_v7();
        store.append(id, created(0)).await.unwrap();

        let err = store.append(id, created(0)).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::ConcurrencyConflict {
                expected: 1,
                actual: 0
            }
        ));
        assert_eq!(
            err.to_string(),
            "concurrency conflict: expected sequence 1, got 0"
        );

        // Gaps are rejected too
        let result = store.append(id, created(5)).await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict {
                expected: 1,
                actual: 5
            })
        ));
        assert_eq!(store.entry_count(id), 1);
    }

    #[tokio::test]
    async fn test_lease_exclusive_until_released() {
        let store = InMemoryJournalStore::new();
        let id = Uuid::now_v7();
        let ttl = Duration::from_secs(30);

        store.acquire_lease(id, "a", ttl).await.unwrap();
        // Renewal by the holder succeeds
        store.acquire_lease(id, "a", ttl).await.unwrap();

        let err = store.acquire_lease(id, "b", ttl).await.unwrap_err();
        assert!(err.is_conflict());
        let StoreError::LeaseConflict {
            holder, expires_at, ..
        } = err
        else {
            panic!("expected a lease conflict, got {err:?}");
        };
        assert_eq!(holder, "a");
        assert!(expires_at > Utc::now());

        // Release by a non-holder is ignored
        store.release_lease(id, "b").await.unwrap();
        assert!(store.acquire_lease(id, "b", ttl).await.is_err());

        store.release_lease(id, "a").await.unwrap();
        store.acquire_lease(id, "b", ttl).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let store = InMemoryJournalStore::new();
        let id = Uuid::now_v7();

        store.acquire_lease(id, "a", Duration::ZERO).await.unwrap();
        store
            .acquire_lease(id, "b", Duration::from_secs(30))
            .await
            .unwrap();
    }
}
