//! PostgreSQL implementation of JournalStore
//!
//! Journals live in `durable_journal_entries`, keyed by
//! `(invocation_id, seq)`. The primary key is the arbiter for concurrent
//! appends: the second writer of a sequence number gets a unique violation,
//! reported as a concurrency conflict.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::{JournalStore, StoreError};
use super::JournalEntry;

const UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL implementation of JournalStore
///
/// # Example
///
/// ```ignore
/// use hammond_durable::PostgresJournalStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/hammond").await?;
/// let store = PostgresJournalStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresJournalStore {
    pool: PgPool,
}

impl PostgresJournalStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `url`
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url).await.map_err(|e| {
            error!("Failed to connect to journal database: {}", e);
            map_sqlx_error(e)
        })?;
        Ok(Self::new(pool))
    }

    /// Apply the journal schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to migrate journal schema: {}", e);
                StoreError::Database(e.to_string())
            })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn current_holder(
        &self,
        invocation_id: Uuid,
    ) -> Result<(String, DateTime<Utc>), StoreError> {
        let row = sqlx::query(
            r#"
            SELECT owner, expires_at FROM durable_invocation_leases WHERE invocation_id = $1
            "#,
        )
        .bind(invocation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        // Released in between: report it as free from now on
        Ok(row
            .map(|r| (r.get::<String, _>("owner"), r.get("expires_at")))
            .unwrap_or_else(|| ("unknown".to_string(), Utc::now())))
    }
}

#[async_trait]
impl JournalStore for PostgresJournalStore {
    #[instrument(skip(self, entry), fields(seq = entry.seq, kind = %entry.kind()))]
    async fn append(&self, invocation_id: Uuid, entry: JournalEntry) -> Result<u64, StoreError> {
        let payload = serde_json::to_value(&entry.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let seq = entry.seq as i64;

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS next_seq
            FROM durable_journal_entries
            WHERE invocation_id = $1
            "#,
        )
        .bind(invocation_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let next_seq: i64 = row.get("next_seq");
        if next_seq != seq {
            return Err(StoreError::ConcurrencyConflict {
                expected: next_seq as u64,
                actual: entry.seq,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO durable_journal_entries (invocation_id, seq, name, kind, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(invocation_id)
        .bind(seq)
        .bind(&entry.name)
        .bind(entry.kind().as_str())
        .bind(&payload)
        .bind(entry.timestamp)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                // The winner took `seq`, so the journal is at least one longer
                StoreError::ConcurrencyConflict {
                    expected: entry.seq + 1,
                    actual: entry.seq,
                }
            } else {
                error!("Failed to append journal entry: {}", e);
                map_sqlx_error(e)
            }
        })?;

        tx.commit().await.map_err(|e| {
            if is_unique_violation(&e) {
                // The winner took `seq`, so the journal is at least one longer
                StoreError::ConcurrencyConflict {
                    expected: entry.seq + 1,
                    actual: entry.seq,
                }
            } else {
                map_sqlx_error(e)
            }
        })?;

        debug!(%invocation_id, seq, "appended journal entry");
        Ok(entry.seq)
    }

    #[instrument(skip(self))]
    async fn read_all(&self, invocation_id: Uuid) -> Result<Vec<JournalEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT seq, name, payload, created_at
            FROM durable_journal_entries
            WHERE invocation_id = $1
            ORDER BY seq
            "#,
        )
        .bind(invocation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load journal: {}", e);
            map_sqlx_error(e)
        })?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row.get("seq");
            let payload: serde_json::Value = row.get("payload");
            let timestamp: DateTime<Utc> = row.get("created_at");
            let payload = serde_json::from_value(payload)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            entries.push(JournalEntry::new(
                seq as u64,
                row.get::<String, _>("name"),
                payload,
                timestamp,
            ));
        }

        Ok(entries)
    }

    #[instrument(skip(self))]
    async fn list_invocations(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT invocation_id
            FROM durable_journal_entries
            ORDER BY invocation_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list invocations: {}", e);
            map_sqlx_error(e)
        })?;

        Ok(rows.iter().map(|r| r.get("invocation_id")).collect())
    }

    #[instrument(skip(self))]
    async fn acquire_lease(
        &self,
        invocation_id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = now
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        // The conditional upsert only takes over a lease that is ours or expired
        let acquired = sqlx::query(
            r#"
            INSERT INTO durable_invocation_leases (invocation_id, owner, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (invocation_id) DO UPDATE
            SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
            WHERE durable_invocation_leases.owner = EXCLUDED.owner
               OR durable_invocation_leases.expires_at <= $4
            RETURNING owner
            "#,
        )
        .bind(invocation_id)
        .bind(owner)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to acquire lease: {}", e);
            map_sqlx_error(e)
        })?;

        if acquired.is_none() {
            let (holder, expires_at) = self.current_holder(invocation_id).await?;
            return Err(StoreError::LeaseConflict {
                invocation_id,
                holder,
                expires_at,
            });
        }

        debug!(%invocation_id, %owner, "acquired lease");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, invocation_id: Uuid, owner: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM durable_invocation_leases
            WHERE invocation_id = $1 AND owner = $2
            "#,
        )
        .bind(invocation_id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to release lease: {}", e);
            map_sqlx_error(e)
        })?;

        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION)
}

/// Connection-level failures are transient; everything else is a database error
fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        other => StoreError::Database(other.to_string()),
    }
}
