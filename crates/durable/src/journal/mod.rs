//! Append-only journal storage
//!
//! One journal per invocation. Entries are immutable once appended and
//! carry strictly increasing sequence numbers starting at 0.

mod entry;
mod memory;
mod postgres;
mod replay;
mod store;

pub use entry::{EntryKind, EntryPayload, JournalEntry};
pub use memory::InMemoryJournalStore;
pub use postgres::PostgresJournalStore;
pub use replay::{terminal_kind, InvocationSnapshot, ReplayLog};
pub use store::{InvocationStatus, JournalStore, StoreError};
