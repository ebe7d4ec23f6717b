//! # Durable Execution Core
//!
//! A journal-backed execution core for workflows whose side effects must
//! run at most once and survive crashes, restarts and transient failures.
//!
//! ## Features
//!
//! - **Append-only journals**: every decision an invocation makes is an
//!   immutable journal entry; state is rebuilt by folding the journal
//! - **At-most-once steps**: named side effects run once and are replayed
//!   from the journal on every later execution
//! - **Durable timers**: sleeps survive restarts and never fire twice
//! - **Journaled non-determinism**: identifiers, time and randomness come
//!   from the journal on replay
//! - **Failure classification**: transient failures retry the whole
//!   invocation with backoff; terminal ones end it
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowDriver                          │
//! │  (leases, replay, failure classification, retries)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    InvocationContext                         │
//! │  (replay cursor: run / sleep / uuid / now / rng)            │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                              │
//!                 ▼                              ▼
//! ┌───────────────────────────────┐ ┌───────────────────────────┐
//! │         JournalStore          │ │      WakeupScheduler      │
//! │  (in-memory or PostgreSQL)    │ │  (resumes due timers)     │
//! └───────────────────────────────┘ └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use hammond_durable::prelude::*;
//!
//! struct OrderWorkflow;
//!
//! #[async_trait]
//! impl Workflow for OrderWorkflow {
//!     const TYPE: &'static str = "order_workflow";
//!     type Input = Order;
//!     type Output = Receipt;
//!
//!     async fn run(&self, ctx: &mut InvocationContext, order: Order) -> Result<Receipt, DurableError> {
//!         let charge_id: String = ctx.run("charge", || async { charge(&order).await }).await?;
//!         ctx.sleep(Duration::from_secs(3600)).await?;
//!         ctx.run("ship", || async { ship(&order).await }).await?;
//!         Ok(Receipt { charge_id })
//!     }
//! }
//!
//! let mut driver = WorkflowDriver::new(InMemoryJournalStore::new());
//! driver.register(|| OrderWorkflow);
//! let report = driver.invoke_and_wait::<OrderWorkflow>(None, order).await?;
//! ```

pub mod context;
pub mod engine;
pub mod journal;
pub mod reliability;
pub mod step;
pub mod timer;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use async_trait::async_trait;

    pub use crate::context::InvocationContext;
    pub use crate::engine::{
        DriverConfig, DriverError, FailureClassifier, InvocationOutcome, InvocationReport,
        UserErrorPolicy, WorkflowDriver, WorkflowRegistry,
    };
    pub use crate::journal::{
        InMemoryJournalStore, InvocationSnapshot, InvocationStatus, JournalStore,
        PostgresJournalStore, StoreError,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::step::ActionError;
    pub use crate::timer::{
        Clock, InMemoryWakeups, ManualClock, SystemClock, TokioWakeupScheduler, WakeupScheduler,
    };
    pub use crate::workflow::{error_codes, DurableError, Workflow, WorkflowError};
}

// Re-export key types at crate root
pub use context::{ContextServices, InvocationContext};
pub use engine::{
    DriverConfig, DriverError, FailureClass, FailureClassifier, InvocationOutcome,
    InvocationReport, RegistryError, UserErrorPolicy, WorkflowDriver, WorkflowRegistry,
};
pub use journal::{
    EntryKind, EntryPayload, InMemoryJournalStore, InvocationSnapshot, InvocationStatus,
    JournalEntry, JournalStore, PostgresJournalStore, StoreError,
};
pub use reliability::RetryPolicy;
pub use step::{ActionError, StepOutcome};
pub use timer::{
    Clock, InMemoryWakeups, ManualClock, SchedulerError, SystemClock, TokioWakeupScheduler,
    WakeupScheduler,
};
pub use workflow::{error_codes, DurableError, Workflow, WorkflowError};
