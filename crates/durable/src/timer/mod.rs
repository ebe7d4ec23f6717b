//! Durable timers
//!
//! `InvocationContext::sleep` plus the clocks and wake-up schedulers it runs
//! against.

mod clock;
mod durable;
mod scheduler;

pub use clock::{Clock, ManualClock, SystemClock};
pub use scheduler::{InMemoryWakeups, SchedulerError, TokioWakeupScheduler, WakeupScheduler};
